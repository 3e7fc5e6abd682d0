//! Sliding-window rate limiter keyed by `(provider, model)`.
//!
//! The in-memory rings are authoritative within the process: requests and
//! token totals for the trailing minute, plus a request counter since local
//! midnight. Reservations hold estimated tokens against the `tpm` window
//! while a call is in flight and are replaced by actuals on commit; dropping
//! a reservation uncommitted releases the estimate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};

use crate::config::ModelSpec;

const MINUTE: Duration = Duration::from_secs(60);

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub enum Reserve {
    /// Admitted; commit the reservation with actual usage when done.
    Ready(Reservation),
    /// A window is full; retry after roughly this long.
    WaitHint(Duration),
    /// The request can never be admitted (zero limit).
    Exhausted(String),
}

/// Per-model window state.
#[derive(Debug, Default)]
struct Windows {
    /// Completion instants of requests admitted in the trailing minute.
    requests: VecDeque<Instant>,
    /// Committed token totals in the trailing minute.
    tokens: VecDeque<(Instant, u64)>,
    /// Estimated tokens of in-flight reservations, by reservation id.
    reserved: HashMap<u64, u64>,
    /// Day the `day_count` belongs to.
    day: Option<NaiveDate>,
    /// Requests admitted since local midnight.
    day_count: u32,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= MINUTE {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some((front, _)) = self.tokens.front() {
            if now.duration_since(*front) >= MINUTE {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
        let today = Local::now().date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_count = 0;
        }
    }

    fn tokens_in_flight(&self) -> u64 {
        self.tokens.iter().map(|(_, n)| n).sum::<u64>()
            + self.reserved.values().sum::<u64>()
    }
}

/// Process-wide limiter. Cloneable; clones share the same windows.
#[derive(Clone, Default)]
pub struct RateLimiter {
    shards: Arc<Mutex<HashMap<(String, String), Arc<Mutex<Windows>>>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, provider: &str, model: &str) -> Arc<Mutex<Windows>> {
        let mut shards = self.shards.lock().expect("limiter shard map poisoned");
        shards
            .entry((provider.to_string(), model.to_string()))
            .or_default()
            .clone()
    }

    /// Try to admit a request against the model's limits.
    pub fn reserve(&self, spec: &ModelSpec, estimated_tokens: u64) -> Reserve {
        let limits = spec.limits;
        let shard = self.shard(&spec.provider, &spec.model_id);
        let now = Instant::now();
        let mut windows = shard.lock().expect("limiter window poisoned");
        windows.prune(now);

        if let Some(rpm) = limits.rpm {
            if rpm == 0 {
                return Reserve::Exhausted("rpm limit is zero".to_string());
            }
            if windows.requests.len() as u32 >= rpm {
                let oldest = windows.requests.front().copied().unwrap_or(now);
                let wait = MINUTE.saturating_sub(now.duration_since(oldest));
                return Reserve::WaitHint(wait.max(Duration::from_millis(1)));
            }
        }

        if let Some(tpm) = limits.tpm {
            if tpm == 0 {
                return Reserve::Exhausted("tpm limit is zero".to_string());
            }
            if windows.tokens_in_flight() + estimated_tokens > tpm {
                let wait = windows
                    .tokens
                    .front()
                    .map(|(front, _)| MINUTE.saturating_sub(now.duration_since(*front)))
                    .unwrap_or(MINUTE);
                return Reserve::WaitHint(wait.max(Duration::from_millis(1)));
            }
        }

        if let Some(rpd) = limits.rpd {
            if rpd == 0 {
                return Reserve::Exhausted("rpd limit is zero".to_string());
            }
            if windows.day_count >= rpd {
                return Reserve::WaitHint(until_local_midnight());
            }
        }

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        windows.requests.push_back(now);
        windows.day_count += 1;
        windows.reserved.insert(id, estimated_tokens);

        Reserve::Ready(Reservation {
            shard: shard.clone(),
            id,
            committed: false,
        })
    }

    /// Committed request count in the trailing minute (test/inspection aid).
    pub fn requests_last_minute(&self, provider: &str, model: &str) -> usize {
        let shard = self.shard(provider, model);
        let mut windows = shard.lock().expect("limiter window poisoned");
        windows.prune(Instant::now());
        windows.requests.len()
    }
}

/// Time until the next local midnight, when the `rpd` window resets.
fn until_local_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time");
    match midnight.and_local_timezone(Local).earliest() {
        Some(dt) => (dt - now).to_std().unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(3600),
    }
}

/// An admitted slot. Commit it with actual usage once the call completes;
/// dropping it uncommitted releases the reserved tokens.
#[derive(Debug)]
pub struct Reservation {
    shard: Arc<Mutex<Windows>>,
    id: u64,
    committed: bool,
}

impl Reservation {
    /// Replace the reserved estimate with the call's actual token total.
    pub fn commit(mut self, actual_tokens: u64) {
        let mut windows = self.shard.lock().expect("limiter window poisoned");
        windows.reserved.remove(&self.id);
        if actual_tokens > 0 {
            windows.tokens.push_back((Instant::now(), actual_tokens));
        }
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            if let Ok(mut windows) = self.shard.lock() {
                windows.reserved.remove(&self.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
