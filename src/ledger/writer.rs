//! Single-writer ingest worker.
//!
//! Producers enqueue events into a bounded in-memory queue; one background
//! task drains it, batching events into a single transaction when the batch
//! reaches [`BATCH_SIZE`] or [`FLUSH_INTERVAL`] has elapsed since the first
//! buffered event. Failed batches are retried with back-off; persistent
//! failure marks the ledger degraded and drops the batch rather than failing
//! the calling request.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{Connection, params};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use super::LedgerEvent;

/// Maximum number of queued events before the overflow policy kicks in.
pub(crate) const QUEUE_CAPACITY: usize = 10_000;

/// Maximum events per transaction.
pub(crate) const BATCH_SIZE: usize = 100;

/// Flush deadline measured from the first event buffered into a batch.
pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Transaction attempts before a batch is abandoned.
const WRITE_RETRIES: u32 = 3;

/// A queued event plus an optional durability acknowledgement channel.
pub(crate) struct Envelope {
    pub event: LedgerEvent,
    pub done: Option<oneshot::Sender<()>>,
}

/// Result of an enqueue attempt.
pub(crate) enum EnqueueOutcome {
    Queued,
    /// The queue is saturated with terminal events and cannot admit this
    /// one; the caller must write it synchronously.
    Rejected(Envelope),
}

/// Shared state between producers and the writer task.
pub(crate) struct Queue {
    inner: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    shutdown: AtomicBool,
    degraded: AtomicBool,
    dropped: AtomicU64,
}

impl Queue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            shutdown: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue with a drop-oldest-non-terminal overflow policy.
    /// Terminal events (`commit`/`cancel`) are never dropped: when no
    /// non-terminal event can be evicted, a terminal event is handed back to
    /// the producer for a synchronous write.
    pub(crate) fn push(&self, envelope: Envelope) -> EnqueueOutcome {
        let mut queue = self.inner.lock().expect("ledger queue mutex poisoned");
        if queue.len() >= self.capacity {
            if let Some(pos) = queue.iter().position(|e| !e.event.is_terminal()) {
                queue.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if envelope.event.is_terminal() {
                return EnqueueOutcome::Rejected(envelope);
            } else {
                // Queue full of terminal events; the newcomer is the one
                // non-terminal event in sight, so it is the one to drop.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return EnqueueOutcome::Queued;
            }
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    /// Move up to `limit - batch.len()` queued envelopes into `batch`.
    fn take_into(&self, batch: &mut Vec<Envelope>, limit: usize) -> usize {
        let mut queue = self.inner.lock().expect("ledger queue mutex poisoned");
        let mut taken = 0;
        while batch.len() < limit {
            match queue.pop_front() {
                Some(envelope) => {
                    batch.push(envelope);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Drain every queued envelope, regardless of batch size.
    pub(crate) fn drain_all(&self) -> Vec<Envelope> {
        let mut queue = self.inner.lock().expect("ledger queue mutex poisoned");
        queue.drain(..).collect()
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Spawn the writer task. It exits after [`Queue::begin_shutdown`] once the
/// queue has been drained.
pub(crate) fn spawn_writer(
    mut conn: Connection,
    queue: std::sync::Arc<Queue>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut batch: Vec<Envelope> = Vec::with_capacity(BATCH_SIZE);

        loop {
            // Wait for the first event of the next batch.
            while queue.take_into(&mut batch, BATCH_SIZE) == 0 {
                if queue.is_shutdown() {
                    flush(&mut conn, &mut batch, &queue).await;
                    tracing::debug!("ledger writer shutting down");
                    return;
                }
                queue.notify.notified().await;
            }

            // Top up until the batch is full or the flush deadline passes.
            let deadline = Instant::now() + FLUSH_INTERVAL;
            while batch.len() < BATCH_SIZE && !queue.is_shutdown() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = queue.notify.notified() => {
                        queue.take_into(&mut batch, BATCH_SIZE);
                    }
                }
            }

            flush(&mut conn, &mut batch, &queue).await;
        }
    })
}

/// Write a batch inside one transaction, retrying with exponential back-off.
/// After [`WRITE_RETRIES`] failures the batch is dropped and the ledger is
/// flagged degraded; durability waiters observe the drop through their
/// closed channels.
async fn flush(conn: &mut Connection, batch: &mut Vec<Envelope>, queue: &Queue) {
    if batch.is_empty() {
        return;
    }
    let envelopes = std::mem::take(batch);
    let count = envelopes.len();

    for attempt in 0..WRITE_RETRIES {
        match write_batch(conn, &envelopes) {
            Ok(()) => {
                tracing::trace!(count, "ledger batch committed");
                for envelope in envelopes {
                    if let Some(done) = envelope.done {
                        let _ = done.send(());
                    }
                }
                return;
            }
            Err(error) => {
                let backoff = Duration::from_millis(50 << attempt);
                tracing::warn!(
                    count,
                    attempt,
                    error = %error,
                    backoff_ms = backoff.as_millis() as u64,
                    "ledger batch write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    queue.degraded.store(true, Ordering::Release);
    tracing::error!(count, "ledger degraded: dropping batch after repeated write failures");
}

fn write_batch(conn: &mut Connection, envelopes: &[Envelope]) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO events (event_id, trace_id, event_type, provider, model, \
             usage_json, usage_known, cost_est_usd, cost_actual_usd, status, \
             timing_json, metadata_json, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for envelope in envelopes {
            let ev = &envelope.event;
            stmt.execute(params![
                ev.event_id.to_string(),
                ev.trace_id.to_string(),
                ev.event_type.as_str(),
                ev.provider,
                ev.model,
                serde_json::to_string(&ev.usage).unwrap_or_else(|_| "{}".to_string()),
                ev.usage.known,
                ev.cost_est_usd,
                ev.cost_actual_usd,
                ev.status.as_str(),
                serde_json::to_string(&ev.timing).unwrap_or_else(|_| "{}".to_string()),
                ev.metadata.to_string(),
                ev.timestamp,
            ])?;
        }
    }
    tx.commit()
}

/// Synchronous single-event insert, used by the overflow fallback and the
/// shutdown drain.
pub(crate) fn write_one(conn: &Connection, ev: &LedgerEvent) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO events (event_id, trace_id, event_type, provider, model, \
         usage_json, usage_known, cost_est_usd, cost_actual_usd, status, \
         timing_json, metadata_json, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            ev.event_id.to_string(),
            ev.trace_id.to_string(),
            ev.event_type.as_str(),
            ev.provider,
            ev.model,
            serde_json::to_string(&ev.usage).unwrap_or_else(|_| "{}".to_string()),
            ev.usage.known,
            ev.cost_est_usd,
            ev.cost_actual_usd,
            ev.status.as_str(),
            serde_json::to_string(&ev.timing).unwrap_or_else(|_| "{}".to_string()),
            ev.metadata.to_string(),
            ev.timestamp,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
