//! Durable append-only ledger of request lifecycle events.
//!
//! Every request writes a small number of immutable events keyed by its
//! trace id: at most one `precheck_hold`, zero or more `retry_attempt`s, and
//! exactly one terminal `commit` or `cancel`. Spend aggregation joins on
//! trace id so a commit supersedes its hold regardless of write order.

pub mod store;
pub(crate) mod writer;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::types::{Timing, TokenUsage};

use self::store::Store;
use self::writer::{Envelope, EnqueueOutcome, Queue};

/// How long the shutdown drain waits for the worker before falling back to a
/// synchronous flush.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Lifecycle stage an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrecheckHold,
    Commit,
    Cancel,
    Adjust,
    RetryAttempt,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrecheckHold => "precheck_hold",
            Self::Commit => "commit",
            Self::Cancel => "cancel",
            Self::Adjust => "adjust",
            Self::RetryAttempt => "retry_attempt",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "precheck_hold" => Some(Self::PrecheckHold),
            "commit" => Some(Self::Commit),
            "cancel" => Some(Self::Cancel),
            "adjust" => Some(Self::Adjust),
            "retry_attempt" => Some(Self::RetryAttempt),
            _ => None,
        }
    }
}

/// Outcome recorded on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Ok,
    Error,
    Cancelled,
    RateLimited,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            "rate_limited" => Self::RateLimited,
            _ => Self::Ok,
        }
    }
}

/// One persisted ledger row. Immutable once written.
#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub event_id: Uuid,
    pub trace_id: Uuid,
    pub event_type: EventType,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_est_usd: Option<f64>,
    pub cost_actual_usd: Option<f64>,
    pub status: EventStatus,
    pub timing: Timing,
    pub metadata: serde_json::Value,
    /// Fractional unix seconds.
    pub timestamp: f64,
}

impl LedgerEvent {
    pub fn new(
        trace_id: Uuid,
        event_type: EventType,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trace_id,
            event_type,
            provider: provider.into(),
            model: model.into(),
            usage: TokenUsage::default(),
            cost_est_usd: None,
            cost_actual_usd: None,
            status: EventStatus::Ok,
            timing: Timing::default(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: now_ts(),
        }
    }

    /// Terminal events close out a trace and are never dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Commit | EventType::Cancel)
    }
}

/// Current fractional unix timestamp.
pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Unix timestamp of the most recent local midnight.
pub(crate) fn local_midnight_ts() -> f64 {
    let midnight = Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time");
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Reporting rows
// ---------------------------------------------------------------------------

/// Aggregate of today's committed activity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TodaySummary {
    pub total_cost_usd: f64,
    pub request_count: u64,
    pub total_tokens: u64,
    pub error_rate: f64,
}

/// One day of the spend trend.
#[derive(Debug, Clone, Serialize)]
pub struct DailyTrend {
    pub day: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub requests: u64,
}

/// Dimension for top-consumer queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerDim {
    Provider,
    Model,
}

/// One row of a top-consumers report.
#[derive(Debug, Clone, Serialize)]
pub struct TopConsumer {
    pub key: String,
    pub cost_usd: f64,
    pub requests: u64,
}

// ---------------------------------------------------------------------------
// Ledger handle
// ---------------------------------------------------------------------------

/// Handle over the event store and its single-writer worker.
///
/// Cloneable and cheap to share; all clones feed the same queue and worker.
#[derive(Clone)]
pub struct Ledger {
    store: Store,
    queue: Arc<Queue>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Ledger {
    /// Open the ledger and spawn its writer worker. Must be called from
    /// within a Tokio runtime.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let (store, writer_conn) = Store::open(path)?;
        let queue = Arc::new(Queue::new(writer::QUEUE_CAPACITY));
        let worker = writer::spawn_writer(writer_conn, queue.clone());
        Ok(Self {
            store,
            queue,
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }

    /// Fire-and-forget enqueue. Terminal events that cannot be queued are
    /// written synchronously so they are never lost.
    pub fn enqueue(&self, event: LedgerEvent) {
        match self.queue.push(Envelope { event, done: None }) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Rejected(envelope) => {
                tracing::warn!(
                    trace_id = %envelope.event.trace_id,
                    "ledger queue saturated, writing terminal event synchronously"
                );
                if let Err(error) = self.write_sync(&envelope.event) {
                    tracing::error!(error = %error, "synchronous terminal write failed");
                }
            }
        }
    }

    /// Enqueue with a durability handle; the returned receiver resolves once
    /// the event is committed to disk. Used by strict-budget holds.
    pub fn enqueue_durable(&self, event: LedgerEvent) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        match self.queue.push(Envelope {
            event,
            done: Some(tx),
        }) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Rejected(mut envelope) => {
                let done = envelope.done.take();
                if self.write_sync(&envelope.event).is_ok() {
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
            }
        }
        rx
    }

    /// Synchronous write on the caller's thread, bypassing the worker.
    pub fn write_sync(&self, event: &LedgerEvent) -> Result<(), rusqlite::Error> {
        self.store.with_conn(|conn| writer::write_one(conn, event))
    }

    /// Whether the writer has given up on at least one batch.
    pub fn degraded(&self) -> bool {
        self.queue.is_degraded()
    }

    /// Events evicted by the overflow policy since open.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Stop the worker, draining the queue with a bounded deadline. Events
    /// still queued after the deadline are flushed synchronously.
    pub async fn close(&self) {
        self.queue.begin_shutdown();
        let handle = self.worker.lock().expect("ledger worker mutex poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                tracing::warn!("ledger worker missed shutdown deadline, flushing synchronously");
            }
        }
        for envelope in self.queue.drain_all() {
            if let Err(error) = self.write_sync(&envelope.event) {
                tracing::error!(error = %error, "failed to flush event during shutdown");
            } else if let Some(done) = envelope.done {
                let _ = done.send(());
            }
        }
    }

    // -- queries -------------------------------------------------------------

    /// Spend since local midnight: actual cost of `commit`/`adjust` events
    /// plus estimated cost of holds with no terminal event yet.
    pub fn spend_today(&self) -> Result<f64, rusqlite::Error> {
        let since = local_midnight_ts();
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT \
                   COALESCE((SELECT SUM(cost_actual_usd) FROM events \
                             WHERE event_type IN ('commit', 'adjust') AND timestamp >= ?1), 0.0) \
                 + COALESCE((SELECT SUM(h.cost_est_usd) FROM events h \
                             WHERE h.event_type = 'precheck_hold' AND h.timestamp >= ?1 \
                               AND NOT EXISTS (SELECT 1 FROM events t \
                                               WHERE t.trace_id = h.trace_id \
                                                 AND t.event_type IN ('commit', 'cancel'))), 0.0)",
                params![since],
                |row| row.get(0),
            )
        })
    }

    /// Committed request count for a model within the trailing window.
    pub fn count_in_window(
        &self,
        provider: &str,
        model: &str,
        window: Duration,
    ) -> Result<u64, rusqlite::Error> {
        let since = now_ts() - window.as_secs_f64();
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM events \
                 WHERE event_type = 'commit' AND provider = ?1 AND model = ?2 AND timestamp >= ?3",
                params![provider, model, since],
                |row| row.get::<_, i64>(0).map(|n| n as u64),
            )
        })
    }

    /// Committed token total for a model within the trailing window.
    pub fn tokens_in_window(
        &self,
        provider: &str,
        model: &str,
        window: Duration,
    ) -> Result<u64, rusqlite::Error> {
        let since = now_ts() - window.as_secs_f64();
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(json_extract(usage_json, '$.total_tokens')), 0) FROM events \
                 WHERE event_type = 'commit' AND provider = ?1 AND model = ?2 AND timestamp >= ?3",
                params![provider, model, since],
                |row| row.get::<_, i64>(0).map(|n| n.max(0) as u64),
            )
        })
    }

    /// All events recorded for one trace, in timestamp order.
    pub fn events_for_trace(&self, trace_id: Uuid) -> Result<Vec<LedgerEvent>, rusqlite::Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, trace_id, event_type, provider, model, usage_json, \
                 cost_est_usd, cost_actual_usd, status, timing_json, metadata_json, timestamp \
                 FROM events WHERE trace_id = ?1 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![trace_id.to_string()], row_to_event)?;
            rows.collect()
        })
    }

    /// All events at or after a unix timestamp, in write order. Intended for
    /// inspection and audits; spend math uses the aggregate queries.
    pub fn events_since(&self, since: f64) -> Result<Vec<LedgerEvent>, rusqlite::Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, trace_id, event_type, provider, model, usage_json, \
                 cost_est_usd, cost_actual_usd, status, timing_json, metadata_json, timestamp \
                 FROM events WHERE timestamp >= ?1 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![since], row_to_event)?;
            rows.collect()
        })
    }

    /// Whether a trace already has a terminal event.
    pub fn has_terminal(&self, trace_id: Uuid) -> Result<bool, rusqlite::Error> {
        self.store.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM events \
                     WHERE trace_id = ?1 AND event_type IN ('commit', 'cancel') LIMIT 1",
                    params![trace_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- reporting -----------------------------------------------------------

    /// Committed activity since local midnight.
    pub fn today_summary(&self) -> Result<TodaySummary, rusqlite::Error> {
        let since = local_midnight_ts();
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost_actual_usd), 0.0), COUNT(*), \
                        COALESCE(SUM(json_extract(usage_json, '$.total_tokens')), 0), \
                        COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) * 1.0 \
                                 / MAX(COUNT(*), 1), 0.0) \
                 FROM events WHERE event_type = 'commit' AND timestamp >= ?1",
                params![since],
                |row| {
                    Ok(TodaySummary {
                        total_cost_usd: row.get(0)?,
                        request_count: row.get::<_, i64>(1)? as u64,
                        total_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                        error_rate: row.get(3)?,
                    })
                },
            )
        })
    }

    /// Per-day totals over the trailing `days` days, oldest first.
    pub fn daily_trend(&self, days: u32) -> Result<Vec<DailyTrend>, rusqlite::Error> {
        let since = now_ts() - f64::from(days) * 86_400.0;
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date(timestamp, 'unixepoch', 'localtime') AS day, \
                        COALESCE(SUM(cost_actual_usd), 0.0), \
                        COALESCE(SUM(json_extract(usage_json, '$.total_tokens')), 0), \
                        COUNT(*) \
                 FROM events WHERE event_type = 'commit' AND timestamp >= ?1 \
                 GROUP BY day ORDER BY day ASC",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok(DailyTrend {
                    day: row.get(0)?,
                    cost_usd: row.get(1)?,
                    tokens: row.get::<_, i64>(2)?.max(0) as u64,
                    requests: row.get::<_, i64>(3)? as u64,
                })
            })?;
            rows.collect()
        })
    }

    /// Top five consumers by committed cost over the trailing `days` days.
    pub fn top_consumers(
        &self,
        by: ConsumerDim,
        days: u32,
    ) -> Result<Vec<TopConsumer>, rusqlite::Error> {
        let column = match by {
            ConsumerDim::Provider => "provider",
            ConsumerDim::Model => "model",
        };
        let since = now_ts() - f64::from(days) * 86_400.0;
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {column}, COALESCE(SUM(cost_actual_usd), 0.0), COUNT(*) \
                 FROM events WHERE event_type = 'commit' AND timestamp >= ?1 \
                 GROUP BY {column} ORDER BY 2 DESC LIMIT 5"
            ))?;
            let rows = stmt.query_map(params![since], |row| {
                Ok(TopConsumer {
                    key: row.get(0)?,
                    cost_usd: row.get(1)?,
                    requests: row.get::<_, i64>(2)? as u64,
                })
            })?;
            rows.collect()
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<LedgerEvent, rusqlite::Error> {
    let parse_uuid = |s: String| Uuid::parse_str(&s).unwrap_or_default();
    let usage: TokenUsage =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    let timing: Timing = serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default();
    let metadata = serde_json::from_str(&row.get::<_, String>(10)?)
        .unwrap_or(serde_json::Value::Null);
    Ok(LedgerEvent {
        event_id: parse_uuid(row.get(0)?),
        trace_id: parse_uuid(row.get(1)?),
        event_type: EventType::parse(&row.get::<_, String>(2)?)
            .unwrap_or(EventType::Adjust),
        provider: row.get(3)?,
        model: row.get(4)?,
        usage,
        cost_est_usd: row.get(6)?,
        cost_actual_usd: row.get(7)?,
        status: EventStatus::parse(&row.get::<_, String>(8)?),
        timing,
        metadata,
        timestamp: row.get(11)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ledger(dir: &tempfile::TempDir) -> Ledger {
        Ledger::open(&dir.path().join("ledger.db")).unwrap()
    }

    fn commit_event(trace: Uuid, cost: f64) -> LedgerEvent {
        let mut ev = LedgerEvent::new(trace, EventType::Commit, "echo", "m1");
        ev.cost_actual_usd = Some(cost);
        ev.usage = TokenUsage::tokens(100, 50);
        ev
    }

    #[tokio::test]
    async fn test_spend_today_counts_commits() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);

        ledger.write_sync(&commit_event(Uuid::new_v4(), 0.25)).unwrap();
        ledger.write_sync(&commit_event(Uuid::new_v4(), 0.50)).unwrap();

        let spend = ledger.spend_today().unwrap();
        assert!((spend - 0.75).abs() < 1e-9);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_outstanding_hold_counts_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);
        let trace = Uuid::new_v4();

        let mut hold = LedgerEvent::new(trace, EventType::PrecheckHold, "echo", "m1");
        hold.cost_est_usd = Some(0.60);
        ledger.write_sync(&hold).unwrap();
        assert!((ledger.spend_today().unwrap() - 0.60).abs() < 1e-9);

        // Commit supersedes the hold in the aggregate.
        ledger.write_sync(&commit_event(trace, 0.10)).unwrap();
        assert!((ledger.spend_today().unwrap() - 0.10).abs() < 1e-9);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_cancel_releases_hold() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);
        let trace = Uuid::new_v4();

        let mut hold = LedgerEvent::new(trace, EventType::PrecheckHold, "echo", "m1");
        hold.cost_est_usd = Some(0.60);
        ledger.write_sync(&hold).unwrap();

        let mut cancel = LedgerEvent::new(trace, EventType::Cancel, "echo", "m1");
        cancel.status = EventStatus::Cancelled;
        ledger.write_sync(&cancel).unwrap();

        assert_eq!(ledger.spend_today().unwrap(), 0.0);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_enqueue_is_visible_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);

        let rx = ledger.enqueue_durable(commit_event(Uuid::new_v4(), 0.05));
        rx.await.unwrap();

        assert!((ledger.spend_today().unwrap() - 0.05).abs() < 1e-9);
        assert!(!ledger.degraded());
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_queued_events() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);

        for _ in 0..7 {
            ledger.enqueue(commit_event(Uuid::new_v4(), 0.01));
        }
        ledger.close().await;

        assert!((ledger.spend_today().unwrap() - 0.07).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_events_for_trace_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);
        let trace = Uuid::new_v4();

        let mut hold = LedgerEvent::new(trace, EventType::PrecheckHold, "echo", "m1");
        hold.cost_est_usd = Some(0.1);
        ledger.write_sync(&hold).unwrap();
        ledger
            .write_sync(&LedgerEvent::new(trace, EventType::RetryAttempt, "echo", "m1"))
            .unwrap();
        ledger.write_sync(&commit_event(trace, 0.05)).unwrap();

        let events = ledger.events_for_trace(trace).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::PrecheckHold);
        assert_eq!(events[1].event_type, EventType::RetryAttempt);
        assert_eq!(events[2].event_type, EventType::Commit);
        assert!(events[0].timestamp <= events[2].timestamp);
        assert!(ledger.has_terminal(trace).unwrap());
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_window_queries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);

        ledger.write_sync(&commit_event(Uuid::new_v4(), 0.01)).unwrap();
        ledger.write_sync(&commit_event(Uuid::new_v4(), 0.01)).unwrap();

        let count = ledger
            .count_in_window("echo", "m1", Duration::from_secs(60))
            .unwrap();
        assert_eq!(count, 2);

        let tokens = ledger
            .tokens_in_window("echo", "m1", Duration::from_secs(60))
            .unwrap();
        assert_eq!(tokens, 300);

        let none = ledger
            .count_in_window("echo", "other", Duration::from_secs(60))
            .unwrap();
        assert_eq!(none, 0);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_reporting_surface() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(&dir);

        ledger.write_sync(&commit_event(Uuid::new_v4(), 0.20)).unwrap();
        let mut failed = commit_event(Uuid::new_v4(), 0.0);
        failed.status = EventStatus::Error;
        ledger.write_sync(&failed).unwrap();

        let summary = ledger.today_summary().unwrap();
        assert_eq!(summary.request_count, 2);
        assert!((summary.total_cost_usd - 0.20).abs() < 1e-9);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);

        let trend = ledger.daily_trend(7).unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].requests, 2);

        let top = ledger.top_consumers(ConsumerDim::Model, 7).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].key, "m1");
        ledger.close().await;
    }
}
