//! Daily budget controller.
//!
//! Admission compares today's spend (committed cost plus outstanding hold
//! estimates) against the configured cap. Best-effort mode runs the check
//! without recording anything, accepting a small race under concurrency.
//! Strict mode serialises admissions and records a durable `precheck_hold`
//! before returning, so concurrent calls cannot jointly overshoot the cap.

use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::error::Error;
use crate::ledger::{
    ConsumerDim, DailyTrend, EventStatus, EventType, Ledger, LedgerEvent, TodaySummary,
    TopConsumer,
};
use crate::types::{Timing, TokenUsage};

/// Result of a budget pre-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetDecision {
    /// Within limits.
    Allow,
    /// Admitted, but usage crossed the warning threshold (percent used).
    Warn(f64),
    /// Over the cap; the call must be refused.
    Reject { spent_usd: f64, limit_usd: f64 },
}

/// Spend snapshot returned by [`BudgetController::status_today`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetStatus {
    pub spent_usd: f64,
    pub limit_usd: f64,
    pub remaining_usd: f64,
    pub summary: TodaySummary,
}

/// Escalation level of a budget alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Emitted to the host logger when spend crosses the warning threshold or
/// the cap itself.
#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub level: AlertLevel,
    pub current_spend_usd: f64,
    pub limit_usd: f64,
    pub percentage: f64,
}

impl BudgetAlert {
    fn emit(&self) {
        match self.level {
            AlertLevel::Critical => tracing::error!(
                spent_usd = self.current_spend_usd,
                limit_usd = self.limit_usd,
                pct = self.percentage,
                "daily budget exceeded"
            ),
            AlertLevel::Warning => tracing::warn!(
                spent_usd = self.current_spend_usd,
                limit_usd = self.limit_usd,
                pct = self.percentage,
                "daily budget warning threshold crossed"
            ),
        }
    }
}

/// Guards the daily cap and owns the terminal-event write path.
pub struct BudgetController {
    ledger: Ledger,
    limit_usd: f64,
    warn_ratio: f64,
    strict: bool,
    /// Local day the warning alert last fired on.
    warned_on: Mutex<Option<NaiveDate>>,
    /// Serialises strict-mode admissions so holds cannot interleave.
    admission: tokio::sync::Mutex<()>,
}

impl BudgetController {
    pub fn new(cfg: &BudgetConfig, ledger: Ledger) -> Self {
        Self {
            ledger,
            limit_usd: cfg.daily_spend_limit_usd,
            warn_ratio: cfg.warn_ratio,
            strict: cfg.strict,
            warned_on: Mutex::new(None),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Check whether a call with the given estimated cost may proceed. In
    /// strict mode an `Allow`/`Warn` is returned only after the hold is
    /// durably written.
    pub async fn check(
        &self,
        trace_id: Uuid,
        provider: &str,
        model: &str,
        estimated_cost_usd: f64,
    ) -> Result<BudgetDecision, Error> {
        // Negative limit disables the cap entirely.
        if self.limit_usd < 0.0 {
            return Ok(BudgetDecision::Allow);
        }

        let _admission = if self.strict {
            Some(self.admission.lock().await)
        } else {
            None
        };

        let spent = self
            .ledger
            .spend_today()
            .map_err(|e| Error::Ledger(e.to_string()))?;

        if self.limit_usd == 0.0 || spent + estimated_cost_usd > self.limit_usd {
            BudgetAlert {
                level: AlertLevel::Critical,
                current_spend_usd: spent,
                limit_usd: self.limit_usd,
                percentage: if self.limit_usd > 0.0 {
                    spent / self.limit_usd * 100.0
                } else {
                    100.0
                },
            }
            .emit();
            return Ok(BudgetDecision::Reject {
                spent_usd: spent,
                limit_usd: self.limit_usd,
            });
        }

        if self.strict {
            let mut hold = LedgerEvent::new(trace_id, EventType::PrecheckHold, provider, model);
            hold.cost_est_usd = Some(estimated_cost_usd);
            let durable = self.ledger.enqueue_durable(hold);
            // The worker drops the channel if the batch could not be
            // persisted; admission proceeds but degradation is already
            // flagged and logged by the writer.
            if durable.await.is_err() {
                tracing::warn!(trace_id = %trace_id, "strict hold not durable, ledger degraded");
            }
        }

        let projected = spent + estimated_cost_usd;
        if self.limit_usd > 0.0 && projected / self.limit_usd >= self.warn_ratio {
            let today = Local::now().date_naive();
            let mut warned = self.warned_on.lock().expect("budget warn mutex poisoned");
            if *warned != Some(today) {
                *warned = Some(today);
                let pct = projected / self.limit_usd * 100.0;
                BudgetAlert {
                    level: AlertLevel::Warning,
                    current_spend_usd: spent,
                    limit_usd: self.limit_usd,
                    percentage: pct,
                }
                .emit();
                return Ok(BudgetDecision::Warn(pct));
            }
        }

        Ok(BudgetDecision::Allow)
    }

    /// Write the terminal `commit` event for a trace. Supersedes any hold in
    /// the daily aggregate via the trace-id join.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &self,
        trace_id: Uuid,
        provider: &str,
        model: &str,
        actual_cost_usd: f64,
        usage: TokenUsage,
        status: EventStatus,
        timing: Timing,
        metadata: serde_json::Value,
    ) {
        let mut event = LedgerEvent::new(trace_id, EventType::Commit, provider, model);
        event.cost_actual_usd = Some(actual_cost_usd);
        event.usage = usage;
        event.status = status;
        event.timing = timing;
        event.metadata = metadata;
        self.ledger.enqueue(event);
    }

    /// Write a terminal `cancel` event; the aggregate drops the hold.
    pub fn cancel(
        &self,
        trace_id: Uuid,
        provider: &str,
        model: &str,
        reason: &str,
        status: EventStatus,
    ) {
        let mut event = LedgerEvent::new(trace_id, EventType::Cancel, provider, model);
        event.status = status;
        event.metadata = serde_json::json!({ "reason": reason });
        self.ledger.enqueue(event);
    }

    /// Record one retry decision for a trace.
    pub fn retry_attempt(
        &self,
        trace_id: Uuid,
        provider: &str,
        model: &str,
        attempt: u32,
        delay_ms: u64,
        error_kind: &str,
    ) {
        let mut event = LedgerEvent::new(trace_id, EventType::RetryAttempt, provider, model);
        event.metadata = serde_json::json!({
            "attempt": attempt,
            "delay_ms": delay_ms,
            "error_kind": error_kind,
        });
        self.ledger.enqueue(event);
    }

    // -- reporting -----------------------------------------------------------

    pub fn status_today(&self) -> Result<BudgetStatus, Error> {
        let spent = self
            .ledger
            .spend_today()
            .map_err(|e| Error::Ledger(e.to_string()))?;
        let summary = self
            .ledger
            .today_summary()
            .map_err(|e| Error::Ledger(e.to_string()))?;
        Ok(BudgetStatus {
            spent_usd: spent,
            limit_usd: self.limit_usd,
            remaining_usd: (self.limit_usd - spent).max(0.0),
            summary,
        })
    }

    pub fn report(&self, days: u32) -> Result<Vec<DailyTrend>, Error> {
        self.ledger
            .daily_trend(days)
            .map_err(|e| Error::Ledger(e.to_string()))
    }

    pub fn top(&self, by: ConsumerDim, days: u32) -> Result<Vec<TopConsumer>, Error> {
        self.ledger
            .top_consumers(by, days)
            .map_err(|e| Error::Ledger(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &tempfile::TempDir, cfg: BudgetConfig) -> (BudgetController, Ledger) {
        let ledger = Ledger::open(&dir.path().join("ledger.db")).unwrap();
        (BudgetController::new(&cfg, ledger.clone()), ledger)
    }

    fn budget(limit: f64) -> BudgetConfig {
        BudgetConfig {
            daily_spend_limit_usd: limit,
            warn_ratio: 0.8,
            strict: false,
        }
    }

    #[tokio::test]
    async fn test_allow_within_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(&dir, budget(5.0));

        let decision = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.10)
            .await
            .unwrap();
        assert_eq!(decision, BudgetDecision::Allow);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_reject_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(&dir, budget(1.0));

        controller.commit(
            Uuid::new_v4(),
            "echo",
            "m1",
            0.99,
            TokenUsage::tokens(10, 10),
            EventStatus::Ok,
            Timing::default(),
            serde_json::Value::Null,
        );
        // Make the commit visible to the read path.
        ledger.close().await;

        let decision = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.05)
            .await
            .unwrap();
        assert!(matches!(decision, BudgetDecision::Reject { .. }));
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(&dir, budget(0.0));

        let decision = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.0)
            .await
            .unwrap();
        assert!(matches!(decision, BudgetDecision::Reject { .. }));
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_negative_limit_disables_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(&dir, budget(-1.0));

        let decision = controller
            .check(Uuid::new_v4(), "echo", "m1", 1_000_000.0)
            .await
            .unwrap();
        assert_eq!(decision, BudgetDecision::Allow);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(&dir, budget(1.0));

        let first = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.85)
            .await
            .unwrap();
        assert!(matches!(first, BudgetDecision::Warn(pct) if pct >= 80.0));

        let second = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.85)
            .await
            .unwrap();
        assert_eq!(second, BudgetDecision::Allow);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_strict_mode_records_durable_hold() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(
            &dir,
            BudgetConfig {
                daily_spend_limit_usd: 1.0,
                warn_ratio: 0.99,
                strict: true,
            },
        );

        let trace = Uuid::new_v4();
        let decision = controller.check(trace, "echo", "m1", 0.60).await.unwrap();
        assert_eq!(decision, BudgetDecision::Allow);

        // The hold is already durable: a second check sees it.
        let decision = controller
            .check(Uuid::new_v4(), "echo", "m1", 0.60)
            .await
            .unwrap();
        assert!(matches!(decision, BudgetDecision::Reject { .. }));

        let events = ledger.events_for_trace(trace).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::PrecheckHold);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_strict_race_admits_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(&dir.path().join("ledger.db")).unwrap();
        let controller = std::sync::Arc::new(BudgetController::new(
            &BudgetConfig {
                daily_spend_limit_usd: 1.0,
                warn_ratio: 0.99,
                strict: true,
            },
            ledger.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let c = controller.clone();
            handles.push(tokio::spawn(async move {
                c.check(Uuid::new_v4(), "echo", "m1", 0.60).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if !matches!(handle.await.unwrap(), BudgetDecision::Reject { .. }) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_commit_supersedes_hold_and_status_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(
            &dir,
            BudgetConfig {
                daily_spend_limit_usd: 5.0,
                warn_ratio: 0.8,
                strict: true,
            },
        );

        let trace = Uuid::new_v4();
        controller.check(trace, "echo", "m1", 1.0).await.unwrap();
        controller.commit(
            trace,
            "echo",
            "m1",
            0.25,
            TokenUsage::tokens(100, 50),
            EventStatus::Ok,
            Timing::default(),
            serde_json::Value::Null,
        );
        ledger.close().await;

        let status = controller.status_today().unwrap();
        assert!((status.spent_usd - 0.25).abs() < 1e-9);
        assert!((status.remaining_usd - 4.75).abs() < 1e-9);
        assert_eq!(status.summary.request_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_hold() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, ledger) = controller(
            &dir,
            BudgetConfig {
                daily_spend_limit_usd: 1.0,
                warn_ratio: 0.99,
                strict: true,
            },
        );

        let trace = Uuid::new_v4();
        controller.check(trace, "echo", "m1", 0.9).await.unwrap();
        controller.cancel(trace, "echo", "m1", "quota", EventStatus::Cancelled);
        ledger.close().await;

        let status = controller.status_today().unwrap();
        assert_eq!(status.spent_usd, 0.0);
    }
}
