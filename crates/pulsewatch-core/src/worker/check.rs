//! Per-message health check processing

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::HealthCheckExecutor;
use crate::alerting::AlertEvaluator;
use crate::db::Datastore;
use crate::error::Result;
use crate::models::{
    AlertPayload, CheckPayload, CheckResult, HistoryRecord, MessageBody, Monitor, MonitorStatus,
    MonitorUpdate, QueueMessage,
};
use crate::queue::{QueueService, SendOptions};

/// How a recorded check reaches the alert evaluator
#[derive(Clone)]
pub enum AlertHandoff {
    /// Publish to the ordered alert queue, grouped by monitor
    Queue {
        queue: Arc<dyn QueueService>,
        name: String,
    },
    /// Evaluate in a spawned task
    Task,
}

/// Result of processing one check message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The check ran and was recorded
    Checked {
        check_id: Uuid,
        result: CheckResult,
        alert_requested: bool,
    },
    /// Nothing to do; the message can be acknowledged
    Skipped(&'static str),
}

/// Runs the check for a `MONITOR_CHECK` message and records it
#[derive(Clone)]
pub struct CheckProcessor {
    store: Arc<dyn Datastore>,
    executor: HealthCheckExecutor,
    evaluator: AlertEvaluator,
    handoff: AlertHandoff,
}

impl CheckProcessor {
    /// Create a new check processor
    pub fn new(
        store: Arc<dyn Datastore>,
        executor: HealthCheckExecutor,
        evaluator: AlertEvaluator,
        handoff: AlertHandoff,
    ) -> Self {
        Self {
            store,
            executor,
            evaluator,
            handoff,
        }
    }

    /// Check, persist, then hand off for alerting.
    ///
    /// Errors only when the monitor cannot be read or the result cannot be
    /// written; alerting problems are logged.
    #[instrument(skip(self, payload), fields(monitor_id = %payload.monitor_id, priority = payload.priority.as_str()))]
    pub async fn process(&self, payload: &CheckPayload) -> Result<CheckOutcome> {
        // the snapshot may be stale; the row is authoritative
        let Some(monitor) = self.store.get_monitor(payload.monitor_id).await? else {
            info!("Monitor no longer exists, skipping check");
            return Ok(CheckOutcome::Skipped("monitor not found"));
        };
        if !monitor.is_active {
            debug!("Monitor deactivated since scheduling, skipping check");
            return Ok(CheckOutcome::Skipped("monitor inactive"));
        }

        let timeout = self.executor.timeout_for(monitor.timeout_seconds);
        let result = self.executor.execute(&monitor.url, timeout).await;
        let checked_at = Utc::now();

        metrics::counter!("pulsewatch_checks_total", "status" => result.status.as_str()).increment(1);
        if let Some(ms) = result.response_time_ms {
            metrics::histogram!("pulsewatch_check_response_ms").record(f64::from(ms));
        }

        self.store
            .update_monitor(
                monitor.id,
                MonitorUpdate {
                    status: Some(result.status),
                    response_time_ms: result.response_time_ms,
                    last_checked_at: Some(checked_at),
                    next_check_at: Some(monitor.next_check_from(checked_at)),
                },
            )
            .await?;

        let record = HistoryRecord::from_result(monitor.id, &result, checked_at);
        self.store.insert_history(&record).await?;

        let previous = monitor.status;
        let alert_requested = previous != result.status || result.status.is_failure();
        if alert_requested {
            self.hand_off(&monitor, previous, &result, record.id).await;
        }

        debug!(
            status = %result.status,
            previous = %previous,
            response_time_ms = ?result.response_time_ms,
            "Check recorded"
        );
        Ok(CheckOutcome::Checked {
            check_id: record.id,
            result,
            alert_requested,
        })
    }

    async fn hand_off(
        &self,
        monitor: &Monitor,
        previous: MonitorStatus,
        result: &CheckResult,
        check_id: Uuid,
    ) {
        let payload = AlertPayload {
            monitor_id: monitor.id,
            check_id,
            previous_status: previous,
            result: result.clone(),
        };

        if let AlertHandoff::Queue { queue, name } = &self.handoff {
            let message = QueueMessage::new(MessageBody::AlertProcessing(payload.clone()), "worker")
                .with_correlation_id(check_id.to_string());
            match queue
                .send_message(name, &message, SendOptions::grouped(monitor.id.to_string()))
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    warn!(monitor_id = %monitor.id, error = %e, "Failed to publish alert message, evaluating in-process");
                }
            }
        }

        let evaluator = self.evaluator.clone();
        tokio::spawn(async move {
            if let Err(e) = evaluator.process(&payload).await {
                warn!(monitor_id = %payload.monitor_id, error = %e, "Alert evaluation failed");
            }
        });
    }
}
