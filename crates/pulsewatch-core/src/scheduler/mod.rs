//! Check scheduler
//!
//! Claims due monitors, classifies them by priority, enqueues one check
//! message per monitor and moves `next_check_at` forward.

mod priority;

pub use priority::classify_priority;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{QueuesConfig, SchedulerConfig};
use crate::db::Datastore;
use crate::error::Result;
use crate::models::{CheckPayload, MessageBody, Monitor, Priority, QueueMessage};
use crate::queue::{QueueService, QueueSettings, SendOptions};

/// Outcome of one scheduling pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    /// Monitors claimed
    pub total: usize,
    /// Check messages enqueued
    pub enqueued: usize,
    /// Monitors that could not be enqueued
    pub errors: usize,
}

/// A check a pass would enqueue, without claiming anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCheck {
    pub monitor_id: Uuid,
    pub name: String,
    pub priority: Priority,
    pub queue: String,
}

/// Selects due monitors and feeds the check queues
pub struct Scheduler {
    store: Arc<dyn Datastore>,
    queue: Arc<dyn QueueService>,
    config: SchedulerConfig,
    queues: QueuesConfig,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        store: Arc<dyn Datastore>,
        queue: Arc<dyn QueueService>,
        config: SchedulerConfig,
        queues: QueuesConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            queues,
        }
    }

    /// Run one pass with the configured batch limit
    pub async fn schedule_due_checks(&self) -> Result<ScheduleReport> {
        self.schedule_with_limit(self.config.batch_limit).await
    }

    /// Run one pass selecting at most `limit` monitors
    #[instrument(skip(self))]
    pub async fn schedule_with_limit(&self, limit: usize) -> Result<ScheduleReport> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let monitors = match self.store.claim_due_monitors(limit, now + lease, now).await {
            Ok(monitors) => monitors,
            Err(e) => {
                metrics::counter!("pulsewatch_schedule_errors_total").increment(1);
                return Err(e);
            }
        };

        let mut report = ScheduleReport {
            total: monitors.len(),
            ..ScheduleReport::default()
        };
        if monitors.is_empty() {
            debug!("No monitors due");
            return Ok(report);
        }

        let correlation_id = correlation_id(now);
        for monitor in &monitors {
            if self.enqueue(monitor, &correlation_id, now).await {
                report.enqueued += 1;
            } else {
                report.errors += 1;
            }
        }

        if report.errors > 0 {
            metrics::counter!("pulsewatch_schedule_errors_total").increment(report.errors as u64);
        }
        info!(
            total = report.total,
            enqueued = report.enqueued,
            errors = report.errors,
            "Scheduling pass complete"
        );
        Ok(report)
    }

    /// Returns whether the check message was enqueued
    async fn enqueue(&self, monitor: &Monitor, correlation_id: &str, now: DateTime<Utc>) -> bool {
        let priority = classify_priority(monitor.status, monitor.interval_minutes);
        let target = self.route(priority);

        let message = QueueMessage::new(
            MessageBody::MonitorCheck(CheckPayload::for_monitor(monitor, priority)),
            "scheduler",
        )
        .with_correlation_id(correlation_id);

        let mut options = SendOptions::default()
            .with_attribute("priority", priority.as_str())
            .with_attribute("monitorId", monitor.id.to_string());
        if target.ordered {
            options.group_id = Some(self.config.check_group.clone());
        }

        match self.queue.send_message(&target.name, &message, options).await {
            Ok(_) => {
                metrics::counter!("pulsewatch_scheduled_total", "priority" => priority.as_str())
                    .increment(1);
                let next = monitor.next_check_from(now);
                if let Err(e) = self.store.release_monitor_claim(monitor.id, Some(next)).await {
                    // The lease still keeps the monitor out of the next passes
                    warn!(monitor_id = %monitor.id, error = %e, "Failed to advance next check time");
                }
                debug!(
                    monitor_id = %monitor.id,
                    priority = priority.as_str(),
                    queue = %target.name,
                    "Check enqueued"
                );
                true
            }
            Err(e) => {
                error!(monitor_id = %monitor.id, queue = %target.name, error = %e, "Failed to enqueue check");
                if let Err(e) = self.store.release_monitor_claim(monitor.id, None).await {
                    warn!(monitor_id = %monitor.id, error = %e, "Failed to release claim");
                }
                false
            }
        }
    }

    /// Queue a priority class is routed to
    pub fn route(&self, priority: Priority) -> &QueueSettings {
        if priority.is_expedited() {
            &self.queues.priority
        } else {
            &self.queues.bulk
        }
    }

    /// What a pass would enqueue right now. Takes no lease.
    pub async fn preview(&self, limit: usize) -> Result<Vec<PlannedCheck>> {
        let monitors = self.store.monitors_due_for_check(limit).await?;
        Ok(monitors
            .into_iter()
            .map(|monitor| {
                let priority = classify_priority(monitor.status, monitor.interval_minutes);
                PlannedCheck {
                    monitor_id: monitor.id,
                    queue: self.route(priority).name.clone(),
                    name: monitor.name,
                    priority,
                }
            })
            .collect())
    }

    /// Run a pass every `tick` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.config.tick, batch_limit = self.config.batch_limit, "Scheduler started");
        let mut ticker = interval(self.config.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_due_checks().await {
                        error!(error = %e, "Scheduling pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

fn correlation_id(now: DateTime<Utc>) -> String {
    format!("schedule-{}", now.format("%Y-%m-%d"))
}
