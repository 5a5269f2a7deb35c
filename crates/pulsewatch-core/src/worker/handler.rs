//! Message handlers

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::check::{CheckOutcome, CheckProcessor};
use crate::alerting::AlertEvaluator;
use crate::error::Result;
use crate::models::{MessageBody, QueueMessage};
use crate::queue::QueueService;
use crate::scheduler::Scheduler;

/// What a handler did with a message. Both variants acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Processed,
    Skipped(String),
}

/// Processes one decoded message. An `Err` leaves the message for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<HandleOutcome>;
}

/// Handles every pipeline message type
pub struct PipelineHandler {
    checks: CheckProcessor,
    evaluator: AlertEvaluator,
    scheduler: Arc<Scheduler>,
    queue: Arc<dyn QueueService>,
}

impl PipelineHandler {
    /// Create a new pipeline handler
    pub fn new(
        checks: CheckProcessor,
        evaluator: AlertEvaluator,
        scheduler: Arc<Scheduler>,
        queue: Arc<dyn QueueService>,
    ) -> Self {
        Self {
            checks,
            evaluator,
            scheduler,
            queue,
        }
    }
}

#[async_trait]
impl MessageHandler for PipelineHandler {
    async fn handle(&self, message: QueueMessage) -> Result<HandleOutcome> {
        if message.retry_count > 0 {
            info!(
                message_id = %message.message_id,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                "Handling retried message"
            );
        }

        match message.body {
            MessageBody::MonitorCheck(payload) => match self.checks.process(&payload).await? {
                CheckOutcome::Checked { .. } => Ok(HandleOutcome::Processed),
                CheckOutcome::Skipped(reason) => Ok(HandleOutcome::Skipped(reason.to_string())),
            },
            MessageBody::AlertProcessing(payload) => {
                let summary = self.evaluator.process(&payload).await?;
                info!(
                    monitor_id = %payload.monitor_id,
                    sent = summary.alerts_sent,
                    skipped = summary.alerts_skipped,
                    failed = summary.alerts_failed,
                    "Alert evaluation complete"
                );
                Ok(HandleOutcome::Processed)
            }
            MessageBody::BulkSchedule(payload) => {
                let report = match payload.limit {
                    Some(limit) => self.scheduler.schedule_with_limit(limit).await?,
                    None => self.scheduler.schedule_due_checks().await?,
                };
                info!(
                    total = report.total,
                    enqueued = report.enqueued,
                    errors = report.errors,
                    "Bulk schedule complete"
                );
                Ok(HandleOutcome::Processed)
            }
            MessageBody::DlqReview(payload) => {
                let attributes = self.queue.attributes(&payload.queue).await?;
                if attributes.dead_lettered > 0 {
                    warn!(
                        queue = %payload.queue,
                        dead_lettered = attributes.dead_lettered,
                        "Dead-letter queue needs review"
                    );
                } else {
                    info!(queue = %payload.queue, "Dead-letter queue is empty");
                }
                Ok(HandleOutcome::Processed)
            }
        }
    }
}
