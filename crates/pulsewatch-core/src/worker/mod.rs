//! Queue consumers
//!
//! A [`WorkerPool`] long-polls one queue and feeds each message to a
//! [`MessageHandler`]. Successful messages are deleted; failed ones are left
//! for the queue to redeliver and eventually dead-letter.

mod check;
mod executor;
mod handler;

pub use check::{AlertHandoff, CheckOutcome, CheckProcessor};
pub use executor::HealthCheckExecutor;
pub use handler::{HandleOutcome, MessageHandler, PipelineHandler};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::queue::{QueueService, QueueSettings, ReceivedMessage};

/// How a batch is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Up to `parallelism` messages at once; failures are isolated per message
    Independent { parallelism: usize },
    /// One message at a time, in receive order
    Sequential,
}

/// Counts from one receive-and-process round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Processed,
    Skipped,
    Failed,
    Malformed,
}

impl MessageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Malformed => "malformed",
        }
    }
}

/// Consumes one queue
pub struct WorkerPool {
    queue: Arc<dyn QueueService>,
    handler: Arc<dyn MessageHandler>,
    settings: QueueSettings,
    strategy: Strategy,
    config: WorkerConfig,
}

impl WorkerPool {
    /// Create a pool; ordered queues are consumed sequentially
    pub fn new(
        queue: Arc<dyn QueueService>,
        handler: Arc<dyn MessageHandler>,
        settings: QueueSettings,
        config: WorkerConfig,
    ) -> Self {
        let strategy = if settings.ordered {
            Strategy::Sequential
        } else {
            Strategy::Independent {
                parallelism: config.parallel_workers.max(1),
            }
        };

        Self {
            queue,
            handler,
            settings,
            strategy,
            config,
        }
    }

    /// Override the processing strategy
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Queue consumed
    pub fn queue_name(&self) -> &str {
        &self.settings.name
    }

    /// Receive one batch (waiting up to `wait`) and process it
    pub async fn poll_once(&self, wait: Duration) -> Result<BatchReport> {
        let messages = self
            .queue
            .receive_batch(&self.settings.name, self.config.max_messages, wait)
            .await?;
        Ok(self.process_batch(messages).await)
    }

    /// Poll until `shutdown` flips to true. A batch in progress is finished first.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.settings.name, strategy = ?self.strategy, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive_batch(
                    &self.settings.name,
                    self.config.max_messages,
                    self.config.wait,
                ) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    let report = self.process_batch(messages).await;
                    debug!(queue = %self.settings.name, ?report, "Batch processed");
                }
                Err(e) => {
                    error!(queue = %self.settings.name, error = %e, "Receive failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(jittered(self.config.error_backoff)) => {}
                    }
                }
            }
        }

        info!(queue = %self.settings.name, "Worker stopped");
    }

    async fn process_batch(&self, messages: Vec<ReceivedMessage>) -> BatchReport {
        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };

        let outcomes: Vec<MessageOutcome> = match self.strategy {
            Strategy::Sequential => {
                let mut outcomes = Vec::with_capacity(messages.len());
                for message in messages {
                    outcomes.push(self.process_one(message).await);
                }
                outcomes
            }
            Strategy::Independent { parallelism } => {
                stream::iter(messages)
                    .map(|message| self.process_one(message))
                    .buffer_unordered(parallelism.max(1))
                    .collect()
                    .await
            }
        };

        for outcome in outcomes {
            metrics::counter!(
                "pulsewatch_messages_total",
                "queue" => self.settings.name.clone(),
                "outcome" => outcome.as_str()
            )
            .increment(1);
            match outcome {
                MessageOutcome::Processed => report.processed += 1,
                MessageOutcome::Skipped => report.skipped += 1,
                MessageOutcome::Failed => report.failed += 1,
                MessageOutcome::Malformed => report.malformed += 1,
            }
        }
        report
    }

    async fn process_one(&self, received: ReceivedMessage) -> MessageOutcome {
        let message = match received.decode() {
            Ok(message) => message,
            Err(e) => {
                // left in place so the queue dead-letters it after max receives
                warn!(
                    queue = %self.settings.name,
                    message_id = %received.message_id,
                    receive_count = received.receive_count,
                    error = %e,
                    "Malformed message"
                );
                return MessageOutcome::Malformed;
            }
        };
        let message_type = message.message_type();

        let result = self.handle_with_heartbeat(&received, message).await;

        let (acknowledge, outcome) = match result {
            Ok(HandleOutcome::Processed) => (true, MessageOutcome::Processed),
            Ok(HandleOutcome::Skipped(reason)) => {
                debug!(message_id = %received.message_id, reason = %reason, "Message skipped");
                (true, MessageOutcome::Skipped)
            }
            Err(e @ Error::NotFound { .. }) => {
                warn!(message_id = %received.message_id, error = %e, "Referenced row is gone, dropping message");
                (true, MessageOutcome::Skipped)
            }
            Err(e) => {
                warn!(
                    queue = %self.settings.name,
                    message_id = %received.message_id,
                    message_type = ?message_type,
                    receive_count = received.receive_count,
                    transient = e.is_transient(),
                    error = %e,
                    "Handler failed, leaving message for redelivery"
                );
                (false, MessageOutcome::Failed)
            }
        };

        if acknowledge {
            match self.queue.delete(&self.settings.name, &received.receipt_handle).await {
                Ok(true) => {}
                Ok(false) => warn!(message_id = %received.message_id, "Receipt handle expired before delete"),
                Err(e) => error!(message_id = %received.message_id, error = %e, "Failed to delete message"),
            }
        }
        outcome
    }

    /// Run the handler, extending visibility every half timeout while it works
    async fn handle_with_heartbeat(
        &self,
        received: &ReceivedMessage,
        message: crate::models::QueueMessage,
    ) -> Result<HandleOutcome> {
        let visibility = self.settings.visibility_timeout;
        let period = (visibility / 2).max(Duration::from_secs(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        let handling = self.handler.handle(message);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                result = &mut handling => return result,
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .extend_visibility(&self.settings.name, &received.receipt_handle, visibility)
                        .await
                    {
                        Ok(true) => debug!(message_id = %received.message_id, "Visibility extended"),
                        Ok(false) => warn!(message_id = %received.message_id, "Could not extend visibility, message may be redelivered"),
                        Err(e) => warn!(message_id = %received.message_id, error = %e, "Visibility extension failed"),
                    }
                }
            }
        }
    }
}

/// `base` spread by up to a quarter either way
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BulkSchedulePayload, MessageBody, QueueMessage};
    use crate::queue::{MemoryQueue, SendOptions};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Fails every message whose `limit` is odd
    #[derive(Default)]
    struct ParityHandler {
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl MessageHandler for ParityHandler {
        async fn handle(&self, message: QueueMessage) -> Result<HandleOutcome> {
            let MessageBody::BulkSchedule(BulkSchedulePayload { limit: Some(limit) }) = message.body else {
                return Ok(HandleOutcome::Skipped("unexpected".to_string()));
            };
            self.seen.lock().push(limit);
            if limit % 2 == 1 {
                Err(Error::queue("odd"))
            } else {
                Ok(HandleOutcome::Processed)
            }
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(30),
            ..QueueSettings::new("jobs")
        }
    }

    async fn send(queue: &MemoryQueue, limit: usize) {
        let message = QueueMessage::new(
            MessageBody::BulkSchedule(BulkSchedulePayload { limit: Some(limit) }),
            "test",
        );
        queue.send_message("jobs", &message, SendOptions::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_and_not_deleted() {
        let queue = Arc::new(MemoryQueue::new([settings()]));
        for limit in 1..=4 {
            send(&queue, limit).await;
        }
        let handler = Arc::new(ParityHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), settings(), WorkerConfig::default());

        let report = pool.poll_once(Duration::ZERO).await.unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(handler.seen.lock().len(), 4);

        let attributes = queue.attributes("jobs").await.unwrap();
        assert_eq!(attributes.in_flight, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        let retry = pool.poll_once(Duration::ZERO).await.unwrap();
        assert_eq!(retry.received, 2);
        assert_eq!(retry.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_left_for_dead_letter() {
        let queue = Arc::new(MemoryQueue::new([QueueSettings {
            max_receive_count: 1,
            ..settings()
        }]));
        queue.send("jobs", "not json".to_string(), SendOptions::default()).await.unwrap();
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::new(ParityHandler::default()),
            settings(),
            WorkerConfig::default(),
        );

        assert_eq!(pool.poll_once(Duration::ZERO).await.unwrap().malformed, 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.poll_once(Duration::ZERO).await.unwrap().received, 0);
        assert_eq!(queue.attributes("jobs").await.unwrap().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_strategy_preserves_order() {
        let queue = Arc::new(MemoryQueue::new([settings()]));
        for limit in [2, 4, 6] {
            send(&queue, limit).await;
        }
        let handler = Arc::new(ParityHandler::default());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), settings(), WorkerConfig::default())
            .with_strategy(Strategy::Sequential);

        assert_eq!(pool.poll_once(Duration::ZERO).await.unwrap().processed, 3);
        assert_eq!(*handler.seen.lock(), vec![2, 4, 6]);
        assert_eq!(queue.attributes("jobs").await.unwrap().depth, 0);
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _message: QueueMessage) -> Result<HandleOutcome> {
            tokio::time::sleep(Duration::from_secs(70)).await;
            Ok(HandleOutcome::Processed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_slow_message_invisible() {
        let queue = Arc::new(MemoryQueue::new([settings()]));
        send(&queue, 2).await;
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(SlowHandler),
            settings(),
            WorkerConfig::default(),
        ));

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.poll_once(Duration::ZERO).await })
        };

        tokio::time::sleep(Duration::from_secs(45)).await;
        let attributes = queue.attributes("jobs").await.unwrap();
        assert_eq!(attributes.in_flight, 1);
        assert_eq!(attributes.depth, 0);

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(queue.attributes("jobs").await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new([settings()]));
        let pool = WorkerPool::new(
            queue,
            Arc::new(ParityHandler::default()),
            settings(),
            WorkerConfig::default(),
        );
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(pool.run_forever(rx), stop);
        })
        .await
        .unwrap();
    }
}
