//! Durable queue abstraction
//!
//! At-least-once delivery with visibility timeouts, optional per-group
//! ordering, retention and a dead-letter queue. Deleting a message is the
//! acknowledgment; anything not deleted comes back once its visibility
//! timeout lapses, until `max_receive_count` is exceeded.

mod memory;
mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, QueueBackend};
use crate::error::{Error, Result};
use crate::models::QueueMessage;

/// Per-queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue name
    pub name: String,

    /// How long a received message stays hidden from other consumers
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Messages older than this are dropped
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Deliveries allowed before a message is dead-lettered
    pub max_receive_count: u32,

    /// FIFO within a message group, one in-flight message per group
    pub ordered: bool,
}

impl QueueSettings {
    /// Settings with the default check-queue policy
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(4 * 24 * 60 * 60),
            max_receive_count: 3,
            ordered: false,
        }
    }

    /// Name of the dead-letter queue paired with this queue
    pub fn dead_letter_name(&self) -> String {
        format!("{}-dlq", self.name)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Options for a single send
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message group; only meaningful on ordered queues
    pub group_id: Option<String>,

    /// Free-form attributes delivered alongside the body
    pub attributes: HashMap<String, String>,
}

impl SendOptions {
    /// Options with a message group
    pub fn grouped(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Opaque token identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Handle for a message id and its delivery number
    pub fn new(message_id: &str, receive_count: u32) -> Self {
        Self(format!("{message_id}:{receive_count}"))
    }

    /// Split back into message id and delivery number
    pub fn parts(&self) -> Option<(&str, u32)> {
        let (id, count) = self.0.rsplit_once(':')?;
        Some((id, count.parse().ok()?))
    }

    /// Raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Queue-assigned id
    pub message_id: String,

    /// Token for delete and visibility calls; invalid after redelivery
    pub receipt_handle: ReceiptHandle,

    /// Raw body
    pub body: String,

    /// Attributes given at send time
    pub attributes: HashMap<String, String>,

    /// Deliveries so far, including this one
    pub receive_count: u32,

    /// When the message was sent
    pub sent_at: DateTime<Utc>,
}

impl ReceivedMessage {
    /// Decode the body as a pipeline message
    pub fn decode(&self) -> Result<QueueMessage> {
        QueueMessage::from_json(&self.body)
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    /// Queue name
    pub name: String,
    /// Messages waiting to be received
    pub depth: u64,
    /// Messages received but neither deleted nor expired
    pub in_flight: u64,
    /// Age of the oldest message still in the queue
    pub oldest_age_seconds: Option<u64>,
    /// Messages in the dead-letter queue
    pub dead_lettered: u64,
}

/// Queue operations the pipeline consumes
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Send a raw body, returning the message id
    async fn send(&self, queue: &str, body: String, options: SendOptions) -> Result<String>;

    /// Receive up to `max` messages, waiting up to `wait` for the first one
    async fn receive_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge a delivery. `false` when the handle is stale.
    async fn delete(&self, queue: &str, handle: &ReceiptHandle) -> Result<bool>;

    /// Hide a delivery for `timeout` from now. `false` when the handle is stale.
    async fn extend_visibility(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<bool>;

    /// Queue statistics
    async fn attributes(&self, queue: &str) -> Result<QueueAttributes>;

    /// Connectivity check
    async fn health_check(&self) -> Result<()>;

    /// Serialize and send a pipeline message
    async fn send_message(
        &self,
        queue: &str,
        message: &QueueMessage,
        options: SendOptions,
    ) -> Result<String> {
        let body = message.to_json()?;
        self.send(queue, body, options).await
    }
}

/// Build the configured queue backend
pub async fn connect(config: &Config) -> Result<Arc<dyn QueueService>> {
    let queues = config.queues.all();
    match config.queues.backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(queues))),
        QueueBackend::Redis => {
            let queue = RedisQueue::new(&config.redis, queues)?;
            queue.health_check().await?;
            Ok(Arc::new(queue))
        }
    }
}

pub(crate) fn unknown(queue: &str) -> Error {
    Error::UnknownQueue(queue.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_handle_parts() {
        let handle = ReceiptHandle::new("5f0c:abc", 3);
        assert_eq!(handle.as_str(), "5f0c:abc:3");
        assert_eq!(handle.parts(), Some(("5f0c:abc", 3)));
        assert_eq!(ReceiptHandle("garbage".to_string()).parts(), None);
    }

    #[test]
    fn test_settings_deserialize_humantime() {
        let settings: QueueSettings = serde_json::from_value(serde_json::json!({
            "name": "alerts",
            "visibility_timeout": "2m",
            "ordered": true
        }))
        .unwrap();

        assert_eq!(settings.visibility_timeout, Duration::from_secs(120));
        assert_eq!(settings.max_receive_count, 3);
        assert!(settings.ordered);
        assert_eq!(settings.dead_letter_name(), "alerts-dlq");
    }
}
