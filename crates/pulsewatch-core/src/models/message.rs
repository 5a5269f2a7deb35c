//! Queue message envelope and payloads
//!
//! On the wire every message is a JSON object
//! `{messageId, messageType, version, timestamp, source, retryCount, maxRetries, correlationId?, payload}`.
//! In memory the payload is a [`MessageBody`] variant, so consumers match on
//! the message kind instead of inspecting `messageType` at runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use super::monitor::{CheckResult, Monitor, MonitorStatus};

/// Current envelope version
pub const MESSAGE_VERSION: &str = "1.0";

/// Scheduling tier of a check message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Failing monitors and one-minute intervals
    Critical,
    /// Intervals up to five minutes
    High,
    /// Everything else
    Normal,
    /// Healthy monitors with long intervals
    Low,
}

impl Priority {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Critical and high go to the low-latency queue
    pub fn is_expedited(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

/// Discriminant written as `messageType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    MonitorCheck,
    AlertProcessing,
    BulkSchedule,
    DlqReview,
}

/// Check settings captured when the message was built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSnapshot {
    pub url: String,
    pub timeout_seconds: Option<i32>,
    pub interval_minutes: i32,
}

/// Result of the check before this one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousCheck {
    pub status: MonitorStatus,
    pub response_time_ms: Option<i32>,
}

/// `MONITOR_CHECK` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPayload {
    pub monitor_id: Uuid,
    pub user_id: Uuid,
    pub priority: Priority,
    pub check: CheckSnapshot,
    pub previous: PreviousCheck,
}

impl CheckPayload {
    /// Snapshot a monitor for checking
    pub fn for_monitor(monitor: &Monitor, priority: Priority) -> Self {
        Self {
            monitor_id: monitor.id,
            user_id: monitor.user_id,
            priority,
            check: CheckSnapshot {
                url: monitor.url.clone(),
                timeout_seconds: monitor.timeout_seconds,
                interval_minutes: monitor.interval_minutes,
            },
            previous: PreviousCheck {
                status: monitor.status,
                response_time_ms: monitor.response_time_ms,
            },
        }
    }
}

/// `ALERT_PROCESSING` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub monitor_id: Uuid,
    /// History record written for the check
    pub check_id: Uuid,
    pub previous_status: MonitorStatus,
    pub result: CheckResult,
}

/// `BULK_SCHEDULE` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSchedulePayload {
    /// Overrides the configured batch limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// `DLQ_REVIEW` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqReviewPayload {
    /// Source queue whose dead-letter queue should be reviewed
    pub queue: String,
}

/// Message payload, one variant per message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageBody {
    MonitorCheck(CheckPayload),
    AlertProcessing(AlertPayload),
    BulkSchedule(BulkSchedulePayload),
    DlqReview(DlqReviewPayload),
}

impl MessageBody {
    /// Wire discriminant
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::MonitorCheck(_) => MessageType::MonitorCheck,
            Self::AlertProcessing(_) => MessageType::AlertProcessing,
            Self::BulkSchedule(_) => MessageType::BulkSchedule,
            Self::DlqReview(_) => MessageType::DlqReview,
        }
    }
}

/// Immutable queue-transported message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Advisory only; redelivery is counted by the queue
    pub retry_count: u32,
    pub max_retries: u32,
    pub correlation_id: Option<String>,
    pub body: MessageBody,
}

impl QueueMessage {
    /// New message with a fresh id and zero retries
    pub fn new(body: MessageBody, source: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            version: MESSAGE_VERSION.to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            retry_count: 0,
            max_retries: 3,
            correlation_id: None,
            body,
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the advisory retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wire discriminant
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Serialize to the wire format
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the wire format
    pub fn from_json(body: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageRef<'a> {
    message_id: &'a Uuid,
    message_type: MessageType,
    version: &'a str,
    timestamp: &'a DateTime<Utc>,
    source: &'a str,
    retry_count: u32,
    max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    payload: &'a MessageBody,
}

impl Serialize for QueueMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawMessageRef {
            message_id: &self.message_id,
            message_type: self.message_type(),
            version: &self.version,
            timestamp: &self.timestamp,
            source: &self.source,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            correlation_id: self.correlation_id.as_deref(),
            payload: &self.body,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    message_id: Uuid,
    message_type: MessageType,
    version: String,
    timestamp: DateTime<Utc>,
    source: String,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    correlation_id: Option<String>,
    payload: serde_json::Value,
}

impl TryFrom<RawMessage> for QueueMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let body = match raw.message_type {
            MessageType::MonitorCheck => MessageBody::MonitorCheck(serde_json::from_value(raw.payload)?),
            MessageType::AlertProcessing => {
                MessageBody::AlertProcessing(serde_json::from_value(raw.payload)?)
            }
            MessageType::BulkSchedule => MessageBody::BulkSchedule(serde_json::from_value(raw.payload)?),
            MessageType::DlqReview => MessageBody::DlqReview(serde_json::from_value(raw.payload)?),
        };

        Ok(Self {
            message_id: raw.message_id,
            version: raw.version,
            timestamp: raw.timestamp,
            source: raw.source,
            retry_count: raw.retry_count,
            max_retries: raw.max_retries,
            correlation_id: raw.correlation_id,
            body,
        })
    }
}
