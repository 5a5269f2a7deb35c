//! Alert rule, notification channel and alert log models

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::monitor::MonitorStatus;

/// Kind of notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Email
    Email,
    /// SMS
    Sms,
    /// Generic webhook
    Webhook,
}

impl ChannelKind {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint configuration of a notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Email address
    Email { address: String },
    /// Phone number in E.164 form
    Sms { phone_number: String },
    /// Generic webhook
    Webhook {
        url: String,
        /// HMAC-SHA256 signing secret
        #[serde(default)]
        secret: Option<String>,
        /// Extra request headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl ChannelConfig {
    /// Channel kind of this configuration
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email { .. } => ChannelKind::Email,
            Self::Sms { .. } => ChannelKind::Sms,
            Self::Webhook { .. } => ChannelKind::Webhook,
        }
    }
}

/// A typed notification endpoint owned by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    /// Unique identifier
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Display name
    pub name: String,

    /// Endpoint configuration
    pub config: ChannelConfig,

    /// Disabled channels are ignored
    pub is_active: bool,

    /// Unverified channels are ignored
    pub is_verified: bool,
}

impl NotificationChannel {
    /// Channel kind
    pub fn kind(&self) -> ChannelKind {
        self.config.kind()
    }

    /// Only active and verified channels receive alerts
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.is_verified
    }
}

/// Binds one monitor to one notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier
    pub id: Uuid,

    /// Monitor watched
    pub monitor_id: Uuid,

    /// Channel notified
    pub channel_id: Uuid,

    /// Alert when the monitor goes down
    pub alert_on_down: bool,

    /// Alert when the monitor recovers
    pub alert_on_up: bool,

    /// Alert when the monitor times out
    pub alert_on_timeout: bool,

    /// Failures in a row required before a down/timeout alert
    pub consecutive_failures_threshold: i32,

    /// Minimum minutes between two sent alerts
    pub cooldown_minutes: i32,

    /// Inactive rules never fire
    pub is_active: bool,

    /// When the rule was created
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// Rule with the usual defaults: down and recovery alerts, threshold 1, 5 minute cooldown
    pub fn new(monitor_id: Uuid, channel_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            channel_id,
            alert_on_down: true,
            alert_on_up: true,
            alert_on_timeout: true,
            consecutive_failures_threshold: 1,
            cooldown_minutes: 5,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Threshold clamped to at least one failure
    pub fn threshold(&self) -> i64 {
        i64::from(self.consecutive_failures_threshold.max(1))
    }

    /// Cooldown window
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.cooldown_minutes.max(0)))
    }
}

/// An active rule together with its eligible channel
#[derive(Debug, Clone)]
pub struct RuleBinding {
    pub rule: AlertRule,
    pub channel: NotificationChannel,
}

/// Delivery state of an alert log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertLogStatus {
    /// Written before the provider is called
    #[default]
    Pending,
    /// Provider accepted the notification
    Sent,
    /// Provider rejected the notification or was unreachable
    Failed,
}

impl AlertLogStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AlertLogStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(crate::error::Error::validation(format!(
                "unknown alert log status '{other}'"
            ))),
        }
    }
}

/// Append-only audit record of one dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLog {
    /// Unique identifier
    pub id: Uuid,

    /// Rule that fired
    pub rule_id: Uuid,

    /// Monitor the rule watches
    pub monitor_id: Uuid,

    /// Channel notified
    pub channel_id: Uuid,

    /// History record that caused the dispatch
    pub check_id: Uuid,

    /// Status that triggered the alert
    pub trigger_status: MonitorStatus,

    /// Status before the triggering check
    pub previous_status: MonitorStatus,

    /// Consecutive failures when the alert fired
    pub consecutive_failures: i32,

    /// Delivery state
    pub status: AlertLogStatus,

    /// Provider error text
    pub error_message: Option<String>,

    /// Identifier returned by the provider
    pub provider_message_id: Option<String>,

    /// When the attempt started
    pub created_at: DateTime<Utc>,

    /// When the provider accepted the notification
    pub sent_at: Option<DateTime<Utc>>,
}

/// Final state written to an alert log entry after the provider call
#[derive(Debug, Clone, PartialEq)]
pub struct AlertLogUpdate {
    pub status: AlertLogStatus,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl AlertLogUpdate {
    /// Provider accepted the notification
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            status: AlertLogStatus::Sent,
            error_message: None,
            provider_message_id,
            sent_at: Some(Utc::now()),
        }
    }

    /// Provider call failed
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: AlertLogStatus::Failed,
            error_message: Some(error.into()),
            provider_message_id: None,
            sent_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_is_tagged() {
        let config: ChannelConfig = serde_json::from_value(serde_json::json!({
            "type": "webhook",
            "url": "https://hooks.example.com/x"
        }))
        .unwrap();

        assert_eq!(config.kind(), ChannelKind::Webhook);
        match config {
            ChannelConfig::Webhook { secret, headers, .. } => {
                assert!(secret.is_none());
                assert!(headers.is_empty());
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_threshold_is_clamped() {
        let mut rule = AlertRule::new(Uuid::new_v4(), Uuid::new_v4());
        rule.consecutive_failures_threshold = 0;
        assert_eq!(rule.threshold(), 1);
        rule.consecutive_failures_threshold = 3;
        assert_eq!(rule.threshold(), 3);
    }

    #[test]
    fn test_unverified_channel_is_not_eligible() {
        let channel = NotificationChannel {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "ops".to_string(),
            config: ChannelConfig::Email {
                address: "ops@example.com".to_string(),
            },
            is_active: true,
            is_verified: false,
        };
        assert!(!channel.is_eligible());
    }
}
