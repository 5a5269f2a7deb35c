//! Notification delivery for alerts

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::{EmailProviderConfig, NotificationsConfig, SmsProviderConfig};
use crate::models::{ChannelConfig, ChannelKind, MonitorStatus};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook body signature
pub const SIGNATURE_HEADER: &str = "X-Pulsewatch-Signature";

/// Header carrying the webhook event name
pub const EVENT_HEADER: &str = "X-Pulsewatch-Event";

/// Notification errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Provider returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("no provider configured for {0} channels")]
    NoProvider(ChannelKind),

    #[error("{provider} provider cannot deliver to a {channel} channel")]
    ChannelMismatch {
        provider: ChannelKind,
        channel: ChannelKind,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpError(err.to_string())
    }
}

/// What kind of transition an alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Down,
    Timeout,
    Recovery,
}

impl TriggerKind {
    /// Trigger implied by a check moving from `previous` to `current`
    pub fn from_transition(previous: MonitorStatus, current: MonitorStatus) -> Option<Self> {
        match current {
            MonitorStatus::Down => Some(Self::Down),
            MonitorStatus::Timeout => Some(Self::Timeout),
            MonitorStatus::Up if previous.is_failure() => Some(Self::Recovery),
            _ => None,
        }
    }

    /// Status written as the alert log's trigger status
    pub fn trigger_status(&self) -> MonitorStatus {
        match self {
            Self::Down => MonitorStatus::Down,
            Self::Timeout => MonitorStatus::Timeout,
            Self::Recovery => MonitorStatus::Up,
        }
    }

    /// Webhook event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Down => "monitor.down",
            Self::Timeout => "monitor.timeout",
            Self::Recovery => "monitor.recovered",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Down => "down",
            Self::Timeout => "timeout",
            Self::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

/// Everything a provider needs to render one alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub alert_id: Uuid,
    pub rule_id: Uuid,
    pub monitor_id: Uuid,
    pub monitor_name: String,
    pub url: String,
    pub trigger: TriggerKind,
    pub status: MonitorStatus,
    pub previous_status: MonitorStatus,
    pub consecutive_failures: i64,
    pub response_time_ms: Option<i32>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    /// Short subject line
    pub fn subject(&self) -> String {
        match self.trigger {
            TriggerKind::Down => format!("[Pulsewatch] {} is DOWN", self.monitor_name),
            TriggerKind::Timeout => format!("[Pulsewatch] {} is TIMING OUT", self.monitor_name),
            TriggerKind::Recovery => format!("[Pulsewatch] {} has RECOVERED", self.monitor_name),
        }
    }

    /// Plain-text body
    pub fn body(&self) -> String {
        let mut lines = vec![
            self.subject(),
            String::new(),
            format!("URL: {}", self.url),
            format!("Status: {} (was {})", self.status, self.previous_status),
        ];
        if let Some(code) = self.status_code {
            lines.push(format!("HTTP status: {code}"));
        }
        if let Some(ms) = self.response_time_ms {
            lines.push(format!("Response time: {ms}ms"));
        }
        if self.trigger != TriggerKind::Recovery {
            lines.push(format!("Consecutive failures: {}", self.consecutive_failures));
        }
        if let Some(error) = &self.error_message {
            lines.push(format!("Error: {error}"));
        }
        lines.push(format!("Time: {}", self.occurred_at.to_rfc3339()));
        lines.join("\n")
    }

    /// One-line text for SMS
    pub fn short_text(&self) -> String {
        let mut text = self.subject();
        if let Some(error) = &self.error_message {
            text.push_str(": ");
            text.push_str(error);
        }
        text.chars().take(160).collect()
    }
}

/// Accepted notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Identifier assigned by the provider
    pub provider_message_id: Option<String>,
}

/// Delivers notifications for one channel kind
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Channel kind served
    fn kind(&self) -> ChannelKind;

    /// Deliver one notification to `channel`
    async fn send(
        &self,
        channel: &ChannelConfig,
        notification: &Notification,
    ) -> Result<Delivery, NotificationError>;
}

/// Providers by channel kind
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    providers: HashMap<ChannelKind, Arc<dyn NotificationProvider>>,
}

impl NotifierRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every provider the configuration has credentials for
    pub fn from_config(config: &NotificationsConfig) -> Result<Self, NotificationError> {
        let mut registry =
            Self::new().with_provider(Arc::new(WebhookProvider::new(config.webhook.timeout)?));
        if let Some(email) = &config.email {
            registry = registry.with_provider(Arc::new(EmailProvider::new(email.clone())?));
        }
        if let Some(sms) = &config.sms {
            registry = registry.with_provider(Arc::new(SmsProvider::new(sms.clone())?));
        }
        Ok(registry)
    }

    /// Add or replace the provider for its kind
    pub fn with_provider(mut self, provider: Arc<dyn NotificationProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Kinds with a provider
    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.providers.keys().copied().collect()
    }

    /// Route a notification to the provider of the channel's kind
    pub async fn dispatch(
        &self,
        channel: &ChannelConfig,
        notification: &Notification,
    ) -> Result<Delivery, NotificationError> {
        let kind = channel.kind();
        let provider = self
            .providers
            .get(&kind)
            .ok_or(NotificationError::NoProvider(kind))?;
        provider.send(channel, notification).await
    }
}

fn http_client(timeout: Duration) -> Result<Client, NotificationError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NotificationError::ConfigError(e.to_string()))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, NotificationError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(NotificationError::Rejected { status, body })
}

fn mismatch(provider: ChannelKind, channel: &ChannelConfig) -> NotificationError {
    NotificationError::ChannelMismatch {
        provider,
        channel: channel.kind(),
    }
}

/// Generic webhook with optional HMAC signature
pub struct WebhookProvider {
    client: Client,
}

/// JSON body posted to webhook channels
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    event: &'static str,
    #[serde(flatten)]
    notification: &'a Notification,
}

impl WebhookProvider {
    /// Create a new webhook provider
    pub fn new(timeout: Duration) -> Result<Self, NotificationError> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

/// `sha256=<hex>` signature of `body` under `secret`
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, NotificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotificationError::ConfigError(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(
        &self,
        channel: &ChannelConfig,
        notification: &Notification,
    ) -> Result<Delivery, NotificationError> {
        let ChannelConfig::Webhook {
            url,
            secret,
            headers,
        } = channel
        else {
            return Err(mismatch(self.kind(), channel));
        };

        let body = serde_json::to_vec(&WebhookPayload {
            event: notification.trigger.event_name(),
            notification,
        })
        .map_err(|e| NotificationError::ConfigError(e.to_string()))?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, notification.trigger.event_name());
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(secret) = secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        ensure_success(request.body(body).send().await?).await?;

        info!(rule_id = %notification.rule_id, url = %url, "Webhook notification sent");
        Ok(Delivery::default())
    }
}

/// Email through a JSON mail API
pub struct EmailProvider {
    client: Client,
    config: EmailProviderConfig,
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmailResponse {
    #[serde(default)]
    id: Option<String>,
}

impl EmailProvider {
    /// Create a new email provider
    pub fn new(config: EmailProviderConfig) -> Result<Self, NotificationError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            config,
        })
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(
        &self,
        channel: &ChannelConfig,
        notification: &Notification,
    ) -> Result<Delivery, NotificationError> {
        let ChannelConfig::Email { address } = channel else {
            return Err(mismatch(self.kind(), channel));
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&EmailRequest {
                from: &self.config.from,
                to: address,
                subject: notification.subject(),
                text: notification.body(),
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let id = response
            .json::<EmailResponse>()
            .await
            .ok()
            .and_then(|r| r.id);

        info!(rule_id = %notification.rule_id, "Email notification sent");
        Ok(Delivery {
            provider_message_id: id,
        })
    }
}

/// SMS through a Twilio-style form API
pub struct SmsProvider {
    client: Client,
    config: SmsProviderConfig,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(default)]
    sid: Option<String>,
}

impl SmsProvider {
    /// Create a new SMS provider
    pub fn new(config: SmsProviderConfig) -> Result<Self, NotificationError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            config,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl NotificationProvider for SmsProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(
        &self,
        channel: &ChannelConfig,
        notification: &Notification,
    ) -> Result<Delivery, NotificationError> {
        let ChannelConfig::Sms { phone_number } = channel else {
            return Err(mismatch(self.kind(), channel));
        };

        let text = notification.short_text();
        let form = [
            ("To", phone_number.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", text.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let sid = response.json::<SmsResponse>().await.ok().and_then(|r| r.sid);

        info!(rule_id = %notification.rule_id, "SMS notification sent");
        Ok(Delivery {
            provider_message_id: sid,
        })
    }
}
