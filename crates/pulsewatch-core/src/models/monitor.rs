//! Monitor, check result and history models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last known status of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    /// Endpoint answered with 2xx/3xx
    Up,
    /// Endpoint answered with another status, or the connection failed
    Down,
    /// Endpoint did not answer within the timeout
    Timeout,
    /// Never checked
    #[default]
    Pending,
    /// Status could not be determined
    Unknown,
}

impl MonitorStatus {
    /// Database and wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Timeout => "timeout",
            Self::Pending => "pending",
            Self::Unknown => "unknown",
        }
    }

    /// `down` and `timeout` count as failures
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Down | Self::Timeout)
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "timeout" => Ok(Self::Timeout),
            "pending" => Ok(Self::Pending),
            "unknown" => Ok(Self::Unknown),
            other => Err(crate::error::Error::validation(format!(
                "unknown monitor status '{other}'"
            ))),
        }
    }
}

/// A user-registered HTTP endpoint under periodic observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    /// Unique identifier
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Display name
    pub name: String,

    /// Target URL
    pub url: String,

    /// Minutes between checks
    pub interval_minutes: i32,

    /// Per-monitor timeout override in seconds
    pub timeout_seconds: Option<i32>,

    /// Inactive monitors are never scheduled
    pub is_active: bool,

    /// Last known status
    pub status: MonitorStatus,

    /// Response time of the last check in milliseconds
    pub response_time_ms: Option<i32>,

    /// When the last check completed
    pub last_checked_at: Option<DateTime<Utc>>,

    /// When the monitor becomes due again
    pub next_check_at: DateTime<Utc>,

    /// Scheduling lease; the monitor is invisible to other passes until then
    pub claimed_until: Option<DateTime<Utc>>,

    /// When the monitor was created
    pub created_at: DateTime<Utc>,
}

impl Monitor {
    /// Create an active, never-checked monitor that is due immediately
    pub fn new(user_id: Uuid, name: impl Into<String>, url: impl Into<String>, interval_minutes: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            url: url.into(),
            interval_minutes,
            timeout_seconds: None,
            is_active: true,
            status: MonitorStatus::Pending,
            response_time_ms: None,
            last_checked_at: None,
            next_check_at: now,
            claimed_until: None,
            created_at: now,
        }
    }

    /// Check interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes.max(1)))
    }

    /// Next check time counted from `from`
    pub fn next_check_from(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + self.interval()
    }

    /// Whether a scheduling pass at `now` may select this monitor
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.next_check_at <= now
            && self.claimed_until.map_or(true, |until| until < now)
    }
}

/// Partial update of a monitor row; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorUpdate {
    pub status: Option<MonitorStatus>,
    pub response_time_ms: Option<i32>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
}

/// Outcome of one health check. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Classified status
    pub status: MonitorStatus,

    /// Wall-clock time of the request in milliseconds
    pub response_time_ms: Option<i32>,

    /// HTTP status code, when a response arrived
    pub status_code: Option<i32>,

    /// Error text for failed checks
    pub error_message: Option<String>,
}

/// Append-only record of one executed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Unique identifier; alert logs refer to it as `check_id`
    pub id: Uuid,

    /// Monitor checked
    pub monitor_id: Uuid,

    /// Classified status
    pub status: MonitorStatus,

    /// Response time in milliseconds
    pub response_time_ms: Option<i32>,

    /// HTTP status code
    pub status_code: Option<i32>,

    /// Error text
    pub error_message: Option<String>,

    /// When the check completed
    pub checked_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Project a check result into a history record
    pub fn from_result(monitor_id: Uuid, result: &CheckResult, checked_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            status: result.status,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            error_message: result.error_message.clone(),
            checked_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            MonitorStatus::Up,
            MonitorStatus::Down,
            MonitorStatus::Timeout,
            MonitorStatus::Pending,
            MonitorStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<MonitorStatus>().unwrap(), status);
        }
        assert!("sideways".parse::<MonitorStatus>().is_err());
    }

    #[test]
    fn test_is_due_respects_lease() {
        let now = Utc::now();
        let mut monitor = Monitor::new(Uuid::new_v4(), "api", "https://example.com", 5);
        monitor.next_check_at = now - Duration::minutes(1);
        assert!(monitor.is_due(now));

        monitor.claimed_until = Some(now + Duration::minutes(5));
        assert!(!monitor.is_due(now));

        monitor.claimed_until = Some(now - Duration::seconds(1));
        assert!(monitor.is_due(now));

        monitor.is_active = false;
        assert!(!monitor.is_due(now));
    }

    #[test]
    fn test_next_check_advances_by_interval() {
        let now = Utc::now();
        let monitor = Monitor::new(Uuid::new_v4(), "api", "https://example.com", 15);
        assert_eq!(monitor.next_check_from(now) - now, Duration::minutes(15));
    }
}
