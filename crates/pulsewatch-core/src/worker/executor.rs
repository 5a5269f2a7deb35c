//! HTTP health check execution

use std::time::{Duration, Instant};

use reqwest::{redirect, Client};
use tracing::debug;
use url::Url;

use crate::config::CheckConfig;
use crate::error::Result;
use crate::models::{CheckResult, MonitorStatus};

/// Issues one GET per check and classifies the outcome
#[derive(Clone)]
pub struct HealthCheckExecutor {
    client: Client,
    default_timeout: Duration,
}

impl HealthCheckExecutor {
    /// Create a new executor. The client is shared by every check.
    pub fn new(config: &CheckConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            default_timeout: config.default_timeout,
        })
    }

    /// Timeout for a monitor, falling back to the configured default
    pub fn timeout_for(&self, timeout_seconds: Option<i32>) -> Duration {
        match timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => self.default_timeout,
        }
    }

    /// Check `url`. Never fails: every outcome is a classification.
    pub async fn execute(&self, url: &str, timeout: Duration) -> CheckResult {
        if let Err(reason) = check_target(url) {
            debug!(url, reason = %reason, "Rejected check target");
            return CheckResult {
                status: MonitorStatus::Down,
                response_time_ms: None,
                status_code: None,
                error_message: Some(reason),
            };
        }

        let started = Instant::now();
        let outcome = self.client.get(url).timeout(timeout).send().await;
        let response_time_ms = Some(i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX));

        let result = match outcome {
            Ok(response) => {
                let status = response.status();
                let code = Some(i32::from(status.as_u16()));
                if status.is_success() || status.is_redirection() {
                    CheckResult {
                        status: MonitorStatus::Up,
                        response_time_ms,
                        status_code: code,
                        error_message: None,
                    }
                } else {
                    CheckResult {
                        status: MonitorStatus::Down,
                        response_time_ms,
                        status_code: code,
                        error_message: Some(format!("HTTP {status}")),
                    }
                }
            }
            Err(e) if e.is_timeout() => CheckResult {
                status: MonitorStatus::Timeout,
                response_time_ms,
                status_code: None,
                error_message: Some(format!("timed out after {}ms", timeout.as_millis())),
            },
            Err(e) => CheckResult {
                status: MonitorStatus::Down,
                response_time_ms,
                status_code: e.status().map(|s| i32::from(s.as_u16())),
                error_message: Some(e.to_string()),
            },
        };

        debug!(url, status = %result.status, response_time_ms = ?result.response_time_ms, "Check executed");
        result
    }
}

fn check_target(url: &str) -> std::result::Result<(), String> {
    let parsed = Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported URL scheme '{other}'")),
    }
}
