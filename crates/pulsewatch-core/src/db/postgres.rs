//! PostgreSQL connection and queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::warn;
use uuid::Uuid;

use super::Datastore;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    AlertLog, AlertLogStatus, AlertLogUpdate, AlertRule, ChannelConfig, HistoryRecord, Monitor,
    MonitorStatus, MonitorUpdate, NotificationChannel, RuleBinding,
};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const MONITOR_COLUMNS: &str = r#"
    id, user_id, name, url, interval_minutes, timeout_seconds, is_active, status,
    response_time_ms, last_checked_at, next_check_at, claimed_until, created_at
"#;

const ALERT_LOG_COLUMNS: &str = r#"
    id, rule_id, monitor_id, channel_id, check_id, trigger_status, previous_status,
    consecutive_failures, status, error_message, provider_message_id, created_at, sent_at
"#;

/// [`Datastore`] backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store on an existing pool
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

#[async_trait]
impl Datastore for PostgresStore {
    async fn monitors_due_for_check(&self, limit: usize) -> Result<Vec<Monitor>> {
        let sql = format!(
            r#"
            SELECT {MONITOR_COLUMNS}
            FROM monitors
            WHERE is_active AND next_check_at <= NOW()
            ORDER BY next_check_at
            LIMIT $1
            "#
        );

        let rows = sqlx::query_as::<_, MonitorRow>(&sql)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_due_monitors(
        &self,
        limit: usize,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Monitor>> {
        // SKIP LOCKED lets concurrent passes split the due set instead of blocking
        let sql = format!(
            r#"
            UPDATE monitors
            SET claimed_until = $2
            WHERE id IN (
                SELECT id
                FROM monitors
                WHERE is_active
                  AND next_check_at <= $3
                  AND (claimed_until IS NULL OR claimed_until < $3)
                ORDER BY next_check_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {MONITOR_COLUMNS}
            "#
        );

        let rows = sqlx::query_as::<_, MonitorRow>(&sql)
            .bind(limit_param(limit))
            .bind(lease_until)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the subquery order
        let mut monitors: Vec<Monitor> = rows.into_iter().map(Into::into).collect();
        monitors.sort_by_key(|m| m.next_check_at);
        Ok(monitors)
    }

    async fn release_monitor_claim(
        &self,
        id: Uuid,
        next_check_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET claimed_until = NULL,
                next_check_at = COALESCE($2, next_check_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_check_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("monitor", id.to_string()));
        }
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>> {
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = $1");
        let row = sqlx::query_as::<_, MonitorRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn update_monitor(&self, id: Uuid, update: MonitorUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET status = COALESCE($2, status),
                response_time_ms = COALESCE($3, response_time_ms),
                last_checked_at = COALESCE($4, last_checked_at),
                next_check_at = COALESCE($5, next_check_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.response_time_ms)
        .bind(update.last_checked_at)
        .bind(update.next_check_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("monitor", id.to_string()));
        }
        Ok(())
    }

    async fn insert_history(&self, record: &HistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO monitor_history (
                id, monitor_id, status, response_time_ms, status_code, error_message, checked_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.monitor_id)
        .bind(record.status.as_str())
        .bind(record.response_time_ms)
        .bind(record.status_code)
        .bind(&record.error_message)
        .bind(record.checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_history(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, monitor_id, status, response_time_ms, status_code, error_message, checked_at
            FROM monitor_history
            WHERE monitor_id = $1
            ORDER BY checked_at DESC
            LIMIT $2
            "#,
        )
        .bind(monitor_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn active_alert_rules_for(&self, monitor_id: Uuid) -> Result<Vec<RuleBinding>> {
        let rows = sqlx::query_as::<_, RuleBindingRow>(
            r#"
            SELECT
                r.id, r.monitor_id, r.channel_id, r.alert_on_down, r.alert_on_up,
                r.alert_on_timeout, r.consecutive_failures_threshold, r.cooldown_minutes,
                r.is_active, r.created_at,
                c.user_id AS channel_user_id,
                c.name AS channel_name,
                c.config AS channel_config,
                c.is_active AS channel_is_active,
                c.is_verified AS channel_is_verified
            FROM alert_rules r
            JOIN notification_channels c ON c.id = r.channel_id
            WHERE r.monitor_id = $1
              AND r.is_active
              AND c.is_active
              AND c.is_verified
            ORDER BY r.created_at
            "#,
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let rule_id = row.id;
                match RuleBinding::try_from(row) {
                    Ok(binding) => Some(binding),
                    Err(e) => {
                        warn!(rule_id = %rule_id, error = %e, "Skipping rule with unreadable channel config");
                        None
                    }
                }
            })
            .collect())
    }

    async fn insert_alert_log(&self, log: &AlertLog) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO alert_logs (
                id, rule_id, monitor_id, channel_id, check_id, trigger_status, previous_status,
                consecutive_failures, status, error_message, provider_message_id, created_at, sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (rule_id, check_id) DO NOTHING
            "#,
        )
        .bind(log.id)
        .bind(log.rule_id)
        .bind(log.monitor_id)
        .bind(log.channel_id)
        .bind(log.check_id)
        .bind(log.trigger_status.as_str())
        .bind(log.previous_status.as_str())
        .bind(log.consecutive_failures)
        .bind(log.status.as_str())
        .bind(&log.error_message)
        .bind(&log.provider_message_id)
        .bind(log.created_at)
        .bind(log.sent_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn alert_log_for(&self, rule_id: Uuid, check_id: Uuid) -> Result<Option<AlertLog>> {
        let sql = format!(
            r#"
            SELECT {ALERT_LOG_COLUMNS}
            FROM alert_logs
            WHERE rule_id = $1 AND check_id = $2
            "#
        );

        let row = sqlx::query_as::<_, AlertLogRow>(&sql)
            .bind(rule_id)
            .bind(check_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn update_alert_log(&self, id: Uuid, update: AlertLogUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE alert_logs
            SET status = $2, error_message = $3, provider_message_id = $4, sent_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.error_message)
        .bind(&update.provider_message_id)
        .bind(update.sent_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("alert log", id.to_string()));
        }
        Ok(())
    }

    async fn most_recent_sent_alert(
        &self,
        rule_id: Uuid,
        statuses: &[MonitorStatus],
    ) -> Result<Option<AlertLog>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {ALERT_LOG_COLUMNS}
            FROM alert_logs
            WHERE rule_id = $1
              AND status = 'sent'
              AND trigger_status = ANY($2)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, AlertLogRow>(&sql)
            .bind(rule_id)
            .bind(&statuses)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn alert_sent_since(
        &self,
        rule_id: Uuid,
        after: DateTime<Utc>,
        trigger_status: Option<MonitorStatus>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM alert_logs
                WHERE rule_id = $1
                  AND status = 'sent'
                  AND created_at > $2
                  AND ($3::TEXT IS NULL OR trigger_status = $3)
            )
            "#,
        )
        .bind(rule_id)
        .bind(after)
        .bind(trigger_status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_status(raw: &str) -> MonitorStatus {
    raw.parse().unwrap_or(MonitorStatus::Unknown)
}

// Row types for database mapping

#[derive(sqlx::FromRow)]
struct MonitorRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    url: String,
    interval_minutes: i32,
    timeout_seconds: Option<i32>,
    is_active: bool,
    status: String,
    response_time_ms: Option<i32>,
    last_checked_at: Option<DateTime<Utc>>,
    next_check_at: DateTime<Utc>,
    claimed_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<MonitorRow> for Monitor {
    fn from(row: MonitorRow) -> Self {
        Monitor {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            url: row.url,
            interval_minutes: row.interval_minutes,
            timeout_seconds: row.timeout_seconds,
            is_active: row.is_active,
            status: parse_status(&row.status),
            response_time_ms: row.response_time_ms,
            last_checked_at: row.last_checked_at,
            next_check_at: row.next_check_at,
            claimed_until: row.claimed_until,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    monitor_id: Uuid,
    status: String,
    response_time_ms: Option<i32>,
    status_code: Option<i32>,
    error_message: Option<String>,
    checked_at: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        HistoryRecord {
            id: row.id,
            monitor_id: row.monitor_id,
            status: parse_status(&row.status),
            response_time_ms: row.response_time_ms,
            status_code: row.status_code,
            error_message: row.error_message,
            checked_at: row.checked_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleBindingRow {
    id: Uuid,
    monitor_id: Uuid,
    channel_id: Uuid,
    alert_on_down: bool,
    alert_on_up: bool,
    alert_on_timeout: bool,
    consecutive_failures_threshold: i32,
    cooldown_minutes: i32,
    is_active: bool,
    created_at: DateTime<Utc>,
    channel_user_id: Uuid,
    channel_name: String,
    channel_config: serde_json::Value,
    channel_is_active: bool,
    channel_is_verified: bool,
}

impl TryFrom<RuleBindingRow> for RuleBinding {
    type Error = serde_json::Error;

    fn try_from(row: RuleBindingRow) -> std::result::Result<Self, Self::Error> {
        let config: ChannelConfig = serde_json::from_value(row.channel_config)?;

        Ok(RuleBinding {
            rule: AlertRule {
                id: row.id,
                monitor_id: row.monitor_id,
                channel_id: row.channel_id,
                alert_on_down: row.alert_on_down,
                alert_on_up: row.alert_on_up,
                alert_on_timeout: row.alert_on_timeout,
                consecutive_failures_threshold: row.consecutive_failures_threshold,
                cooldown_minutes: row.cooldown_minutes,
                is_active: row.is_active,
                created_at: row.created_at,
            },
            channel: NotificationChannel {
                id: row.channel_id,
                user_id: row.channel_user_id,
                name: row.channel_name,
                config,
                is_active: row.channel_is_active,
                is_verified: row.channel_is_verified,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertLogRow {
    id: Uuid,
    rule_id: Uuid,
    monitor_id: Uuid,
    channel_id: Uuid,
    check_id: Uuid,
    trigger_status: String,
    previous_status: String,
    consecutive_failures: i32,
    status: String,
    error_message: Option<String>,
    provider_message_id: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl From<AlertLogRow> for AlertLog {
    fn from(row: AlertLogRow) -> Self {
        AlertLog {
            id: row.id,
            rule_id: row.rule_id,
            monitor_id: row.monitor_id,
            channel_id: row.channel_id,
            check_id: row.check_id,
            trigger_status: parse_status(&row.trigger_status),
            previous_status: parse_status(&row.previous_status),
            consecutive_failures: row.consecutive_failures,
            status: row.status.parse().unwrap_or(AlertLogStatus::Failed),
            error_message: row.error_message,
            provider_message_id: row.provider_message_id,
            created_at: row.created_at,
            sent_at: row.sent_at,
        }
    }
}
