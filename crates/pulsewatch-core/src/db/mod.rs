//! Datastore layer for Pulsewatch
//!
//! The pipeline only talks to the [`Datastore`] trait. [`PostgresStore`] is
//! the production implementation; [`MemoryStore`] backs tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresPool, PostgresStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AlertLog, AlertLogUpdate, HistoryRecord, Monitor, MonitorStatus, MonitorUpdate, RuleBinding,
};

/// Read/write contract the pipeline needs from the persistent store.
///
/// Every write is scoped to a single monitor, history, or alert log row.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Active monitors whose `next_check_at` has passed, oldest due first.
    /// Does not take a lease.
    async fn monitors_due_for_check(&self, limit: usize) -> Result<Vec<Monitor>>;

    /// Like [`Datastore::monitors_due_for_check`] but atomically stamps
    /// `claimed_until = lease_until` on the returned rows and skips rows
    /// holding an unexpired lease.
    async fn claim_due_monitors(
        &self,
        limit: usize,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Monitor>>;

    /// Clear a scheduling lease, advancing `next_check_at` when given
    async fn release_monitor_claim(
        &self,
        id: Uuid,
        next_check_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Fetch one monitor
    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>>;

    /// Apply a partial update to a monitor
    async fn update_monitor(&self, id: Uuid, update: MonitorUpdate) -> Result<()>;

    /// Append a history record
    async fn insert_history(&self, record: &HistoryRecord) -> Result<()>;

    /// Most recent history records for a monitor, newest first
    async fn recent_history(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<HistoryRecord>>;

    /// Active rules for a monitor whose channel is active and verified
    async fn active_alert_rules_for(&self, monitor_id: Uuid) -> Result<Vec<RuleBinding>>;

    /// Append an alert log entry. Returns `false` without writing when the
    /// rule already has an entry for the same `check_id`.
    async fn insert_alert_log(&self, log: &AlertLog) -> Result<bool>;

    /// The entry a rule wrote for `check_id`, if any
    async fn alert_log_for(&self, rule_id: Uuid, check_id: Uuid) -> Result<Option<AlertLog>>;

    /// Record the outcome of a dispatch attempt
    async fn update_alert_log(&self, id: Uuid, update: AlertLogUpdate) -> Result<()>;

    /// Latest `sent` entry for a rule whose trigger status is one of `statuses`
    async fn most_recent_sent_alert(
        &self,
        rule_id: Uuid,
        statuses: &[MonitorStatus],
    ) -> Result<Option<AlertLog>>;

    /// Whether a `sent` entry exists for the rule created strictly after
    /// `after`, optionally restricted to one trigger status
    async fn alert_sent_since(
        &self,
        rule_id: Uuid,
        after: DateTime<Utc>,
        trigger_status: Option<MonitorStatus>,
    ) -> Result<bool>;

    /// Connectivity check
    async fn health_check(&self) -> Result<()>;
}
