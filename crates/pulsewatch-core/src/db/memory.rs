//! In-process datastore
//!
//! Mirrors the Postgres semantics closely enough to drive the whole pipeline
//! in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::Datastore;
use crate::error::{Error, Result};
use crate::models::{
    AlertLog, AlertLogStatus, AlertLogUpdate, AlertRule, HistoryRecord, Monitor, MonitorStatus,
    MonitorUpdate, NotificationChannel, RuleBinding,
};

#[derive(Default)]
struct State {
    monitors: HashMap<Uuid, Monitor>,
    history: Vec<HistoryRecord>,
    rules: Vec<AlertRule>,
    channels: HashMap<Uuid, NotificationChannel>,
    alert_logs: Vec<AlertLog>,
}

/// Datastore kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a monitor
    pub fn insert_monitor(&self, monitor: Monitor) {
        self.state.write().monitors.insert(monitor.id, monitor);
    }

    /// Insert or replace a notification channel
    pub fn insert_channel(&self, channel: NotificationChannel) {
        self.state.write().channels.insert(channel.id, channel);
    }

    /// Insert an alert rule
    pub fn insert_rule(&self, rule: AlertRule) {
        self.state.write().rules.push(rule);
    }

    /// Snapshot of a monitor
    pub fn monitor(&self, id: Uuid) -> Option<Monitor> {
        self.state.read().monitors.get(&id).cloned()
    }

    /// History of a monitor, oldest first
    pub fn history_for(&self, monitor_id: Uuid) -> Vec<HistoryRecord> {
        self.state
            .read()
            .history
            .iter()
            .filter(|h| h.monitor_id == monitor_id)
            .cloned()
            .collect()
    }

    /// Alert logs of a rule, oldest first
    pub fn alert_logs_for(&self, rule_id: Uuid) -> Vec<AlertLog> {
        self.state
            .read()
            .alert_logs
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect()
    }

    /// Shift every alert log into the past, e.g. to step over a cooldown
    pub fn age_alert_logs(&self, by: Duration) {
        for log in &mut self.state.write().alert_logs {
            log.created_at -= by;
            log.sent_at = log.sent_at.map(|t| t - by);
        }
    }

    /// Make a monitor due now
    pub fn make_due(&self, id: Uuid) {
        if let Some(monitor) = self.state.write().monitors.get_mut(&id) {
            monitor.next_check_at = Utc::now() - Duration::seconds(1);
            monitor.claimed_until = None;
        }
    }

    fn due_ids(state: &State, limit: usize, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<&Monitor> = state.monitors.values().filter(|m| m.is_due(now)).collect();
        due.sort_by_key(|m| m.next_check_at);
        due.into_iter().take(limit).map(|m| m.id).collect()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn monitors_due_for_check(&self, limit: usize) -> Result<Vec<Monitor>> {
        let now = Utc::now();
        let state = self.state.read();
        let mut due: Vec<Monitor> = state
            .monitors
            .values()
            .filter(|m| m.is_active && m.next_check_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|m| m.next_check_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_due_monitors(
        &self,
        limit: usize,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Monitor>> {
        let mut state = self.state.write();
        let ids = Self::due_ids(&state, limit, now);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(monitor) = state.monitors.get_mut(&id) {
                monitor.claimed_until = Some(lease_until);
                claimed.push(monitor.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_monitor_claim(
        &self,
        id: Uuid,
        next_check_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let monitor = state
            .monitors
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("monitor", id.to_string()))?;

        monitor.claimed_until = None;
        if let Some(next) = next_check_at {
            monitor.next_check_at = next;
        }
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>> {
        Ok(self.state.read().monitors.get(&id).cloned())
    }

    async fn update_monitor(&self, id: Uuid, update: MonitorUpdate) -> Result<()> {
        let mut state = self.state.write();
        let monitor = state
            .monitors
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("monitor", id.to_string()))?;

        if let Some(status) = update.status {
            monitor.status = status;
        }
        if let Some(response_time) = update.response_time_ms {
            monitor.response_time_ms = Some(response_time);
        }
        if let Some(checked) = update.last_checked_at {
            monitor.last_checked_at = Some(checked);
        }
        if let Some(next) = update.next_check_at {
            monitor.next_check_at = next;
        }
        Ok(())
    }

    async fn insert_history(&self, record: &HistoryRecord) -> Result<()> {
        self.state.write().history.push(record.clone());
        Ok(())
    }

    async fn recent_history(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<HistoryRecord>> {
        let state = self.state.read();
        let mut records: Vec<HistoryRecord> = state
            .history
            .iter()
            .filter(|h| h.monitor_id == monitor_id)
            .cloned()
            .collect();
        // equal timestamps keep insertion order, so the latest insert ends up first
        records.sort_by_key(|h| h.checked_at);
        records.reverse();
        records.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(records)
    }

    async fn active_alert_rules_for(&self, monitor_id: Uuid) -> Result<Vec<RuleBinding>> {
        let state = self.state.read();
        Ok(state
            .rules
            .iter()
            .filter(|r| r.monitor_id == monitor_id && r.is_active)
            .filter_map(|rule| {
                state
                    .channels
                    .get(&rule.channel_id)
                    .filter(|c| c.is_eligible())
                    .map(|channel| RuleBinding {
                        rule: rule.clone(),
                        channel: channel.clone(),
                    })
            })
            .collect())
    }

    async fn insert_alert_log(&self, log: &AlertLog) -> Result<bool> {
        let mut state = self.state.write();
        if state
            .alert_logs
            .iter()
            .any(|l| l.rule_id == log.rule_id && l.check_id == log.check_id)
        {
            return Ok(false);
        }
        state.alert_logs.push(log.clone());
        Ok(true)
    }

    async fn alert_log_for(&self, rule_id: Uuid, check_id: Uuid) -> Result<Option<AlertLog>> {
        let state = self.state.read();
        Ok(state
            .alert_logs
            .iter()
            .find(|l| l.rule_id == rule_id && l.check_id == check_id)
            .cloned())
    }

    async fn update_alert_log(&self, id: Uuid, update: AlertLogUpdate) -> Result<()> {
        let mut state = self.state.write();
        let log = state
            .alert_logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| Error::not_found("alert log", id.to_string()))?;

        log.status = update.status;
        log.error_message = update.error_message;
        log.provider_message_id = update.provider_message_id;
        log.sent_at = update.sent_at;
        Ok(())
    }

    async fn most_recent_sent_alert(
        &self,
        rule_id: Uuid,
        statuses: &[MonitorStatus],
    ) -> Result<Option<AlertLog>> {
        let state = self.state.read();
        Ok(state
            .alert_logs
            .iter()
            .filter(|l| {
                l.rule_id == rule_id
                    && l.status == AlertLogStatus::Sent
                    && statuses.contains(&l.trigger_status)
            })
            .max_by_key(|l| l.created_at)
            .cloned())
    }

    async fn alert_sent_since(
        &self,
        rule_id: Uuid,
        after: DateTime<Utc>,
        trigger_status: Option<MonitorStatus>,
    ) -> Result<bool> {
        let state = self.state.read();
        Ok(state.alert_logs.iter().any(|l| {
            l.rule_id == rule_id
                && l.status == AlertLogStatus::Sent
                && l.created_at > after
                && trigger_status.map_or(true, |s| l.trigger_status == s)
        }))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
