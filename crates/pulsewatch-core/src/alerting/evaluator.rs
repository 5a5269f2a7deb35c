//! Alert rule evaluation and dispatch
//!
//! Runs after a check result has been persisted. Nothing here propagates an
//! error into the check pipeline: rule lookups, provider calls and audit
//! writes are logged and counted, one rule's failure never stops the others.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::notifier::{Notification, NotifierRegistry, TriggerKind};
use crate::db::Datastore;
use crate::error::Result;
use crate::models::{
    AlertLog, AlertLogStatus, AlertLogUpdate, AlertPayload, AlertRule, CheckResult,
    HistoryRecord, Monitor, MonitorStatus, RuleBinding,
};

/// Counts from one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    /// Provider accepted the notification
    pub alerts_sent: usize,
    /// Rule did not fire, was cooling down, or already fired for this check
    pub alerts_skipped: usize,
    /// Rule fired but delivery failed
    pub alerts_failed: usize,
}

/// Why a rule stayed quiet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    Disabled,
    BelowThreshold,
    NoOutageAlert,
    RecoveryAlreadySent,
    CoolingDown,
    AlreadyDispatched,
    StoreError,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::BelowThreshold => "below_threshold",
            Self::NoOutageAlert => "no_outage_alert",
            Self::RecoveryAlreadySent => "recovery_already_sent",
            Self::CoolingDown => "cooldown",
            Self::AlreadyDispatched => "already_dispatched",
            Self::StoreError => "store_error",
        }
    }
}

enum Outcome {
    Sent,
    Failed,
    Skipped(SkipReason),
}

/// Length of the failure run at the head of `history` (newest first).
///
/// `history` must already contain the check being evaluated. When the
/// current status is a failure the count is at least one.
pub fn consecutive_failures(history: &[HistoryRecord], current: MonitorStatus) -> i64 {
    if !current.is_failure() {
        return 0;
    }
    let run = history.iter().take_while(|h| h.status.is_failure()).count();
    (run as i64).max(1)
}

/// History as it stood right after `check_id` was recorded.
///
/// Empty when the check is not in `history`: counting newer records would
/// attribute their failures to this check.
fn history_as_of(history: Vec<HistoryRecord>, check_id: Uuid) -> Vec<HistoryRecord> {
    match history.iter().position(|h| h.id == check_id) {
        Some(index) => history.into_iter().skip(index).collect(),
        None => {
            warn!(
                check_id = %check_id,
                scanned = history.len(),
                "Check not found in recent history, evaluating without prior failures"
            );
            Vec::new()
        }
    }
}

/// Evaluates alert rules for a check and dispatches notifications
#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn Datastore>,
    notifiers: NotifierRegistry,
    history_window: i64,
}

impl AlertEvaluator {
    /// Create a new alert evaluator
    pub fn new(store: Arc<dyn Datastore>, notifiers: NotifierRegistry, history_window: i64) -> Self {
        Self {
            store,
            notifiers,
            history_window: history_window.max(1),
        }
    }

    /// History window used when counting failures
    pub fn history_window(&self) -> i64 {
        self.history_window
    }

    /// Evaluate an `ALERT_PROCESSING` message.
    ///
    /// Errors only for datastore failures before any rule was evaluated,
    /// so the message can be redelivered safely.
    #[instrument(skip(self, payload), fields(monitor_id = %payload.monitor_id, check_id = %payload.check_id))]
    pub async fn process(&self, payload: &AlertPayload) -> Result<AlertSummary> {
        let Some(monitor) = self.store.get_monitor(payload.monitor_id).await? else {
            warn!("Monitor no longer exists, dropping alert evaluation");
            return Ok(AlertSummary::default());
        };

        // newer checks may have landed since; read a wider window and cut back
        let history = self
            .store
            .recent_history(monitor.id, self.history_window * 2)
            .await?;
        let history = history_as_of(history, payload.check_id);

        Ok(self
            .evaluate_and_dispatch(
                &monitor,
                payload.previous_status,
                &payload.result,
                payload.check_id,
                &history,
            )
            .await)
    }

    /// Evaluate every active rule of `monitor` against a check result.
    /// `history` is newest first and includes the check itself.
    pub async fn evaluate_and_dispatch(
        &self,
        monitor: &Monitor,
        previous_status: MonitorStatus,
        result: &CheckResult,
        check_id: Uuid,
        history: &[HistoryRecord],
    ) -> AlertSummary {
        let mut summary = AlertSummary::default();

        let Some(trigger) = TriggerKind::from_transition(previous_status, result.status) else {
            return summary;
        };

        let bindings = match self.store.active_alert_rules_for(monitor.id).await {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(monitor_id = %monitor.id, error = %e, "Failed to load alert rules");
                return summary;
            }
        };
        if bindings.is_empty() {
            return summary;
        }

        let failures = consecutive_failures(history, result.status);
        debug!(
            monitor_id = %monitor.id,
            trigger = %trigger,
            failures,
            rules = bindings.len(),
            "Evaluating alert rules"
        );

        for binding in &bindings {
            let outcome = self
                .evaluate_rule(
                    monitor,
                    binding,
                    trigger,
                    previous_status,
                    result,
                    check_id,
                    failures,
                )
                .await;

            let label = match outcome {
                Outcome::Sent => {
                    summary.alerts_sent += 1;
                    "sent"
                }
                Outcome::Failed => {
                    summary.alerts_failed += 1;
                    "failed"
                }
                Outcome::Skipped(reason) => {
                    debug!(rule_id = %binding.rule.id, reason = reason.as_str(), "Alert skipped");
                    summary.alerts_skipped += 1;
                    "skipped"
                }
            };
            metrics::counter!("pulsewatch_alerts_total", "outcome" => label).increment(1);
        }

        summary
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_rule(
        &self,
        monitor: &Monitor,
        binding: &RuleBinding,
        trigger: TriggerKind,
        previous_status: MonitorStatus,
        result: &CheckResult,
        check_id: Uuid,
        failures: i64,
    ) -> Outcome {
        let rule = &binding.rule;

        match self.should_fire(rule, trigger, failures).await {
            Ok(None) => {}
            Ok(Some(reason)) => return Outcome::Skipped(reason),
            Err(e) => {
                error!(rule_id = %rule.id, error = %e, "Failed to evaluate alert rule");
                return Outcome::Skipped(SkipReason::StoreError);
            }
        }

        let now = Utc::now();
        let fresh = AlertLog {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            monitor_id: monitor.id,
            channel_id: binding.channel.id,
            check_id,
            trigger_status: trigger.trigger_status(),
            previous_status,
            consecutive_failures: i32::try_from(failures).unwrap_or(i32::MAX),
            status: AlertLogStatus::Pending,
            error_message: None,
            provider_message_id: None,
            created_at: now,
            sent_at: None,
        };

        let log = match self.store.insert_alert_log(&fresh).await {
            Ok(true) => fresh,
            Ok(false) => match self.store.alert_log_for(rule.id, check_id).await {
                // an earlier delivery stopped before recording an outcome
                Ok(Some(existing)) if existing.status == AlertLogStatus::Pending => {
                    warn!(alert_id = %existing.id, rule_id = %rule.id, "Retrying pending alert");
                    existing
                }
                Ok(_) => return Outcome::Skipped(SkipReason::AlreadyDispatched),
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "Failed to load alert log");
                    return Outcome::Skipped(SkipReason::StoreError);
                }
            },
            Err(e) => {
                error!(rule_id = %rule.id, error = %e, "Failed to write alert log");
                return Outcome::Skipped(SkipReason::StoreError);
            }
        };

        let notification = Notification {
            alert_id: log.id,
            rule_id: rule.id,
            monitor_id: monitor.id,
            monitor_name: monitor.name.clone(),
            url: monitor.url.clone(),
            trigger,
            status: result.status,
            previous_status,
            consecutive_failures: failures,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            error_message: result.error_message.clone(),
            occurred_at: now,
        };

        let (update, outcome) = match self
            .notifiers
            .dispatch(&binding.channel.config, &notification)
            .await
        {
            Ok(delivery) => {
                info!(
                    rule_id = %rule.id,
                    monitor_id = %monitor.id,
                    channel = %binding.channel.kind(),
                    trigger = %trigger,
                    "Alert sent"
                );
                (AlertLogUpdate::sent(delivery.provider_message_id), Outcome::Sent)
            }
            Err(e) => {
                warn!(
                    rule_id = %rule.id,
                    monitor_id = %monitor.id,
                    channel = %binding.channel.kind(),
                    error = %e,
                    "Alert delivery failed"
                );
                (AlertLogUpdate::failed(e.to_string()), Outcome::Failed)
            }
        };

        if let Err(e) = self.store.update_alert_log(log.id, update).await {
            error!(alert_id = %log.id, error = %e, "Failed to record alert outcome");
        }
        outcome
    }

    /// `None` when the rule fires
    async fn should_fire(
        &self,
        rule: &AlertRule,
        trigger: TriggerKind,
        failures: i64,
    ) -> Result<Option<SkipReason>> {
        match trigger {
            TriggerKind::Down | TriggerKind::Timeout => {
                let enabled = match trigger {
                    TriggerKind::Down => rule.alert_on_down,
                    _ => rule.alert_on_timeout,
                };
                if !enabled {
                    return Ok(Some(SkipReason::Disabled));
                }
                // repeats during an outage are gated by the cooldown alone
                if failures < rule.threshold() {
                    return Ok(Some(SkipReason::BelowThreshold));
                }
            }
            TriggerKind::Recovery => {
                if !rule.alert_on_up {
                    return Ok(Some(SkipReason::Disabled));
                }
                let outage = self
                    .store
                    .most_recent_sent_alert(rule.id, &[MonitorStatus::Down, MonitorStatus::Timeout])
                    .await?;
                let Some(outage) = outage else {
                    return Ok(Some(SkipReason::NoOutageAlert));
                };
                if self
                    .store
                    .alert_sent_since(rule.id, outage.created_at, Some(MonitorStatus::Up))
                    .await?
                {
                    return Ok(Some(SkipReason::RecoveryAlreadySent));
                }
            }
        }

        let cooldown = rule.cooldown();
        if cooldown > chrono::Duration::zero()
            && self
                .store
                .alert_sent_since(rule.id, Utc::now() - cooldown, None)
                .await?
        {
            return Ok(Some(SkipReason::CoolingDown));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::notifier::{Delivery, NotificationError, NotificationProvider};
    use crate::db::MemoryStore;
    use crate::models::{ChannelConfig, ChannelKind, NotificationChannel};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationProvider for RecordingProvider {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Email
        }

        async fn send(
            &self,
            _channel: &ChannelConfig,
            notification: &Notification,
        ) -> std::result::Result<Delivery, NotificationError> {
            if self.fail {
                return Err(NotificationError::HttpError("connection reset".to_string()));
            }
            self.sent.lock().push(notification.clone());
            Ok(Delivery {
                provider_message_id: Some(format!("msg-{}", self.sent.lock().len())),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<RecordingProvider>,
        evaluator: AlertEvaluator,
        monitor: Monitor,
        rule: AlertRule,
    }

    fn fixture(configure: impl FnOnce(&mut AlertRule), fail: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let monitor = Monitor::new(Uuid::new_v4(), "api", "https://example.com", 5);
        store.insert_monitor(monitor.clone());

        let channel = NotificationChannel {
            id: Uuid::new_v4(),
            user_id: monitor.user_id,
            name: "ops".to_string(),
            config: ChannelConfig::Email {
                address: "ops@example.com".to_string(),
            },
            is_active: true,
            is_verified: true,
        };
        store.insert_channel(channel.clone());

        let mut rule = AlertRule::new(monitor.id, channel.id);
        configure(&mut rule);
        store.insert_rule(rule.clone());

        let provider = Arc::new(RecordingProvider {
            fail,
            ..RecordingProvider::default()
        });
        let evaluator = AlertEvaluator::new(
            store.clone(),
            NotifierRegistry::new().with_provider(provider.clone()),
            20,
        );

        Fixture {
            store,
            provider,
            evaluator,
            monitor,
            rule,
        }
    }

    fn result(status: MonitorStatus) -> CheckResult {
        CheckResult {
            status,
            response_time_ms: Some(120),
            status_code: (status == MonitorStatus::Up).then_some(200),
            error_message: status.is_failure().then(|| "connection refused".to_string()),
        }
    }

    impl Fixture {
        /// Record a check and evaluate it, like the check processor does
        async fn check(&self, previous: MonitorStatus, status: MonitorStatus) -> AlertSummary {
            let result = result(status);
            let record = HistoryRecord::from_result(self.monitor.id, &result, Utc::now());
            self.store.insert_history(&record).await.unwrap();
            let history = self.store.recent_history(self.monitor.id, 20).await.unwrap();
            self.evaluator
                .evaluate_and_dispatch(&self.monitor, previous, &result, record.id, &history)
                .await
        }

        fn logs(&self) -> Vec<AlertLog> {
            self.store.alert_logs_for(self.rule.id)
        }
    }

    #[tokio::test]
    async fn test_down_alert_is_sent_and_logged() {
        let f = fixture(|_| {}, false);
        let summary = f.check(MonitorStatus::Up, MonitorStatus::Down).await;

        assert_eq!(summary.alerts_sent, 1);
        let logs = f.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, AlertLogStatus::Sent);
        assert_eq!(logs[0].trigger_status, MonitorStatus::Down);
        assert_eq!(logs[0].provider_message_id.as_deref(), Some("msg-1"));
        assert!(logs[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn test_threshold_fires_on_third_failure_then_after_cooldown() {
        let f = fixture(
            |r| {
                r.consecutive_failures_threshold = 3;
                r.cooldown_minutes = 5;
            },
            false,
        );

        assert_eq!(f.check(MonitorStatus::Up, MonitorStatus::Down).await.alerts_sent, 0);
        assert_eq!(f.check(MonitorStatus::Down, MonitorStatus::Down).await.alerts_sent, 0);
        assert_eq!(f.check(MonitorStatus::Down, MonitorStatus::Down).await.alerts_sent, 1);

        let cooling = f.check(MonitorStatus::Down, MonitorStatus::Down).await;
        assert_eq!(cooling.alerts_sent, 0);
        assert_eq!(cooling.alerts_skipped, 1);

        f.store.age_alert_logs(chrono::Duration::minutes(6));
        assert_eq!(f.check(MonitorStatus::Down, MonitorStatus::Down).await.alerts_sent, 1);

        let logs = f.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].consecutive_failures, 3);
        assert_eq!(logs[1].consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_outage_without_cooldown_alerts_every_failure_past_threshold() {
        let f = fixture(
            |r| {
                r.consecutive_failures_threshold = 2;
                r.cooldown_minutes = 0;
            },
            false,
        );

        assert_eq!(f.check(MonitorStatus::Up, MonitorStatus::Timeout).await.alerts_sent, 0);
        assert_eq!(f.check(MonitorStatus::Timeout, MonitorStatus::Timeout).await.alerts_sent, 1);
        assert_eq!(f.check(MonitorStatus::Timeout, MonitorStatus::Timeout).await.alerts_sent, 1);
        assert_eq!(f.logs().len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_requires_prior_outage_alert() {
        let f = fixture(|r| r.alert_on_down = false, false);

        f.check(MonitorStatus::Up, MonitorStatus::Down).await;
        let summary = f.check(MonitorStatus::Down, MonitorStatus::Up).await;

        assert_eq!(summary.alerts_sent, 0);
        assert_eq!(summary.alerts_skipped, 1);
        assert!(f.logs().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_after_outage_alert() {
        let f = fixture(|r| r.cooldown_minutes = 0, false);

        assert_eq!(f.check(MonitorStatus::Up, MonitorStatus::Timeout).await.alerts_sent, 1);
        assert_eq!(f.check(MonitorStatus::Timeout, MonitorStatus::Up).await.alerts_sent, 1);

        let logs = f.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].trigger_status, MonitorStatus::Up);
        assert_eq!(logs[1].previous_status, MonitorStatus::Timeout);
        assert_eq!(f.provider.sent.lock()[1].trigger, TriggerKind::Recovery);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_any_trigger() {
        let f = fixture(|r| r.cooldown_minutes = 30, false);

        assert_eq!(f.check(MonitorStatus::Up, MonitorStatus::Down).await.alerts_sent, 1);
        let summary = f.check(MonitorStatus::Down, MonitorStatus::Up).await;
        assert_eq!(summary.alerts_sent, 0);
        assert_eq!(summary.alerts_skipped, 1);

        f.store.age_alert_logs(chrono::Duration::minutes(31));
        assert_eq!(f.check(MonitorStatus::Up, MonitorStatus::Down).await.alerts_sent, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_logged_not_raised() {
        let f = fixture(|_| {}, true);
        let summary = f.check(MonitorStatus::Up, MonitorStatus::Down).await;

        assert_eq!(summary.alerts_failed, 1);
        let logs = f.logs();
        assert_eq!(logs[0].status, AlertLogStatus::Failed);
        assert_eq!(logs[0].error_message.as_deref(), Some("HTTP error: connection reset"));
    }

    #[tokio::test]
    async fn test_missing_provider_records_failure() {
        let f = fixture(|_| {}, false);
        let evaluator = AlertEvaluator::new(f.store.clone(), NotifierRegistry::new(), 20);
        let result = result(MonitorStatus::Down);
        let summary = evaluator
            .evaluate_and_dispatch(&f.monitor, MonitorStatus::Up, &result, Uuid::new_v4(), &[])
            .await;

        assert_eq!(summary.alerts_failed, 1);
        assert!(f.logs()[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("no provider configured"));
    }

    #[tokio::test]
    async fn test_same_check_is_dispatched_once() {
        let f = fixture(|r| r.cooldown_minutes = 0, false);
        let payload = {
            let result = result(MonitorStatus::Down);
            let record = HistoryRecord::from_result(f.monitor.id, &result, Utc::now());
            f.store.insert_history(&record).await.unwrap();
            AlertPayload {
                monitor_id: f.monitor.id,
                check_id: record.id,
                previous_status: MonitorStatus::Up,
                result,
            }
        };

        assert_eq!(f.evaluator.process(&payload).await.unwrap().alerts_sent, 1);
        let again = f.evaluator.process(&payload).await.unwrap();
        assert_eq!(again.alerts_sent, 0);
        assert_eq!(again.alerts_skipped, 1);
        assert_eq!(f.provider.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_log_is_redispatched_in_place() {
        let f = fixture(|r| r.cooldown_minutes = 0, false);
        let result = result(MonitorStatus::Down);
        let record = HistoryRecord::from_result(f.monitor.id, &result, Utc::now());
        f.store.insert_history(&record).await.unwrap();

        // a worker that wrote the entry and died before calling the provider
        let stranded = AlertLog {
            id: Uuid::new_v4(),
            rule_id: f.rule.id,
            monitor_id: f.monitor.id,
            channel_id: f.rule.channel_id,
            check_id: record.id,
            trigger_status: MonitorStatus::Down,
            previous_status: MonitorStatus::Up,
            consecutive_failures: 1,
            status: AlertLogStatus::Pending,
            error_message: None,
            provider_message_id: None,
            created_at: Utc::now(),
            sent_at: None,
        };
        assert!(f.store.insert_alert_log(&stranded).await.unwrap());

        let payload = AlertPayload {
            monitor_id: f.monitor.id,
            check_id: record.id,
            previous_status: MonitorStatus::Up,
            result,
        };
        let summary = f.evaluator.process(&payload).await.unwrap();
        assert_eq!(summary.alerts_sent, 1);

        let logs = f.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, stranded.id);
        assert_eq!(logs[0].status, AlertLogStatus::Sent);
        assert_eq!(f.provider.sent.lock()[0].alert_id, stranded.id);

        let again = f.evaluator.process(&payload).await.unwrap();
        assert_eq!(again.alerts_skipped, 1);
        assert_eq!(f.provider.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_transition_means_no_rule_lookup() {
        let f = fixture(|_| {}, false);
        let summary = f.check(MonitorStatus::Pending, MonitorStatus::Up).await;
        assert_eq!(summary, AlertSummary::default());
    }

    fn record(status: MonitorStatus) -> HistoryRecord {
        HistoryRecord::from_result(Uuid::new_v4(), &result(status), Utc::now())
    }

    #[test]
    fn test_history_as_of_drops_newer_checks() {
        let newer = record(MonitorStatus::Up);
        let target = record(MonitorStatus::Down);
        let older = record(MonitorStatus::Down);
        let cut = history_as_of(vec![newer, target.clone(), older], target.id);

        assert_eq!(cut.len(), 2);
        assert_eq!(cut[0].id, target.id);
        assert_eq!(consecutive_failures(&cut, MonitorStatus::Down), 2);
    }

    #[test]
    fn test_history_as_of_ignores_newer_checks_when_target_missing() {
        let newer = vec![record(MonitorStatus::Down), record(MonitorStatus::Down)];
        let cut = history_as_of(newer, Uuid::new_v4());

        assert!(cut.is_empty());
        assert_eq!(consecutive_failures(&cut, MonitorStatus::Down), 1);
    }

    fn status_strategy() -> impl Strategy<Value = MonitorStatus> {
        prop_oneof![
            Just(MonitorStatus::Up),
            Just(MonitorStatus::Down),
            Just(MonitorStatus::Timeout),
            Just(MonitorStatus::Pending),
        ]
    }

    proptest! {
        #[test]
        fn prop_failures_match_leading_run(
            statuses in proptest::collection::vec(status_strategy(), 0..30),
            current in status_strategy(),
        ) {
            let history: Vec<HistoryRecord> = statuses.iter().copied().map(record).collect();
            let count = consecutive_failures(&history, current);
            let run = statuses.iter().take_while(|s| s.is_failure()).count() as i64;

            if current.is_failure() {
                prop_assert_eq!(count, run.max(1));
                prop_assert!(count >= 1);
            } else {
                prop_assert_eq!(count, 0);
            }
            prop_assert!(count <= history.len().max(1) as i64);
        }
    }
}
