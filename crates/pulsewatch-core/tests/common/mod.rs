//! Shared wiring for pipeline integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pulsewatch::alerting::{AlertEvaluator, NotifierRegistry, WebhookProvider};
use pulsewatch::config::{CheckConfig, QueueBackend, QueuesConfig, SchedulerConfig, WorkerConfig};
use pulsewatch::db::MemoryStore;
use pulsewatch::models::{AlertRule, ChannelConfig, Monitor, NotificationChannel};
use pulsewatch::queue::{MemoryQueue, QueueService};
use pulsewatch::scheduler::Scheduler;
use pulsewatch::worker::{
    AlertHandoff, BatchReport, CheckProcessor, HealthCheckExecutor, PipelineHandler, WorkerPool,
};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const POLL: Duration = Duration::from_millis(20);

/// In-memory store and queues, a fake target and a fake webhook receiver
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub queues: QueuesConfig,
    pub scheduler: Arc<Scheduler>,
    pub priority: WorkerPool,
    pub bulk: WorkerPool,
    pub alerts: WorkerPool,
    pub target: MockServer,
    pub hooks: MockServer,
    pub monitor_id: Uuid,
    pub rule_id: Uuid,
}

impl Harness {
    /// One monitor with one webhook rule
    pub async fn new(threshold: i32, cooldown_minutes: i32) -> Self {
        let queues = QueuesConfig {
            backend: QueueBackend::Memory,
            ..QueuesConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(queues.all()));

        let target = MockServer::start().await;
        let hooks = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&hooks)
            .await;

        let user_id = Uuid::new_v4();
        let monitor = Monitor::new(user_id, "checkout", format!("{}/status", target.uri()), 1);
        let channel = NotificationChannel {
            id: Uuid::new_v4(),
            user_id,
            name: "ops hook".to_string(),
            config: ChannelConfig::Webhook {
                url: format!("{}/hook", hooks.uri()),
                secret: Some("s3cret".to_string()),
                headers: HashMap::new(),
            },
            is_active: true,
            is_verified: true,
        };
        let mut rule = AlertRule::new(monitor.id, channel.id);
        rule.consecutive_failures_threshold = threshold;
        rule.cooldown_minutes = cooldown_minutes;

        let monitor_id = monitor.id;
        let rule_id = rule.id;
        store.insert_monitor(monitor);
        store.insert_channel(channel);
        store.insert_rule(rule);

        let dyn_queue: Arc<dyn QueueService> = queue.clone();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            dyn_queue.clone(),
            SchedulerConfig::default(),
            queues.clone(),
        ));

        let notifiers = NotifierRegistry::new().with_provider(Arc::new(
            WebhookProvider::new(Duration::from_secs(5)).expect("webhook client"),
        ));
        let evaluator = AlertEvaluator::new(store.clone(), notifiers, 20);
        let executor = HealthCheckExecutor::new(&CheckConfig::default()).expect("http client");
        let checks = CheckProcessor::new(
            store.clone(),
            executor,
            evaluator.clone(),
            AlertHandoff::Queue {
                queue: dyn_queue.clone(),
                name: queues.alerts.name.clone(),
            },
        );
        let handler = Arc::new(PipelineHandler::new(
            checks,
            evaluator,
            scheduler.clone(),
            dyn_queue.clone(),
        ));

        let worker = WorkerConfig {
            wait: POLL,
            error_backoff: POLL,
            ..WorkerConfig::default()
        };
        let pool = |settings| {
            WorkerPool::new(dyn_queue.clone(), handler.clone(), settings, worker.clone())
        };

        Self {
            priority: pool(queues.priority.clone()),
            bulk: pool(queues.bulk.clone()),
            alerts: pool(queues.alerts.clone()),
            store,
            queue,
            queues,
            scheduler,
            target,
            hooks,
            monitor_id,
            rule_id,
        }
    }

    /// Make the target answer every request with `status`
    pub async fn target_responds(&self, status: u16) {
        self.target.reset().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.target)
            .await;
    }

    /// Schedule the monitor, run its check and drain the alert queue
    pub async fn cycle(&self, status: u16) -> BatchReport {
        self.target_responds(status).await;
        self.store.make_due(self.monitor_id);

        let report = self.scheduler.schedule_due_checks().await.expect("schedule");
        assert_eq!(report.enqueued, 1, "monitor should be scheduled exactly once");

        let priority = self.priority.poll_once(POLL).await.expect("priority poll");
        let bulk = self.bulk.poll_once(POLL).await.expect("bulk poll");
        assert_eq!(priority.processed + bulk.processed, 1, "one check should run");

        self.drain_alerts().await
    }

    /// Process alert messages until the queue is empty
    pub async fn drain_alerts(&self) -> BatchReport {
        let mut total = BatchReport::default();
        loop {
            let report = self.alerts.poll_once(POLL).await.expect("alert poll");
            if report.received == 0 {
                return total;
            }
            total.received += report.received;
            total.processed += report.processed;
            total.skipped += report.skipped;
            total.failed += report.failed;
            total.malformed += report.malformed;
        }
    }

    /// `event` field of every webhook the receiver saw, in order
    pub async fn webhook_events(&self) -> Vec<String> {
        self.hooks
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| {
                let body: serde_json::Value =
                    serde_json::from_slice(&request.body).expect("webhook body is json");
                body["event"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }
}
