//! Operational HTTP API against in-memory backends

mod common;

use std::net::SocketAddr;

use common::Harness;
use pretty_assertions::assert_eq;
use pulsewatch::api::handlers::RunScheduleResponse;
use pulsewatch::api::{AppState, HttpServer};
use pulsewatch::models::{MessageBody, QueueMessage};
use pulsewatch::queue::QueueService;
use pulsewatch::scheduler::ScheduleReport;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;

struct Api {
    base: String,
    client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<pulsewatch::Result<()>>,
}

async fn start(harness: &Harness) -> Api {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);

    let server = HttpServer::new(AppState {
        store: harness.store.clone(),
        queue: harness.queue.clone(),
        scheduler: harness.scheduler.clone(),
        queues: harness.queues.clone(),
    });
    let server = tokio::spawn(server.serve_on(listener, rx));

    Api {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        shutdown,
        server,
    }
}

impl Api {
    async fn stop(self) {
        let Api {
            client,
            shutdown,
            server,
            ..
        } = self;
        drop(client);
        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_health_reports_ok() {
    let harness = Harness::new(1, 0).await;
    let api = start(&harness).await;

    let response = api.client.get(format!("{}/health", api.base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
    assert_eq!(body["queue"], true);

    api.stop().await;
}

#[tokio::test]
async fn test_run_schedule_enqueues_due_monitor() {
    let harness = Harness::new(1, 0).await;
    harness.store.make_due(harness.monitor_id);
    let api = start(&harness).await;

    let response = api
        .client
        .post(format!("{}/api/v1/schedule/run", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: RunScheduleResponse = response.json().await.unwrap();
    assert_eq!(
        body.report,
        Some(ScheduleReport {
            total: 1,
            enqueued: 1,
            errors: 0
        })
    );
    assert!(body.message_id.is_none());

    let queues: Value = api
        .client
        .get(format!("{}/api/v1/queues", api.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let queues = queues.as_array().unwrap();
    assert_eq!(queues.len(), 3);
    let waiting: u64 = queues.iter().map(|q| q["depth"].as_u64().unwrap()).sum();
    assert_eq!(waiting, 1);

    api.stop().await;
}

#[tokio::test]
async fn test_deferred_schedule_publishes_bulk_message() {
    let harness = Harness::new(1, 0).await;
    let api = start(&harness).await;

    let response = api
        .client
        .post(format!("{}/api/v1/schedule/run?deferred=true&limit=5", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let received = harness
        .queue
        .receive_batch(&harness.queues.bulk.name, 10, common::POLL)
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    let message: QueueMessage = received[0].decode().unwrap();
    match message.body {
        MessageBody::BulkSchedule(payload) => assert_eq!(payload.limit, Some(5)),
        other => panic!("unexpected message body: {other:?}"),
    }

    api.stop().await;
}

#[tokio::test]
async fn test_zero_limit_rejected() {
    let harness = Harness::new(1, 0).await;
    let api = start(&harness).await;

    let response = api
        .client
        .post(format!("{}/api/v1/schedule/run?limit=0", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    api.stop().await;
}

#[tokio::test]
async fn test_dlq_review_for_unknown_queue_is_not_found() {
    let harness = Harness::new(1, 0).await;
    let api = start(&harness).await;

    let response = api
        .client
        .post(format!("{}/api/v1/queues/nope/dlq-review", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = api
        .client
        .post(format!("{}/api/v1/queues/{}/dlq-review", api.base, harness.queues.alerts.name))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["attributes"]["dead_lettered"], 0);
    assert!(body["messageId"].is_string());

    api.stop().await;
}
