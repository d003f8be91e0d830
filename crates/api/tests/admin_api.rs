use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use forgemes_api::app::{self, AdminServices};
use forgemes_core::{Aggregate, AggregateId, EventId, WorkerId};
use forgemes_observability::DispatcherMetrics;
use forgemes_outbox::{
    Dispatcher, DispatcherConfig, EventTypeRegistry, InMemoryStore, InMemoryUnitOfWork, Stores, UnitOfWork,
};
use forgemes_production::{Batch, BatchCommand, BatchId, CloseBatch, CreateBatch, WorkCenterId, event_catalog};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    store: Arc<InMemoryStore>,
    registry: Arc<EventTypeRegistry>,
    dispatcher: Dispatcher,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::in_memory(store.clone());
        let registry = Arc::new(EventTypeRegistry::new(stores.event_types.clone()));
        registry.register_all(&event_catalog()).await.unwrap();
        let metrics = Arc::new(DispatcherMetrics::new());

        // one attempt per delivery so a refused connection is final
        let config = DispatcherConfig {
            max_attempts: 1,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config, &stores, registry.clone(), metrics.clone()).unwrap();
        let services = Arc::new(AdminServices::new(&stores, registry.clone(), metrics));

        // Same router as prod, bound to an ephemeral port.
        let router = app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            store,
            registry,
            dispatcher,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Commit a created + closed batch; returns the `batch.closed` event id.
    async fn close_batch(&self, lot: &str) -> EventId {
        let aggregate = AggregateId::new();
        let id = BatchId::new(aggregate);
        let mut batch = Batch::empty(id);
        let now = Utc::now();
        let mut events = batch
            .execute(&BatchCommand::Create(CreateBatch {
                batch_id: id,
                work_center_id: WorkCenterId::new(AggregateId::new()),
                lot_number: lot.to_string(),
                planned_quantity: 10,
                occurred_at: now - ChronoDuration::seconds(5),
            }))
            .unwrap();
        events.extend(
            batch
                .execute(&BatchCommand::Close(CloseBatch {
                    batch_id: id,
                    produced_quantity: 10,
                    occurred_at: now,
                }))
                .unwrap(),
        );

        let mut uow = InMemoryUnitOfWork::new(self.store.clone(), self.registry.clone());
        let ids = uow.record_all(aggregate, &events).unwrap();
        uow.commit().await.unwrap();
        ids[1]
    }

    async fn drain(&self) {
        let worker = WorkerId::new();
        for _ in 0..5 {
            if self.dispatcher.run_once(worker).await.unwrap().claimed == 0 {
                return;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create_subscription(client: &reqwest::Client, srv: &TestServer, endpoint: &str) -> serde_json::Value {
    let res = client
        .post(srv.url("/subscriptions"))
        .json(&json!({
            "endpoint_url": endpoint,
            "event_types": ["batch.closed"],
            "description": "ERP sync",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn subscription_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = create_subscription(&client, &srv, "https://erp.example.com/hooks").await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["secret"].as_str().unwrap().len(), 64);
    assert_eq!(created["event_types"], json!(["batch.closed"]));
    assert_eq!(created["active"], true);

    // the secret is only shown at creation
    let res = client.get(srv.url("/subscriptions")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let list: serde_json::Value = res.json().await.unwrap();
    assert_eq!(list["count"], 1);
    assert!(list["items"][0].get("secret").is_none());

    let res = client
        .patch(srv.url(&format!("/subscriptions/{id}")))
        .json(&json!({ "event_types": ["batch.closed", "batch.created"], "description": "ERP + MES" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let updated: serde_json::Value = res.json().await.unwrap();
    assert_eq!(updated["event_types"], json!(["batch.closed", "batch.created"]));
    assert_eq!(updated["description"], "ERP + MES");

    let res = client
        .post(srv.url(&format!("/subscriptions/{id}/rotate-secret")))
        .json(&json!({ "secret": "a-long-enough-shared-secret" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rotated: serde_json::Value = res.json().await.unwrap();
    assert_eq!(rotated["secret"], "a-long-enough-shared-secret");

    let res = client
        .post(srv.url(&format!("/subscriptions/{id}/rotate-secret")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let generated: serde_json::Value = res.json().await.unwrap();
    assert_ne!(generated["secret"], rotated["secret"]);

    let res = client
        .post(srv.url(&format!("/subscriptions/{id}/deactivate")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client.get(srv.url(&format!("/subscriptions/{id}"))).send().await.unwrap();
    let fetched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(fetched["active"], false);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/subscriptions"))
        .json(&json!({ "endpoint_url": "https://erp.example.com", "event_types": ["batch.melted"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client.get(srv.url("/subscriptions/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let missing = forgemes_core::SubscriptionId::new();
    let res = client.get(srv.url(&format!("/subscriptions/{missing}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url(&format!("/outbox/{}/retry", EventId::new())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dead_delivery_can_be_retried_and_replayed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // nothing listens on the discard port
    let created = create_subscription(&client, &srv, "http://127.0.0.1:9/hook").await;
    let id = created["id"].as_str().unwrap().to_string();

    let before = Utc::now() - ChronoDuration::minutes(1);
    let closed = srv.close_batch("LOT-7").await;
    srv.drain().await;

    let res = client
        .get(srv.url(&format!("/subscriptions/{id}/deliveries?limit=10")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let deliveries: serde_json::Value = res.json().await.unwrap();
    assert_eq!(deliveries["count"], 1);
    assert_eq!(deliveries["items"][0]["status"], "DEAD");
    assert_eq!(deliveries["items"][0]["event_id"], closed.to_string());

    let res = client.get(srv.url("/outbox/stats")).send().await.unwrap();
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["outbox"]["events_done"], 2);
    assert_eq!(stats["outbox"]["deliveries_dead"], 1);
    assert_eq!(stats["dispatcher"]["delivery_dead"], 1);

    let res = client
        .post(srv.url(&format!("/outbox/{closed}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let retried: serde_json::Value = res.json().await.unwrap();
    assert_eq!(retried["reset_deliveries"], 1);

    let res = client.get(srv.url("/outbox/stats")).send().await.unwrap();
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["outbox"]["events_pending"], 1);
    assert_eq!(stats["outbox"]["deliveries_pending"], 1);

    srv.drain().await;

    // a window that ends before it starts is refused
    let res = client
        .post(srv.url(&format!("/subscriptions/{id}/replay")))
        .json(&json!({ "since": Utc::now(), "until": before }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url(&format!("/subscriptions/{id}/replay")))
        .json(&json!({ "since": before, "until": Utc::now() + ChronoDuration::minutes(1) }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let replayed: serde_json::Value = res.json().await.unwrap();
    assert_eq!(replayed["events"], 1);
    assert_eq!(replayed["deliveries"], 1);
}

#[tokio::test]
async fn retry_of_a_healthy_event_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let closed = srv.close_batch("LOT-8").await;
    srv.drain().await;

    let res = client
        .post(srv.url(&format!("/outbox/{closed}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_eligible");
}
