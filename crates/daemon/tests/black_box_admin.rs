use std::sync::Arc;

use plantwire_core::{CatalogDocument, EntityCatalog};
use plantwire_infra::sink::InMemorySink;
use plantwire_infra::{PlantRuntime, PlantwireConfig, Sink, SimClock};
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    runtime: Option<PlantRuntime>,
    handle: tokio::task::JoinHandle<()>,
    first_machine: String,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = PlantwireConfig::default();
        config.simulation.seed = Some(3);
        config.simulation.faults.probability_per_cycle = 0.0;

        let catalog = EntityCatalog::from_document(CatalogDocument::demo(1, 1, 2)).unwrap();
        let first_machine = catalog.machines().next().unwrap().id.to_string();
        let runtime = PlantRuntime::start_with(
            &config,
            catalog,
            Some(Arc::new(InMemorySink::bus()) as Arc<dyn Sink>),
            Some(Arc::new(InMemorySink::store()) as Arc<dyn Sink>),
            SimClock::starting_now(),
        );

        // Same router as the daemon, bound to an ephemeral port.
        let app = plantwire_daemon::admin::router(runtime.handle());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            runtime: Some(runtime),
            handle,
            first_machine,
        }
    }

    async fn stop(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_and_stats_describe_the_plant() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", server.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["machines"], 2);

    let res = client.get(format!("{}/stats", server.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["seed"], 3);
    assert_eq!(body["scheduler"]["partitions"], 2);
    assert_eq!(body["dispatcher"]["bus"]["sink"], "memory_bus");
    assert_eq!(body["supervisor"]["workers"], 4);

    server.stop().await;
}

#[tokio::test]
async fn manual_faults_are_validated_and_deduplicated() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let url = format!("{}/faults", server.base_url);

    let res = client
        .post(&url)
        .json(&json!({ "machine_id": "NOPE-404", "kind": "sensor_drift" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_machine");

    let res = client
        .post(&url)
        .json(&json!({ "machine_id": server.first_machine, "kind": "sensor_drift", "severity": 1.5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(&url)
        .json(&json!({ "machine_id": server.first_machine, "kind": "sensor_drift", "duration_secs": 3600 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["severity"], 0.8);

    let res = client
        .post(&url)
        .json(&json!({ "machine_id": server.first_machine, "kind": "sensor_drift" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = client
        .post(format!("{}/machines/{}/faults/clear", server.base_url, server.first_machine))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["cleared"], true);

    server.stop().await;
}

#[tokio::test]
async fn acknowledge_reports_whether_the_machine_was_faulted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/machines/{}/acknowledge", server.base_url, server.first_machine))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["was_faulted"], false);

    let res = client
        .post(format!("{}/machines/NOPE-404/acknowledge", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}
