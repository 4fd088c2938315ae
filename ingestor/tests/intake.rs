mod common;

use std::io::Write;
use std::time::{Duration, Instant};

use assert_json_diff::{assert_json_eq, assert_json_include};
use axum::http::StatusCode;
use axum_test_helper::TestClient;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::join_all;
use serde_json::{json, Value};

use ingestor::publisher::memory::MemoryBroker;
use ingestor::publisher::{BrokerError, OverloadMode};

use common::{click, Setup};

async fn post(client: &TestClient, path: &str, body: &Value) -> (StatusCode, Value) {
    let response = client
        .post(path)
        .body(body.to_string())
        .header("Content-Type", "application/json")
        .send()
        .await;
    let status = response.status();
    (status, response.json::<Value>().await)
}

#[tokio::test]
async fn generated_event_id_is_accepted() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let (status, body) = post(&client, "/v1/events", &click(None)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_json_eq!(
        body,
        json!({
            "event_id": "generated-1",
            "receipt": {"topic": "events_ingestion", "partition": 0, "offset": 0}
        })
    );

    let records = broker.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "generated-1");
    let written: Value = serde_json::from_slice(&records[0].value).unwrap();
    assert_json_eq!(
        written,
        json!({
            "event_id": "generated-1",
            "event_type": "click",
            "schema_version": 1,
            "timestamp": "2024-05-01T12:00:00Z",
            "payload": {"element": "signup", "page": "/pricing"},
            "source": "web-1"
        })
    );
}

#[tokio::test]
async fn path_declares_the_event_type() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let body = json!({
        "timestamp": 1714564800000_i64,
        "source": "web-1",
        "payload": {"url": "https://example.com/pricing"}
    });
    let (status, _) = post(&client, "/v1/events/page_view", &body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        broker.records()[0].header("event_type"),
        Some("page_view")
    );
}

#[tokio::test]
async fn missing_field_never_reaches_the_broker() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let mut event = click(Some("evt-1"));
    event["payload"].as_object_mut().unwrap().remove("element");
    let (status, body) = post(&client, "/v1/events", &event).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: body,
        expected: json!({"reason": "malformed_payload", "field": "payload.element"})
    );
    assert_eq!(broker.attempts(), 0);
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let mut event = click(None);
    event["event_type"] = json!("purchase");
    let (status, body) = post(&client, "/v1/events", &event).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: body,
        expected: json!({"reason": "unknown_event_type", "field": "event_type"})
    );
    assert_eq!(broker.attempts(), 0);
}

#[tokio::test]
async fn duplicate_within_window_replays_the_receipt() {
    let (router, broker, clock) = Setup::default().router();
    let client = TestClient::new(router).await;

    let (status, first) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    clock.advance(time::Duration::minutes(3));
    let (status, second) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_json_eq!(first, second);
    assert_eq!(broker.records().len(), 1);
}

#[tokio::test]
async fn late_retry_replays_the_receipt() {
    let (router, broker, clock) = Setup::default().router();
    let client = TestClient::new(router).await;

    let (status, first) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Outside the 300s skew, inside the 600s dedup window
    clock.advance(time::Duration::minutes(6));
    let (status, second) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_json_eq!(first, second);
    assert_eq!(broker.records().len(), 1);
}

#[tokio::test]
async fn expired_window_publishes_again() {
    let (router, broker, clock) = Setup::default().router();
    let client = TestClient::new(router).await;

    let (status, _) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    clock.advance(time::Duration::minutes(10));
    let mut event = click(Some("evt-1"));
    event["timestamp"] = json!("2024-05-01T12:10:00Z");
    let (status, body) = post(&client, "/v1/events", &event).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["receipt"]["offset"], 1);
    assert_eq!(broker.records().len(), 2);
}

#[tokio::test]
async fn concurrent_duplicates_share_one_write() {
    let setup = Setup {
        broker: MemoryBroker::with_latency(Duration::from_millis(100)),
        ..Default::default()
    };
    let (router, broker, _) = setup.router();
    let client = TestClient::new(router).await;

    let event = click(Some("evt-1"));
    let responses = join_all((0..5).map(|_| post(&client, "/v1/events", &event))).await;

    let (_, first) = &responses[0];
    for (status, body) in &responses {
        assert_eq!(*status, StatusCode::ACCEPTED);
        assert_json_eq!(body, first);
    }
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test]
async fn unavailable_broker_defers_after_backoff() {
    let (router, broker, _) = Setup::default().router();
    broker.fail_next(vec![
        BrokerError::Transient("broker not available".to_string());
        4
    ]);
    let client = TestClient::new(router).await;

    let start = Instant::now();
    let response = client
        .post("/v1/events")
        .body(click(Some("evt-1")).to_string())
        .header("Content-Type", "application/json")
        .send()
        .await;

    // 10ms + 20ms + 20ms of backoff between the four attempts
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "5");
    assert_json_eq!(
        response.json::<Value>().await,
        json!({"reason": "broker_unavailable", "retry_after": 5})
    );
    assert_eq!(broker.attempts(), 4);

    // Deferred submissions can be retried as-is
    let (status, _) = post(&client, "/v1/events", &click(Some("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn saturated_publisher_rejects_immediately() {
    let setup = Setup {
        broker: MemoryBroker::with_latency(Duration::from_millis(500)),
        max_in_flight: 1,
        overload_mode: OverloadMode::Reject,
        ..Default::default()
    };
    let (router, _, _) = setup.router();
    let client = TestClient::new(router).await;

    let first_event = click(Some("evt-1"));
    let (first, second) = tokio::join!(
        post(&client, "/v1/events", &first_event),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let start = Instant::now();
            let response = post(&client, "/v1/events", &click(Some("evt-2"))).await;
            (response, start.elapsed())
        }
    );

    assert_eq!(first.0, StatusCode::ACCEPTED);
    let ((status, body), elapsed) = second;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_json_eq!(body, json!({"reason": "overloaded", "retry_after": 5}));
    assert!(elapsed < Duration::from_millis(400));
}

#[tokio::test]
async fn saturated_publisher_blocks_up_to_the_timeout() {
    let setup = Setup {
        broker: MemoryBroker::with_latency(Duration::from_secs(2)),
        max_in_flight: 1,
        ..Default::default()
    };
    let (router, _, _) = setup.router();
    let client = TestClient::new(router).await;

    let first_event = click(Some("evt-1"));
    let (first, second) = tokio::join!(
        post(&client, "/v1/events", &first_event),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let start = Instant::now();
            let response = post(&client, "/v1/events", &click(Some("evt-2"))).await;
            (response, start.elapsed())
        }
    );

    assert_eq!(first.0, StatusCode::ACCEPTED);
    let ((status, body), elapsed) = second;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "overloaded");
    // Waited for a slot, but gave up well before the first write finished
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_millis(1500));
}

#[tokio::test]
async fn gzip_bodies_are_decoded() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(click(Some("evt-1")).to_string().as_bytes())
        .unwrap();
    let response = client
        .post("/v1/events")
        .body(encoder.finish().unwrap())
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .send()
        .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(broker.records()[0].key, "evt-1");
}

#[tokio::test]
async fn broken_bodies_are_malformed() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let response = client
        .post("/v1/events")
        .body("{\"event_type\": ")
        .header("Content-Type", "application/json")
        .send()
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_json_include!(
        actual: response.json::<Value>().await,
        expected: json!({"reason": "malformed_payload"})
    );
    assert_eq!(broker.attempts(), 0);
}

#[tokio::test]
async fn oversized_bodies_are_malformed() {
    let (router, broker, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let mut event = click(Some("evt-1"));
    event["payload"]["page"] = json!("a".repeat(128 * 1024));
    let (status, body) = post(&client, "/v1/events", &event).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        body,
        json!({
            "reason": "malformed_payload",
            "field": null,
            "message": "request body is too large"
        })
    );
    assert_eq!(broker.attempts(), 0);
}

#[tokio::test]
async fn index_answers() {
    let (router, _, _) = Setup::default().router();
    let client = TestClient::new(router).await;

    let response = client.get("/").send().await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await, "ingestor");
}
