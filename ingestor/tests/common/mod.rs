#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use health::HealthRegistry;
use serde_json::{json, Value};
use time::macros::datetime;
use time::OffsetDateTime;

use ingestor::coordinator::IntakeCoordinator;
use ingestor::dedup::DedupTracker;
use ingestor::model::{IdGenerator, SchemaCatalog, WireEncoding};
use ingestor::publisher::memory::MemoryBroker;
use ingestor::publisher::retry::RetryPolicy;
use ingestor::publisher::{OverloadMode, PartitionKey, Publisher, PublisherConfig};
use ingestor::router::router;
use ingestor::time::ManualTime;
use ingestor::validator::{ValidationRules, Validator};

pub const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

/// Hands out `generated-1`, `generated-2`, ...
#[derive(Default)]
pub struct SequentialIds {
    next: std::sync::atomic::AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn generate(&self) -> String {
        let id = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        format!("generated-{id}")
    }
}

pub struct Setup {
    pub broker: MemoryBroker,
    pub max_in_flight: usize,
    pub overload_mode: OverloadMode,
    pub retry: RetryPolicy,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            broker: MemoryBroker::default(),
            max_in_flight: 100,
            overload_mode: OverloadMode::Block,
            retry: RetryPolicy::new(
                4,
                2,
                Duration::from_millis(10),
                Duration::from_millis(20),
            ),
        }
    }
}

impl Setup {
    pub fn router(self) -> (Router, MemoryBroker, ManualTime) {
        let clock = ManualTime::new(NOW);
        let validator = Validator::new(
            SchemaCatalog::builtin(),
            ValidationRules {
                max_skew: time::Duration::minutes(5),
                allowed_versions: BTreeSet::from([1]),
            },
            clock.clone(),
            SequentialIds::default(),
        );
        let dedup = DedupTracker::new(time::Duration::minutes(10), None, clock.clone());
        let publisher = Publisher::new(
            self.broker.clone(),
            PublisherConfig {
                topic: "events_ingestion".to_string(),
                encoding: WireEncoding::Json,
                partition_key: PartitionKey::EventId,
                retry: self.retry,
                max_in_flight: self.max_in_flight,
                overload_mode: self.overload_mode,
                acquire_timeout: Duration::from_millis(250),
            },
        );
        let coordinator = IntakeCoordinator::new(
            validator,
            dedup,
            Arc::new(publisher),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        let app = router(
            Arc::new(coordinator),
            HealthRegistry::new("intake_tests"),
            None,
            64 * 1024,
        );
        (app, self.broker, clock)
    }
}

pub fn click(event_id: Option<&str>) -> Value {
    let mut body = json!({
        "event_type": "click",
        "timestamp": "2024-05-01T12:00:00Z",
        "source": "web-1",
        "payload": {"element": "signup", "page": "/pricing"}
    });
    if let Some(event_id) = event_id {
        body["event_id"] = json!(event_id);
    }
    body
}
