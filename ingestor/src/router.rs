use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::coordinator::IntakeCoordinator;
use crate::endpoint;
use crate::prometheus::track_metrics;

#[derive(Clone)]
pub struct State {
    pub coordinator: Arc<IntakeCoordinator>,
    pub max_body_bytes: usize,
}

async fn index() -> &'static str {
    "ingestor"
}

pub fn router(
    coordinator: Arc<IntakeCoordinator>,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    max_body_bytes: usize,
) -> Router {
    let state = State {
        coordinator,
        max_body_bytes,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/v1/events", post(endpoint::event))
        .route("/v1/events/:event_type", post(endpoint::typed_event))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the ingestor is used as a library (during tests etc)
    // does not work well.
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}
