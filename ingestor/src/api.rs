use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Broker acknowledgment for one durable write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Outcome of one submission, returned to the caller and replayed to
/// duplicates of the same `event_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestResult {
    Accepted {
        event_id: String,
        receipt: Receipt,
    },
    Rejected {
        reason: &'static str,
        field: Option<String>,
        message: String,
    },
    Deferred {
        reason: &'static str,
        retry_after: Duration,
    },
}

impl IngestResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestResult::Accepted { .. })
    }

    /// Label used by the outcome counters.
    pub fn outcome(&self) -> &'static str {
        match self {
            IngestResult::Accepted { .. } => "accepted",
            IngestResult::Rejected { .. } => "rejected",
            IngestResult::Deferred { .. } => "deferred",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AcceptedResponse {
    pub event_id: String,
    pub receipt: Receipt,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RejectedResponse {
    pub reason: String,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeferredResponse {
    pub reason: String,
    pub retry_after: u64,
}

// Retry-After only has second resolution, round up so callers never retry early
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for IngestResult {
    fn into_response(self) -> Response {
        match self {
            IngestResult::Accepted { event_id, receipt } => (
                StatusCode::ACCEPTED,
                Json(AcceptedResponse { event_id, receipt }),
            )
                .into_response(),
            IngestResult::Rejected {
                reason,
                field,
                message,
            } => (
                StatusCode::BAD_REQUEST,
                Json(RejectedResponse {
                    reason: reason.to_string(),
                    field,
                    message,
                }),
            )
                .into_response(),
            IngestResult::Deferred {
                reason,
                retry_after,
            } => {
                let retry_after = retry_after_secs(retry_after);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, retry_after.to_string())],
                    Json(DeferredResponse {
                        reason: reason.to_string(),
                        retry_after,
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(5)), 5);
        assert_eq!(retry_after_secs(Duration::from_millis(5200)), 6);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn status_codes() {
        let accepted = IngestResult::Accepted {
            event_id: "evt-1".to_string(),
            receipt: Receipt {
                topic: "events".to_string(),
                partition: 0,
                offset: 3,
            },
        };
        assert_eq!(accepted.into_response().status(), StatusCode::ACCEPTED);

        let rejected = IngestResult::Rejected {
            reason: "malformed_payload",
            field: Some("source".to_string()),
            message: "missing required field".to_string(),
        };
        assert_eq!(rejected.into_response().status(), StatusCode::BAD_REQUEST);

        let deferred = IngestResult::Deferred {
            reason: "overloaded",
            retry_after: Duration::from_secs(5),
        }
        .into_response();
        assert_eq!(deferred.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(deferred.headers()[header::RETRY_AFTER], "5");
    }
}
