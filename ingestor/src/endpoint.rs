use std::io::Read;

use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use tracing::{error, instrument};

use crate::api::IngestResult;
use crate::prometheus::{report_outcome, report_received};
use crate::router;

const GZIP_MAGIC_NUMBERS: [u8; 3] = [0x1f, 0x8b, 8];

/// Submission with the event type in the body.
#[instrument(skip_all)]
pub async fn event(
    state: State<router::State>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> IngestResult {
    ingest(&state, &headers, body, None).await
}

/// Submission to `/v1/events/:event_type`, the path declares the type.
#[instrument(skip_all, fields(event_type = %event_type))]
pub async fn typed_event(
    state: State<router::State>,
    Path(event_type): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> IngestResult {
    ingest(&state, &headers, body, Some(&event_type)).await
}

async fn ingest(
    state: &router::State,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    declared_type: Option<&str>,
) -> IngestResult {
    let decoded = body
        .map_err(read_failure)
        .and_then(|body| decode_body(headers, body, state.max_body_bytes));
    match decoded {
        Ok(payload) => state.coordinator.ingest(&payload, declared_type).await,
        Err(detail) => {
            report_received();
            let result = IngestResult::Rejected {
                reason: "malformed_payload",
                field: None,
                message: detail.to_string(),
            };
            report_outcome(&result);
            result
        }
    }
}

// Oversized bodies get the same response shape as any other malformed payload
fn read_failure(rejection: BytesRejection) -> &'static str {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        "request body is too large"
    } else {
        error!("failed to read request body: {}", rejection.body_text());
        "failed to read request body"
    }
}

/// Gunzips the body when it is declared or detected as gzip, and checks that
/// the result is UTF-8.
fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Vec<u8>, &'static str> {
    let declared_gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));

    let payload = if declared_gzip || body.starts_with(&GZIP_MAGIC_NUMBERS) {
        let mut decoded = Vec::new();
        // Read one byte past the limit to tell a full body from an oversized one
        GzDecoder::new(body.reader())
            .take(limit as u64 + 1)
            .read_to_end(&mut decoded)
            .map_err(|e| {
                error!("failed to decode gzip: {}", e);
                "invalid gzip data"
            })?;
        if decoded.len() > limit {
            return Err("decompressed body is too large");
        }
        decoded
    } else {
        body.into()
    };

    if std::str::from_utf8(&payload).is_err() {
        return Err("invalid body encoding");
    }
    Ok(payload)
}
