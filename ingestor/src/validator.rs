use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::instrument;

use crate::model::{Envelope, FieldRule, IdGenerator, SchemaCatalog};
use crate::time::TimeSource;

const MAX_ID_LENGTH: usize = 128;

/// A submission that cannot become an envelope. Every variant points at the
/// offending field so callers can fix their payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed payload at '{field}': {detail}")]
    MalformedPayload { field: String, detail: String },
    #[error("unknown event type '{event_type}'")]
    UnknownEventType { field: String, event_type: String },
    #[error("schema version {version} is not supported for '{event_type}'")]
    SchemaVersionMismatch {
        field: String,
        event_type: String,
        version: u64,
    },
    #[error("timestamp is {skew_secs}s away from gateway time, more than the allowed {max_skew_secs}s")]
    TimestampOutOfRange {
        field: String,
        event_id: Option<String>,
        skew_secs: i64,
        max_skew_secs: i64,
    },
}

impl ValidationError {
    fn malformed(field: &str, detail: impl Into<String>) -> Self {
        ValidationError::MalformedPayload {
            field: field.to_string(),
            detail: detail.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ValidationError::MalformedPayload { field, .. }
            | ValidationError::UnknownEventType { field, .. }
            | ValidationError::SchemaVersionMismatch { field, .. }
            | ValidationError::TimestampOutOfRange { field, .. } => field,
        }
    }

    /// The caller's own `event_id`, when it was valid and the submission failed
    /// only on a check that a retry can trip after the first attempt passed.
    pub fn retried_event_id(&self) -> Option<&str> {
        match self {
            ValidationError::TimestampOutOfRange { event_id, .. } => event_id.as_deref(),
            _ => None,
        }
    }

    /// Stable reason code, used in responses and as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::MalformedPayload { .. } => "malformed_payload",
            ValidationError::UnknownEventType { .. } => "unknown_event_type",
            ValidationError::SchemaVersionMismatch { .. } => "schema_version_mismatch",
            ValidationError::TimestampOutOfRange { .. } => "timestamp_out_of_range",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ValidationRules {
    pub max_skew: Duration,
    pub allowed_versions: BTreeSet<u32>,
}

pub struct Validator {
    catalog: SchemaCatalog,
    rules: ValidationRules,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    ids: Arc<dyn IdGenerator + Send + Sync>,
}

impl Validator {
    pub fn new<TZ, G>(
        catalog: SchemaCatalog,
        rules: ValidationRules,
        timesource: TZ,
        ids: G,
    ) -> Self
    where
        TZ: TimeSource + Send + Sync + 'static,
        G: IdGenerator + Send + Sync + 'static,
    {
        Self {
            catalog,
            rules,
            timesource: Arc::new(timesource),
            ids: Arc::new(ids),
        }
    }

    /// Checks a raw submission against the catalog and builds its envelope.
    /// `declared_type` comes from the transport (e.g. the request path) and
    /// must agree with the body when both are present.
    #[instrument(skip_all, fields(declared_type))]
    pub fn validate(
        &self,
        raw: &[u8],
        declared_type: Option<&str>,
    ) -> Result<Envelope, ValidationError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ValidationError::malformed("", format!("invalid json: {e}")))?;
        let Value::Object(mut body) = value else {
            return Err(ValidationError::malformed("", "expected a json object"));
        };

        let event_type = match (optional_str(&body, "event_type")?, declared_type) {
            (Some(body_type), Some(declared)) if body_type != declared => {
                return Err(ValidationError::malformed(
                    "event_type",
                    format!("body declares '{body_type}' but request declares '{declared}'"),
                ))
            }
            (Some(event_type), _) | (None, Some(event_type)) => event_type.to_string(),
            (None, None) => {
                return Err(ValidationError::malformed("event_type", "missing required field"))
            }
        };
        let schema = self.catalog.schema(&event_type).ok_or_else(|| {
            ValidationError::UnknownEventType {
                field: "event_type".to_string(),
                event_type: event_type.clone(),
            }
        })?;

        let schema_version = match body.get("schema_version") {
            None | Some(Value::Null) => schema
                .latest_allowed(&self.rules.allowed_versions)
                .ok_or_else(|| ValidationError::SchemaVersionMismatch {
                    field: "schema_version".to_string(),
                    event_type: event_type.clone(),
                    version: 0,
                })?,
            Some(value) => {
                let version = value.as_u64().filter(|v| *v > 0).ok_or_else(|| {
                    ValidationError::malformed("schema_version", "expected a positive integer")
                })?;
                u32::try_from(version)
                    .ok()
                    .filter(|v| {
                        self.rules.allowed_versions.contains(v) && schema.rules(*v).is_some()
                    })
                    .ok_or_else(|| ValidationError::SchemaVersionMismatch {
                        field: "schema_version".to_string(),
                        event_type: event_type.clone(),
                        version,
                    })?
            }
        };

        let caller_event_id = optional_str(&body, "event_id")?.map(str::to_string);
        if let Some(event_id) = &caller_event_id {
            check_identifier("event_id", event_id)?;
        }

        let source = optional_str(&body, "source")?
            .ok_or_else(|| ValidationError::malformed("source", "missing required field"))?;
        check_identifier("source", source)?;
        let source = source.to_string();

        let timestamp = parse_timestamp(body.get("timestamp"))?;
        let skew = self.timesource.now() - timestamp;
        if skew.abs() > self.rules.max_skew {
            return Err(ValidationError::TimestampOutOfRange {
                field: "timestamp".to_string(),
                event_id: caller_event_id,
                skew_secs: skew.whole_seconds(),
                max_skew_secs: self.rules.max_skew.whole_seconds(),
            });
        }

        let payload = match body.remove("payload") {
            Some(Value::Object(payload)) => payload,
            None | Some(Value::Null) => {
                return Err(ValidationError::malformed("payload", "missing required field"))
            }
            Some(_) => return Err(ValidationError::malformed("payload", "expected an object")),
        };
        // Presence was checked when resolving the version
        for rule in schema.rules(schema_version).unwrap_or_default() {
            check_rule(&payload, rule)?;
        }

        let event_id = caller_event_id.unwrap_or_else(|| self.ids.generate());

        Ok(Envelope::new(
            event_id,
            event_type,
            schema_version,
            timestamp,
            payload,
            source,
        ))
    }
}

fn optional_str<'a>(
    body: &'a Map<String, Value>,
    field: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(ValidationError::malformed(field, "expected a string")),
    }
}

fn check_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::malformed(field, "must not be empty"));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ValidationError::malformed(
            field,
            format!("longer than {MAX_ID_LENGTH} bytes"),
        ));
    }
    if !value.is_ascii() || value.chars().any(|c| c.is_ascii_control()) {
        return Err(ValidationError::malformed(field, "must be printable ascii"));
    }
    Ok(())
}

/// Accepts RFC 3339 strings and integer epoch milliseconds, normalized to UTC.
fn parse_timestamp(value: Option<&Value>) -> Result<OffsetDateTime, ValidationError> {
    let timestamp = match value {
        None | Some(Value::Null) => {
            return Err(ValidationError::malformed("timestamp", "missing required field"))
        }
        Some(Value::String(raw)) => OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| {
            ValidationError::malformed("timestamp", format!("invalid rfc3339: {e}"))
        })?,
        Some(Value::Number(raw)) => {
            let millis = raw.as_i64().ok_or_else(|| {
                ValidationError::malformed("timestamp", "expected integer milliseconds")
            })?;
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
                .map_err(|e| ValidationError::malformed("timestamp", e.to_string()))?
        }
        Some(_) => {
            return Err(ValidationError::malformed(
                "timestamp",
                "expected an rfc3339 string or epoch milliseconds",
            ))
        }
    };
    Ok(timestamp.to_offset(UtcOffset::UTC))
}

fn check_rule(payload: &Map<String, Value>, rule: &FieldRule) -> Result<(), ValidationError> {
    let field = format!("payload.{}", rule.path);
    let mut segments = rule.path.split('.');
    let mut current = segments.next().and_then(|first| payload.get(first));
    for segment in segments {
        current = match current {
            Some(Value::Object(map)) => map.get(segment),
            _ => None,
        };
    }

    match current {
        None | Some(Value::Null) if rule.required => {
            Err(ValidationError::malformed(&field, "missing required field"))
        }
        None | Some(Value::Null) => Ok(()),
        Some(value) if !rule.kind.matches(value) => Err(ValidationError::malformed(
            &field,
            format!("expected {}", rule.kind.as_str()),
        )),
        Some(Value::String(value)) if rule.required && value.trim().is_empty() => {
            Err(ValidationError::malformed(&field, "must not be blank"))
        }
        Some(_) => Ok(()),
    }
}
