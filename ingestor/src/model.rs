//! Canonical event model, shared with downstream consumers of the topic.
//!
//! An [`Envelope`] is the only unit that leaves the gateway. It is built by the
//! validator and never mutated afterwards: a correction is a new envelope with a
//! new `event_id`. Serialization is deterministic (payload keys are sorted and
//! the timestamp normalized to UTC), so the same submission and `event_id`
//! always encode to the same bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    event_id: String,
    event_type: String,
    schema_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    payload: Map<String, Value>,
    source: String,
}

impl Envelope {
    pub(crate) fn new(
        event_id: String,
        event_type: String,
        schema_version: u32,
        timestamp: OffsetDateTime,
        payload: Map<String, Value>,
        source: String,
    ) -> Self {
        Self {
            event_id,
            event_type,
            schema_version,
            timestamp,
            payload,
            source,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

pub trait IdGenerator {
    fn generate(&self) -> String;
}

/// Time-ordered ids keep generated events roughly sorted on the topic.
#[derive(Clone, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

/// A constraint on one field of the payload. `path` is dotted and relative to
/// the payload object, e.g. `repo.name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub path: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldRule {
    pub fn required(path: &str, kind: FieldKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(path: &str, kind: FieldKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
            required: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    pub versions: BTreeMap<u32, Vec<FieldRule>>,
}

impl EventSchema {
    pub fn rules(&self, version: u32) -> Option<&[FieldRule]> {
        self.versions.get(&version).map(Vec::as_slice)
    }

    /// Highest version known to this schema that is also allow-listed.
    pub fn latest_allowed(&self, allowed: &BTreeSet<u32>) -> Option<u32> {
        self.versions
            .keys()
            .rev()
            .find(|version| allowed.contains(version))
            .copied()
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read schema catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse schema catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("schema catalog declares no event types")]
    Empty,
    #[error("event type {0} declares no schema version")]
    NoVersions(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, EventSchema>,
}

impl SchemaCatalog {
    pub fn builtin() -> Self {
        let github = |commits: bool| {
            let mut rules = vec![
                FieldRule::required("actor.login", FieldKind::String),
                FieldRule::required("repo.name", FieldKind::String),
            ];
            if commits {
                rules.push(FieldRule::optional("commits", FieldKind::Array));
            }
            rules
        };

        SchemaCatalog::default()
            .with_schema(
                "click",
                1,
                vec![
                    FieldRule::required("element", FieldKind::String),
                    FieldRule::optional("page", FieldKind::String),
                    FieldRule::optional("x", FieldKind::Integer),
                    FieldRule::optional("y", FieldKind::Integer),
                ],
            )
            .with_schema(
                "page_view",
                1,
                vec![
                    FieldRule::required("url", FieldKind::String),
                    FieldRule::optional("referrer", FieldKind::String),
                    FieldRule::optional("duration_ms", FieldKind::Integer),
                ],
            )
            .with_schema("github.watch", 1, github(false))
            .with_schema("github.fork", 1, github(false))
            .with_schema("github.push", 1, github(true))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read(path)?;
        Self::from_slice(&raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, CatalogError> {
        let catalog: SchemaCatalog = serde_json::from_slice(raw)?;
        if catalog.schemas.is_empty() {
            return Err(CatalogError::Empty);
        }
        if let Some((event_type, _)) = catalog
            .schemas
            .iter()
            .find(|(_, schema)| schema.versions.is_empty())
        {
            return Err(CatalogError::NoVersions(event_type.clone()));
        }
        Ok(catalog)
    }

    pub fn with_schema(mut self, event_type: &str, version: u32, rules: Vec<FieldRule>) -> Self {
        self.schemas
            .entry(event_type.to_string())
            .or_default()
            .versions
            .insert(version, rules);
        self
    }

    pub fn schema(&self, event_type: &str) -> Option<&EventSchema> {
        self.schemas.get(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireEncoding {
    #[default]
    Json,
    JsonGzip,
}

impl FromStr for WireEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "json" => Ok(WireEncoding::Json),
            "json-gzip" | "gzip" => Ok(WireEncoding::JsonGzip),
            _ => Err(format!("Unknown wire encoding: {s}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress envelope: {0}")]
    Compress(#[from] std::io::Error),
}

impl WireEncoding {
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        let json = envelope.to_json()?;
        match self {
            WireEncoding::Json => Ok(json),
            WireEncoding::JsonGzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&json)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Value of the `content-encoding` record header.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            WireEncoding::Json => "identity",
            WireEncoding::JsonGzip => "gzip",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn envelope() -> Envelope {
        let payload = json!({"page": "/pricing", "element": "signup"});
        Envelope::new(
            "evt-1".to_string(),
            "click".to_string(),
            1,
            datetime!(2024-05-01 12:00:00 UTC),
            payload.as_object().unwrap().clone(),
            "web-1".to_string(),
        )
    }

    #[test]
    fn envelope_serializes_with_sorted_keys() {
        let encoded = String::from_utf8(envelope().to_json().unwrap()).unwrap();
        assert_eq!(
            encoded,
            r#"{"event_id":"evt-1","event_type":"click","schema_version":1,"timestamp":"2024-05-01T12:00:00Z","payload":{"element":"signup","page":"/pricing"},"source":"web-1"}"#
        );
    }

    #[test]
    fn gzip_encoding_wraps_the_json_form() {
        let compressed = WireEncoding::JsonGzip.encode(&envelope()).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, envelope().to_json().unwrap());
    }

    #[test]
    fn latest_allowed_version() {
        let catalog = SchemaCatalog::default()
            .with_schema("click", 1, vec![])
            .with_schema("click", 2, vec![])
            .with_schema("click", 3, vec![]);
        let schema = catalog.schema("click").unwrap();

        assert_eq!(schema.latest_allowed(&BTreeSet::from([1, 2])), Some(2));
        assert_eq!(schema.latest_allowed(&BTreeSet::from([3, 9])), Some(3));
        assert_eq!(schema.latest_allowed(&BTreeSet::from([9])), None);
    }

    #[test]
    fn catalog_loads_from_json() {
        let raw = br#"{
            "signup": {"versions": {"1": [{"path": "plan", "kind": "string", "required": true}]}}
        }"#;
        let catalog = SchemaCatalog::from_slice(raw).unwrap();
        assert_eq!(catalog.event_types().collect::<Vec<_>>(), vec!["signup"]);
        assert_eq!(
            catalog.schema("signup").unwrap().rules(1).unwrap(),
            &[FieldRule::required("plan", FieldKind::String)]
        );

        assert!(matches!(
            SchemaCatalog::from_slice(b"{}"),
            Err(CatalogError::Empty)
        ));
        assert!(matches!(
            SchemaCatalog::from_slice(br#"{"signup": {"versions": {}}}"#),
            Err(CatalogError::NoVersions(_))
        ));
    }

    #[test]
    fn builtin_catalog_covers_repository_events() {
        let catalog = SchemaCatalog::builtin();
        for event_type in ["click", "page_view", "github.watch", "github.fork", "github.push"] {
            assert!(catalog.schema(event_type).is_some(), "{event_type}");
        }
    }
}
