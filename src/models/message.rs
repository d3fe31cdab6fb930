//! Typed wire model for messages flowing between pipeline stages.
//!
//! Field names are the JSON contract shared by all four services and must not
//! be renamed. Untyped `serde_json::Value` messages are validated first (see
//! `contracts::validator`); decoding into these types happens afterwards.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::enums::{Domain, MatchType, MessageStatus, Stage};
use crate::contracts::ContractError;

/// Metadata key reserved for failure details on `failed` messages.
pub const ERROR_KEY: &str = "error";

/// Core metadata keys that every message must carry.
pub const PATIENT_ID_KEY: &str = "patient_id";
pub const DOCUMENT_ID_KEY: &str = "document_id";

// ═══════════════════════════════════════════
// Timestamp format
// ═══════════════════════════════════════════

/// RFC 3339 UTC with millisecond precision, e.g. `2026-01-01T10:00:00.000Z`.
pub mod ts_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// Format a timestamp the way it appears on the wire.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ═══════════════════════════════════════════
// Metadata
// ═══════════════════════════════════════════

/// Message metadata: a fixed core plus an append-only extension map.
///
/// Stages add statistics under new keys. Existing keys are never removed or
/// replaced; `append` enforces this for producers built on this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub patient_id: String,
    pub document_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    pub fn new(patient_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            document_id: document_id.into(),
            extra: Map::new(),
        }
    }

    /// Add a new key. Re-adding an identical value is a no-op; any other
    /// collision with an existing key is refused.
    pub fn append(&mut self, key: impl Into<String>, value: Value) -> Result<(), ContractError> {
        let key = key.into();
        if key == PATIENT_ID_KEY || key == DOCUMENT_ID_KEY {
            return Err(ContractError::MetadataOverwrite(key));
        }
        match self.extra.get(&key) {
            Some(existing) if *existing == value => Ok(()),
            Some(_) => Err(ContractError::MetadataOverwrite(key)),
            None => {
                self.extra.insert(key, value);
                Ok(())
            }
        }
    }

    /// Failure details, if an `error` entry is present and well-formed.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.extra
            .get(ERROR_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Flat key/value view, core keys included.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(PATIENT_ID_KEY.into(), Value::String(self.patient_id.clone()));
        map.insert(DOCUMENT_ID_KEY.into(), Value::String(self.document_id.clone()));
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

/// Failure details attached under `metadata.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            stage: None,
        }
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

// ═══════════════════════════════════════════
// Stage payloads
// ═══════════════════════════════════════════

/// A contiguous span of the preprocessed text. Offsets are half-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub start_pos: usize,
    pub end_pos: usize,
    pub word_count: usize,
    pub char_count: usize,
}

impl Chunk {
    /// Build a chunk from its text and starting offset; counts are derived.
    pub fn from_span(chunk_id: impl Into<String>, text: &str, start_pos: usize) -> Self {
        let char_count = text.chars().count();
        Self {
            chunk_id: chunk_id.into(),
            text: text.to_string(),
            start_pos,
            end_pos: start_pos + char_count,
            word_count: text.split_whitespace().count(),
            char_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTerm {
    pub term: String,
    pub domain: Domain,
    pub entity_id: String,
}

/// Reference to a standard OMOP concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptRef {
    pub concept_id: i64,
    pub concept_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizedTerm {
    pub original_term: String,
    pub domain: Domain,
    pub entity_id: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub matches: Vec<ConceptRef>,
}

// ═══════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════

/// The common envelope flowing between every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub message_id: String,
    #[serde(with = "ts_millis")]
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub status: MessageStatus,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Chunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<Vec<ExtractedTerm>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<StandardizedTerm>>,
}

impl PipelineMessage {
    /// A `pending` message for an existing run with a freshly assigned id.
    pub fn new(correlation_id: impl Into<String>, metadata: Metadata, now: DateTime<Utc>) -> Self {
        Self {
            message_id: new_message_id(),
            timestamp: now,
            correlation_id: correlation_id.into(),
            status: MessageStatus::Pending,
            metadata,
            raw_text: None,
            preprocessed_text: None,
            chunks: None,
            chunk_count: None,
            terms: None,
            results: None,
        }
    }

    /// Start a new pipeline run for a source document.
    pub fn source_document(metadata: Metadata, raw_text: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut msg = Self::new(Uuid::new_v4().to_string(), metadata, now);
        msg.raw_text = Some(raw_text.into());
        msg
    }

    pub fn from_value(value: &Value) -> Result<Self, ContractError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value, ContractError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Drop every stage-specific payload field.
    pub fn clear_payload(&mut self) {
        self.raw_text = None;
        self.preprocessed_text = None;
        self.chunks = None;
        self.chunk_count = None;
        self.terms = None;
        self.results = None;
    }

    /// Attach chunks together with their declared count.
    pub fn set_chunks(&mut self, chunks: Vec<Chunk>) {
        self.chunk_count = Some(chunks.len());
        self.chunks = Some(chunks);
    }
}

/// Producer-assigned message id.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
