//! Declarative message schemas, one per pipeline stage output.
//!
//! A `Schema` lists the fields a stage must publish, their wire types, their
//! enum domains and the nested schemas of list-of-object fields. Schemas are
//! built once by `SchemaRegistry::new` and never mutated afterwards.

use std::collections::HashMap;

use crate::models::enums::{Domain, MatchType, MessageStatus, SchemaVersion, Stage};
use crate::models::message::{DOCUMENT_ID_KEY, PATIENT_ID_KEY};

use super::ContractError;

/// Status values a stage may publish under the strict revision.
const V1_OUTPUT_STATUSES: &[&str] = &["completed", "failed"];

// ═══════════════════════════════════════════
// Field descriptions
// ═══════════════════════════════════════════

/// Expected JSON type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    /// Any signed 64-bit integer.
    Integer,
    /// Non-negative integer (offsets, counts).
    Count,
    Number,
    Boolean,
    /// RFC 3339 string.
    Timestamp,
    Mapping,
    Sequence,
    /// Sequence whose elements must each satisfy the nested schema.
    ObjectList(ObjectSchema),
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Count => "non-negative integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp string",
            Self::Mapping => "mapping",
            Self::Sequence | Self::ObjectList(_) => "sequence",
        }
    }
}

/// When a field must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Always,
    /// Payload fields: only a `completed` message has published its result.
    WhenCompleted,
    Optional,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldType,
    pub presence: Presence,
    /// Closed enum domain for string fields.
    pub allowed: Option<&'static [&'static str]>,
    /// Strings must not be blank regardless of status.
    pub non_empty: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldType) -> Self {
        Self {
            name,
            kind,
            presence: Presence::Always,
            allowed: None,
            non_empty: false,
        }
    }

    pub fn payload(name: &'static str, kind: FieldType) -> Self {
        Self {
            presence: Presence::WhenCompleted,
            ..Self::required(name, kind)
        }
    }

    pub fn optional(name: &'static str, kind: FieldType) -> Self {
        Self {
            presence: Presence::Optional,
            ..Self::required(name, kind)
        }
    }

    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }
}

/// Schema of the elements of a list-of-object field.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

/// The field whose emptiness decides whether a `completed` message did any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub field: &'static str,
    pub may_be_empty: bool,
}

/// Cross-field rules that plain type checks cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRule {
    /// `key` must be unique across the elements of `list`.
    UniqueKey { list: &'static str, key: &'static str },
    /// In `results`, `matches` is empty exactly when `match_type` is `no_match`.
    MatchesAgreeWithType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// `None` for the source-document schema that feeds preprocessing.
    pub stage: Option<Stage>,
    pub name: &'static str,
    pub version: SchemaVersion,
    pub fields: Vec<FieldSpec>,
    pub principal: Option<Principal>,
    pub rules: Vec<ContentRule>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Metadata keys every message must carry.
    pub fn required_metadata_keys(&self) -> &'static [&'static str] {
        &[PATIENT_ID_KEY, DOCUMENT_ID_KEY]
    }
}

// ═══════════════════════════════════════════
// Nested element schemas
// ═══════════════════════════════════════════

fn chunk_schema() -> ObjectSchema {
    ObjectSchema {
        name: "Chunk",
        fields: vec![
            FieldSpec::required("chunk_id", FieldType::String).non_empty(),
            FieldSpec::required("text", FieldType::String),
            FieldSpec::required("start_pos", FieldType::Count),
            FieldSpec::required("end_pos", FieldType::Count),
            FieldSpec::required("word_count", FieldType::Count),
            FieldSpec::required("char_count", FieldType::Count),
        ],
    }
}

fn term_schema() -> ObjectSchema {
    ObjectSchema {
        name: "ExtractedTerm",
        fields: vec![
            FieldSpec::required("term", FieldType::String).non_empty(),
            FieldSpec::required("domain", FieldType::String).one_of(Domain::VALUES),
            FieldSpec::required("entity_id", FieldType::String).non_empty(),
        ],
    }
}

fn concept_schema() -> ObjectSchema {
    ObjectSchema {
        name: "ConceptRef",
        fields: vec![
            FieldSpec::required("concept_id", FieldType::Integer),
            FieldSpec::required("concept_name", FieldType::String),
            FieldSpec::optional("vocabulary_id", FieldType::String),
        ],
    }
}

fn standardized_schema() -> ObjectSchema {
    ObjectSchema {
        name: "StandardizedTerm",
        fields: vec![
            FieldSpec::required("original_term", FieldType::String).non_empty(),
            FieldSpec::required("domain", FieldType::String).one_of(Domain::VALUES),
            FieldSpec::required("entity_id", FieldType::String).non_empty(),
            FieldSpec::required("match_type", FieldType::String).one_of(MatchType::VALUES),
            FieldSpec::required("matches", FieldType::ObjectList(concept_schema())),
        ],
    }
}

// ═══════════════════════════════════════════
// Stage schemas
// ═══════════════════════════════════════════

fn envelope(statuses: &'static [&'static str]) -> Vec<FieldSpec> {
    vec![
        FieldSpec::required("message_id", FieldType::String).non_empty(),
        FieldSpec::required("timestamp", FieldType::Timestamp),
        FieldSpec::required("correlation_id", FieldType::String).non_empty(),
        FieldSpec::required("status", FieldType::String).one_of(statuses),
        FieldSpec::required("metadata", FieldType::Mapping),
    ]
}

fn output_statuses(version: SchemaVersion) -> &'static [&'static str] {
    match version {
        SchemaVersion::V1 => V1_OUTPUT_STATUSES,
        SchemaVersion::V2 => MessageStatus::VALUES,
    }
}

fn stage_schema(stage: Stage, version: SchemaVersion) -> Schema {
    let mut fields = envelope(output_statuses(version));
    let mut rules = Vec::new();

    let principal = match stage {
        Stage::Preprocessing => {
            fields.push(FieldSpec::payload("preprocessed_text", FieldType::String));
            Principal { field: "preprocessed_text", may_be_empty: false }
        }
        Stage::Chunking => {
            fields.push(FieldSpec::payload("chunks", FieldType::ObjectList(chunk_schema())));
            fields.push(FieldSpec::payload("chunk_count", FieldType::Count));
            Principal { field: "chunks", may_be_empty: false }
        }
        Stage::EntityExtraction => {
            fields.push(FieldSpec::payload("terms", FieldType::ObjectList(term_schema())));
            rules.push(ContentRule::UniqueKey { list: "terms", key: "entity_id" });
            Principal {
                field: "terms",
                may_be_empty: version == SchemaVersion::V2,
            }
        }
        Stage::Standardization => {
            fields.push(FieldSpec::payload("results", FieldType::ObjectList(standardized_schema())));
            rules.push(ContentRule::UniqueKey { list: "results", key: "entity_id" });
            rules.push(ContentRule::MatchesAgreeWithType);
            Principal {
                field: "results",
                may_be_empty: version == SchemaVersion::V2,
            }
        }
    };

    Schema {
        stage: Some(stage),
        name: stage.as_str(),
        version,
        fields,
        principal: Some(principal),
        rules,
    }
}

fn source_schema(version: SchemaVersion) -> Schema {
    let mut fields = envelope(MessageStatus::VALUES);
    fields.push(FieldSpec::required("raw_text", FieldType::String));
    Schema {
        stage: None,
        name: "source",
        version,
        fields,
        principal: Some(Principal { field: "raw_text", may_be_empty: false }),
        rules: Vec::new(),
    }
}

// ═══════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════

/// Immutable lookup of stage schemas for one schema revision.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    version: SchemaVersion,
    stages: HashMap<Stage, Schema>,
    source: Schema,
}

impl SchemaRegistry {
    pub fn new(version: SchemaVersion) -> Self {
        let stages = Stage::all()
            .iter()
            .map(|stage| (*stage, stage_schema(*stage, version)))
            .collect();
        tracing::debug!(version = %version, "Schema registry initialized");
        Self {
            version,
            stages,
            source: source_schema(version),
        }
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Output schema of `stage`.
    pub fn schema_for(&self, stage: Stage) -> &Schema {
        // Every stage is inserted in `new`.
        &self.stages[&stage]
    }

    /// Lookup by wire name. An unknown name is a wiring bug, not a data problem.
    pub fn schema_for_name(&self, name: &str) -> Result<&Schema, ContractError> {
        let stage: Stage = name
            .parse()
            .map_err(|_| ContractError::Configuration(format!("no schema registered for stage `{name}`")))?;
        Ok(self.schema_for(stage))
    }

    /// Schema of the raw document that enters preprocessing.
    pub fn source_schema(&self) -> &Schema {
        &self.source
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(SchemaVersion::V2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_has_a_schema() {
        let registry = SchemaRegistry::default();
        for stage in Stage::all() {
            let schema = registry.schema_for(*stage);
            assert_eq!(schema.stage, Some(*stage));
            assert_eq!(schema.name, stage.as_str());
            assert!(schema.field("correlation_id").is_some());
            assert!(schema.field("metadata").is_some());
        }
    }

    #[test]
    fn unknown_stage_is_configuration_error() {
        let registry = SchemaRegistry::default();
        let err = registry.schema_for_name("deidentification").unwrap_err();
        assert!(matches!(err, ContractError::Configuration(msg) if msg.contains("deidentification")));
        assert!(registry.schema_for_name("chunking").is_ok());
    }

    #[test]
    fn payload_fields_per_stage() {
        let registry = SchemaRegistry::default();
        let chunking = registry.schema_for(Stage::Chunking);
        assert_eq!(chunking.field("chunks").unwrap().presence, Presence::WhenCompleted);
        assert_eq!(chunking.field("message_id").unwrap().presence, Presence::Always);
        assert!(chunking.field("chunk_count").is_some());
        assert!(registry.schema_for(Stage::Preprocessing).field("preprocessed_text").is_some());
        assert!(registry.schema_for(Stage::Standardization).field("results").is_some());
        assert!(registry.source_schema().field("raw_text").is_some());
    }

    #[test]
    fn versions_differ_on_terms_and_statuses() {
        let strict = SchemaRegistry::new(SchemaVersion::V1);
        let loose = SchemaRegistry::new(SchemaVersion::V2);

        for stage in [Stage::EntityExtraction, Stage::Standardization] {
            assert!(!strict.schema_for(stage).principal.unwrap().may_be_empty, "{stage}");
            assert!(loose.schema_for(stage).principal.unwrap().may_be_empty, "{stage}");
        }
        assert!(!loose.schema_for(Stage::Chunking).principal.unwrap().may_be_empty);

        let strict_status = strict.schema_for(Stage::Chunking).field("status").unwrap();
        assert_eq!(strict_status.allowed, Some(V1_OUTPUT_STATUSES));
        let loose_status = loose.schema_for(Stage::Chunking).field("status").unwrap();
        assert_eq!(loose_status.allowed.map(|a| a.len()), Some(4));
    }

    #[test]
    fn standardization_carries_content_rules() {
        let registry = SchemaRegistry::default();
        let schema = registry.schema_for(Stage::Standardization);
        assert!(schema.rules.contains(&ContentRule::MatchesAgreeWithType));
        assert!(schema
            .rules
            .contains(&ContentRule::UniqueKey { list: "results", key: "entity_id" }));
    }
}
