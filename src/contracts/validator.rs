//! Schema validation of raw JSON messages.
//!
//! `validate` is pure and total: any JSON value, however malformed, yields a
//! `ValidationResult`. Checks run in a fixed order (presence, type, enum,
//! metadata, nested elements, content rules, timestamp bound) and every
//! violation is collected. A field that failed an earlier check is not
//! inspected again, so a missing field is reported exactly once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use super::schema::{ContentRule, FieldSpec, FieldType, ObjectSchema, Presence, Schema};
use super::types::{ValidationResult, Violation, ViolationKind};
use crate::models::enums::{MatchType, MessageStatus};
use crate::models::message::ERROR_KEY;

/// Upper bound for message timestamps: `now` plus tolerated producer clock lead.
#[derive(Debug, Clone, Copy)]
pub struct TimeBound {
    pub now: DateTime<Utc>,
    pub skew: Duration,
}

/// Validate `message` against `schema` without a clock.
pub fn validate(message: &Value, schema: &Schema) -> ValidationResult {
    validate_at(message, schema, None)
}

/// Validate `message`, additionally rejecting timestamps past `bound`.
pub fn validate_at(message: &Value, schema: &Schema, bound: Option<TimeBound>) -> ValidationResult {
    let mut violations = Vec::new();

    let Some(obj) = message.as_object() else {
        violations.push(Violation::new(
            "$",
            ViolationKind::NotAMapping,
            format!("message must be a mapping, got {}", json_type(message)),
        ));
        return ValidationResult {
            schema: schema.name.to_string(),
            violations,
        };
    };

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<MessageStatus>().ok());
    let failed = status == Some(MessageStatus::Failed);
    let completed = status == Some(MessageStatus::Completed);

    // 1-3. Presence, type, enum.
    let sound = check_fields(obj, &schema.fields, "", completed, &mut violations);

    // 4. Metadata sub-contract.
    if sound.contains("metadata") {
        if let Some(meta) = obj.get("metadata").and_then(Value::as_object) {
            check_metadata(meta, schema, failed, &mut violations);
        }
    }

    // 5. Nested list-of-object elements.
    check_nested(obj, &schema.fields, "", &sound, &mut violations);

    // 6. Content rules.
    if completed {
        check_principal(obj, schema, &sound, &mut violations);
    }
    for rule in &schema.rules {
        check_rule(obj, *rule, &sound, &mut violations);
    }

    // 7. Timestamp bound.
    if let (Some(bound), true) = (bound, sound.contains("timestamp")) {
        if let Some(ts) = obj.get("timestamp").and_then(Value::as_str).and_then(parse_timestamp) {
            // An unrepresentable limit lies past every parseable timestamp.
            let limit = bound.now.checked_add_signed(bound.skew);
            if limit.is_some_and(|limit| ts > limit) {
                violations.push(Violation::new(
                    "timestamp",
                    ViolationKind::FutureTimestamp,
                    format!("timestamp {ts} is later than the current time {}", bound.now),
                ));
            }
        }
    }

    ValidationResult {
        schema: schema.name.to_string(),
        violations,
    }
}

// ═══════════════════════════════════════════
// Field checks
// ═══════════════════════════════════════════

/// Run presence, type and enum checks; return the names of fields that passed all three.
///
/// Payload fields are only required once the message reports `completed`.
fn check_fields(
    obj: &Map<String, Value>,
    fields: &[FieldSpec],
    prefix: &str,
    completed: bool,
    out: &mut Vec<Violation>,
) -> HashSet<&'static str> {
    let mut present = Vec::new();
    for spec in fields {
        match obj.get(spec.name) {
            Some(_) => present.push(spec),
            None => {
                let required = match spec.presence {
                    Presence::Always => true,
                    Presence::WhenCompleted => completed,
                    Presence::Optional => false,
                };
                if required {
                    out.push(Violation::new(
                        join(prefix, spec.name),
                        ViolationKind::MissingField,
                        "required field is missing",
                    ));
                }
            }
        }
    }

    let mut typed = Vec::new();
    for spec in present {
        let value = &obj[spec.name];
        if value.is_null() && spec.presence == Presence::Optional {
            continue;
        }
        if let Some(violation) = check_type(value, spec, prefix) {
            out.push(violation);
        } else {
            typed.push(spec);
        }
    }

    let mut sound = HashSet::new();
    for spec in typed {
        let value = &obj[spec.name];
        if let (Some(allowed), Some(s)) = (spec.allowed, value.as_str()) {
            if !allowed.iter().any(|a| *a == s) {
                out.push(Violation::new(
                    join(prefix, spec.name),
                    ViolationKind::EnumMismatch,
                    format!("`{s}` is not one of {}", allowed.join(", ")),
                ));
                continue;
            }
        }
        sound.insert(spec.name);
    }
    sound
}

fn check_type(value: &Value, spec: &FieldSpec, prefix: &str) -> Option<Violation> {
    let path = join(prefix, spec.name);
    let ok = match &spec.kind {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Count => value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Mapping => value.is_object(),
        FieldType::Sequence | FieldType::ObjectList(_) => value.is_array(),
        FieldType::Timestamp => match value.as_str() {
            Some(raw) if parse_timestamp(raw).is_some() => true,
            Some(raw) => {
                return Some(Violation::new(
                    path,
                    ViolationKind::InvalidTimestamp,
                    format!("`{raw}` is not an RFC 3339 timestamp"),
                ))
            }
            None => false,
        },
    };

    if !ok {
        return Some(Violation::new(
            path,
            ViolationKind::TypeMismatch,
            format!("expected {}, got {}", spec.kind.name(), json_type(value)),
        ));
    }

    if spec.non_empty && value.as_str().is_some_and(str::is_empty) {
        return Some(Violation::new(path, ViolationKind::EmptyValue, "must not be empty"));
    }
    None
}

fn check_metadata(meta: &Map<String, Value>, schema: &Schema, failed: bool, out: &mut Vec<Violation>) {
    for key in schema.required_metadata_keys() {
        let path = format!("metadata.{key}");
        match meta.get(*key) {
            None => out.push(Violation::new(path, ViolationKind::MissingField, "required field is missing")),
            Some(Value::String(s)) if s.is_empty() => {
                out.push(Violation::new(path, ViolationKind::EmptyValue, "must not be empty"))
            }
            Some(Value::String(_)) => {}
            Some(other) => out.push(Violation::new(
                path,
                ViolationKind::TypeMismatch,
                format!("expected string, got {}", json_type(other)),
            )),
        }
    }

    if failed {
        let error_ok = meta.get(ERROR_KEY).and_then(Value::as_object).is_some_and(|err| {
            ["kind", "description"]
                .iter()
                .all(|k| err.get(*k).and_then(Value::as_str).is_some_and(|s| !s.is_empty()))
        });
        if !error_ok {
            out.push(Violation::new(
                format!("metadata.{ERROR_KEY}"),
                ViolationKind::MissingErrorMetadata,
                "failed messages must carry an error entry with kind and description",
            ));
        }
    }
}

fn check_nested(
    obj: &Map<String, Value>,
    fields: &[FieldSpec],
    prefix: &str,
    sound: &HashSet<&'static str>,
    out: &mut Vec<Violation>,
) {
    for spec in fields {
        let FieldType::ObjectList(nested) = &spec.kind else {
            continue;
        };
        if !sound.contains(spec.name) {
            continue;
        }
        let Some(items) = obj.get(spec.name).and_then(Value::as_array) else {
            continue;
        };
        for (i, item) in items.iter().enumerate() {
            let item_prefix = format!("{}[{i}]", join(prefix, spec.name));
            check_element(item, nested, &item_prefix, out);
        }
    }
}

fn check_element(item: &Value, schema: &ObjectSchema, path: &str, out: &mut Vec<Violation>) {
    let Some(obj) = item.as_object() else {
        out.push(Violation::new(
            path,
            ViolationKind::TypeMismatch,
            format!("expected {} mapping, got {}", schema.name, json_type(item)),
        ));
        return;
    };
    let sound = check_fields(obj, &schema.fields, path, true, out);
    check_nested(obj, &schema.fields, path, &sound, out);
}

// ═══════════════════════════════════════════
// Content rules
// ═══════════════════════════════════════════

fn check_principal(
    obj: &Map<String, Value>,
    schema: &Schema,
    sound: &HashSet<&'static str>,
    out: &mut Vec<Violation>,
) {
    let Some(principal) = schema.principal else {
        return;
    };
    if !sound.contains(principal.field) || principal.may_be_empty {
        return;
    }
    let empty = match obj.get(principal.field) {
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    };
    if empty {
        out.push(Violation::new(
            principal.field,
            ViolationKind::EmptyPrincipal,
            "must not be empty when status is completed",
        ));
    }
}

fn check_rule(obj: &Map<String, Value>, rule: ContentRule, sound: &HashSet<&'static str>, out: &mut Vec<Violation>) {
    match rule {
        ContentRule::UniqueKey { list, key } => {
            if !sound.contains(list) {
                return;
            }
            let mut first_seen: HashMap<&str, usize> = HashMap::new();
            for (i, item) in elements(obj, list) {
                let Some(id) = item.get(key).and_then(Value::as_str) else {
                    continue;
                };
                if let Some(first) = first_seen.get(id) {
                    out.push(Violation::new(
                        format!("{list}[{i}].{key}"),
                        ViolationKind::DuplicateEntityId,
                        format!("`{id}` already used by {list}[{first}]"),
                    ));
                } else {
                    first_seen.insert(id, i);
                }
            }
        }
        ContentRule::MatchesAgreeWithType => {
            if !sound.contains("results") {
                return;
            }
            for (i, item) in elements(obj, "results") {
                let match_type = item
                    .get("match_type")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<MatchType>().ok());
                let matches = item.get("matches").and_then(Value::as_array);
                let (Some(match_type), Some(matches)) = (match_type, matches) else {
                    continue;
                };
                let is_no_match = match_type == MatchType::NoMatch;
                if is_no_match != matches.is_empty() {
                    let reason = if is_no_match {
                        "no_match results must not carry concept matches".to_string()
                    } else {
                        format!("{match_type} results must carry at least one concept match")
                    };
                    out.push(Violation::new(
                        format!("results[{i}].matches"),
                        ViolationKind::MatchTypeMismatch,
                        reason,
                    ));
                }
            }
        }
    }
}

fn elements<'a>(obj: &'a Map<String, Value>, list: &str) -> impl Iterator<Item = (usize, &'a Map<String, Value>)> {
    obj.get(list)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .filter_map(|(i, v)| v.as_object().map(|o| (i, o)))
}

// ═══════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::schema::SchemaRegistry;
    use crate::models::enums::{SchemaVersion, Stage};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn envelope(status: &str) -> Value {
        json!({
            "message_id": "msg-002",
            "timestamp": "2026-01-01T10:00:00.000Z",
            "correlation_id": "corr-001",
            "status": status,
            "metadata": {"patient_id": "TEST001", "document_id": "DOC001"}
        })
    }

    fn with(mut base: Value, key: &str, value: Value) -> Value {
        base.as_object_mut().unwrap().insert(key.into(), value);
        base
    }

    fn valid_for(stage: Stage) -> Value {
        let base = envelope("completed");
        match stage {
            Stage::Preprocessing => with(base, "preprocessed_text", json!("Patient presents with chest pain.")),
            Stage::Chunking => with(
                with(
                    base,
                    "chunks",
                    json!([
                        {"chunk_id": "c0", "text": "a", "start_pos": 0, "end_pos": 32, "word_count": 6, "char_count": 32},
                        {"chunk_id": "c1", "text": "b", "start_pos": 32, "end_pos": 64, "word_count": 6, "char_count": 32}
                    ]),
                ),
                "chunk_count",
                json!(2),
            ),
            Stage::EntityExtraction => with(
                base,
                "terms",
                json!([
                    {"term": "aspirin", "domain": "Drug", "entity_id": "e1"},
                    {"term": "chest pain", "domain": "Condition", "entity_id": "e2"}
                ]),
            ),
            Stage::Standardization => with(
                base,
                "results",
                json!([
                    {"original_term": "aspirin", "domain": "Drug", "entity_id": "e1", "match_type": "direct",
                     "matches": [{"concept_id": 1112807, "concept_name": "aspirin", "vocabulary_id": "RxNorm"}]},
                    {"original_term": "zzz", "domain": "Observation", "entity_id": "e2", "match_type": "no_match", "matches": []}
                ]),
            ),
        }
    }

    fn schema(stage: Stage) -> Schema {
        SchemaRegistry::default().schema_for(stage).clone()
    }

    #[test]
    fn valid_messages_have_no_violations() {
        for stage in Stage::all() {
            let result = validate(&valid_for(*stage), &schema(*stage));
            assert!(result.is_valid(), "{stage}: {:?}", result.violations);
        }
    }

    #[test]
    fn non_mapping_short_circuits() {
        let result = validate(&json!(["not", "a", "message"]), &schema(Stage::Chunking));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].path, "$");
        assert_eq!(result.violations[0].kind, ViolationKind::NotAMapping);
    }

    #[test]
    fn missing_field_reported_alone() {
        for stage in Stage::all() {
            let valid = valid_for(*stage);
            for key in valid.as_object().unwrap().keys() {
                let mut msg = valid.clone();
                msg.as_object_mut().unwrap().remove(key);
                let result = validate(&msg, &schema(*stage));
                assert_eq!(result.violations.len(), 1, "{stage}/{key}: {:?}", result.violations);
                assert_eq!(result.violations[0].path, *key);
                assert_eq!(result.violations[0].kind, ViolationKind::MissingField);
            }
        }
    }

    #[test]
    fn aggregates_all_violations() {
        let msg = json!({
            "message_id": 7,
            "timestamp": "yesterday",
            "correlation_id": "corr-001",
            "status": "done",
            "metadata": {"patient_id": "", "document_id": "DOC001"},
            "preprocessed_text": "text"
        });
        let result = validate(&msg, &schema(Stage::Preprocessing));
        assert!(result.has(ViolationKind::TypeMismatch));
        assert!(result.has(ViolationKind::InvalidTimestamp));
        assert!(result.has(ViolationKind::EnumMismatch));
        assert!(result.has(ViolationKind::EmptyValue));
        assert_eq!(result.violations.len(), 4);
    }

    #[test]
    fn metadata_keys_required() {
        let msg = with(
            valid_for(Stage::Preprocessing),
            "metadata",
            json!({"patient_id": 12, "source": "ehr"}),
        );
        let result = validate(&msg, &schema(Stage::Preprocessing));
        assert_eq!(result.paths(), vec!["metadata.patient_id", "metadata.document_id"]);
        assert_eq!(result.violations[0].kind, ViolationKind::TypeMismatch);
        assert_eq!(result.violations[1].kind, ViolationKind::MissingField);
    }

    #[test]
    fn nested_elements_checked_with_paths() {
        let msg = with(
            valid_for(Stage::EntityExtraction),
            "terms",
            json!([
                {"term": "aspirin", "domain": "Medication", "entity_id": "e1"},
                {"term": "", "domain": "Drug"},
                "ibuprofen"
            ]),
        );
        let result = validate(&msg, &schema(Stage::EntityExtraction));
        assert_eq!(
            result.paths(),
            vec!["terms[0].domain", "terms[1].entity_id", "terms[1].term", "terms[2]"]
        );
    }

    #[test]
    fn deeply_nested_concepts_checked() {
        let msg = with(
            valid_for(Stage::Standardization),
            "results",
            json!([{"original_term": "aspirin", "domain": "Drug", "entity_id": "e1", "match_type": "ingredient",
                    "matches": [{"concept_id": "1112807", "concept_name": "aspirin"}]}]),
        );
        let result = validate(&msg, &schema(Stage::Standardization));
        assert_eq!(result.paths(), vec!["results[0].matches[0].concept_id"]);
    }

    #[test]
    fn completed_preprocessing_needs_text() {
        let msg = with(valid_for(Stage::Preprocessing), "preprocessed_text", json!("   "));
        let result = validate(&msg, &schema(Stage::Preprocessing));
        assert_eq!(result.count(ViolationKind::EmptyPrincipal), 1);

        // Still processing: emptiness is not yet a defect.
        let msg = with(msg, "status", json!("processing"));
        assert!(validate(&msg, &schema(Stage::Preprocessing)).is_valid());
    }

    #[test]
    fn empty_terms_allowed_in_v2_only() {
        let msg = with(valid_for(Stage::EntityExtraction), "terms", json!([]));
        assert!(validate(&msg, &schema(Stage::EntityExtraction)).is_valid());

        let strict = SchemaRegistry::new(SchemaVersion::V1);
        let result = validate(&msg, strict.schema_for(Stage::EntityExtraction));
        assert_eq!(result.count(ViolationKind::EmptyPrincipal), 1);
    }

    #[test]
    fn strict_version_rejects_pending_output() {
        let strict = SchemaRegistry::new(SchemaVersion::V1);
        let msg = with(valid_for(Stage::Preprocessing), "status", json!("pending"));
        let result = validate(&msg, strict.schema_for(Stage::Preprocessing));
        assert_eq!(result.paths(), vec!["status"]);
    }

    #[test]
    fn empty_chunks_rejected_when_completed() {
        let msg = with(with(valid_for(Stage::Chunking), "chunks", json!([])), "chunk_count", json!(0));
        let result = validate(&msg, &schema(Stage::Chunking));
        assert_eq!(result.paths(), vec!["chunks"]);
    }

    #[test]
    fn duplicate_entity_ids_flagged() {
        let msg = with(
            valid_for(Stage::EntityExtraction),
            "terms",
            json!([
                {"term": "aspirin", "domain": "Drug", "entity_id": "e1"},
                {"term": "fever", "domain": "Condition", "entity_id": "e1"}
            ]),
        );
        let result = validate(&msg, &schema(Stage::EntityExtraction));
        assert_eq!(result.paths(), vec!["terms[1].entity_id"]);
        assert_eq!(result.violations[0].kind, ViolationKind::DuplicateEntityId);
    }

    #[test]
    fn matches_must_agree_with_match_type() {
        let msg = with(
            valid_for(Stage::Standardization),
            "results",
            json!([
                {"original_term": "a", "domain": "Drug", "entity_id": "e1", "match_type": "direct", "matches": []},
                {"original_term": "b", "domain": "Drug", "entity_id": "e2", "match_type": "no_match",
                 "matches": [{"concept_id": 1, "concept_name": "x"}]}
            ]),
        );
        let result = validate(&msg, &schema(Stage::Standardization));
        assert_eq!(result.count(ViolationKind::MatchTypeMismatch), 2);
    }

    #[test]
    fn failed_message_needs_error_not_payload() {
        let msg = envelope("failed");
        let result = validate(&msg, &schema(Stage::Chunking));
        assert_eq!(result.paths(), vec!["metadata.error"]);
        assert_eq!(result.violations[0].kind, ViolationKind::MissingErrorMetadata);

        let msg = with(
            msg,
            "metadata",
            json!({"patient_id": "TEST001", "document_id": "DOC001",
                   "error": {"kind": "timeout", "description": "chunker timed out"}}),
        );
        assert!(validate(&msg, &schema(Stage::Chunking)).is_valid());
    }

    #[test]
    fn future_timestamp_detected_with_bound() {
        let msg = valid_for(Stage::Preprocessing);
        let bound = TimeBound {
            now: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
            skew: Duration::seconds(1),
        };
        let result = validate_at(&msg, &schema(Stage::Preprocessing), Some(bound));
        assert_eq!(result.paths(), vec!["timestamp"]);
        assert_eq!(result.violations[0].kind, ViolationKind::FutureTimestamp);

        let later = TimeBound {
            now: Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap(),
            ..bound
        };
        assert!(validate_at(&msg, &schema(Stage::Preprocessing), Some(later)).is_valid());
    }

    #[test]
    fn source_document_scenario_validates() {
        let msg = json!({
            "message_id": "msg-001",
            "timestamp": "2026-01-01T10:00:00.000Z",
            "correlation_id": "corr-001",
            "status": "pending",
            "metadata": {"patient_id": "TEST001", "document_id": "DOC001"},
            "raw_text": "Patient presents with chest pain..."
        });
        let registry = SchemaRegistry::default();
        assert!(validate(&msg, registry.source_schema()).is_valid());

        // Completed without text: the raw document is not a preprocessing output.
        let msg = with(msg, "status", json!("completed"));
        let result = validate(&msg, registry.schema_for(Stage::Preprocessing));
        assert_eq!(result.paths(), vec!["preprocessed_text"]);
        assert_eq!(result.violations[0].kind, ViolationKind::MissingField);
    }

    #[test]
    fn unfinished_messages_need_no_payload() {
        for stage in Stage::all() {
            for status in ["pending", "processing"] {
                let result = validate(&envelope(status), &schema(*stage));
                assert!(result.is_valid(), "{stage}/{status}: {:?}", result.violations);
            }
            let result = validate(&envelope("completed"), &schema(*stage));
            assert!(result.has(ViolationKind::MissingField), "{stage}");
        }
    }

    #[test]
    fn empty_results_allowed_in_v2_only() {
        let msg = with(valid_for(Stage::Standardization), "results", json!([]));
        assert!(validate(&msg, &schema(Stage::Standardization)).is_valid());

        let strict = SchemaRegistry::new(SchemaVersion::V1);
        let result = validate(&msg, strict.schema_for(Stage::Standardization));
        assert_eq!(result.paths(), vec!["results"]);
        assert_eq!(result.violations[0].kind, ViolationKind::EmptyPrincipal);
    }

    #[test]
    fn overflowing_skew_does_not_panic() {
        let msg = valid_for(Stage::Preprocessing);
        let bound = TimeBound {
            now: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
            skew: Duration::days(365 * 1_000_000),
        };
        assert!(validate_at(&msg, &schema(Stage::Preprocessing), Some(bound)).is_valid());
    }

    proptest! {
        #[test]
        fn never_panics_on_arbitrary_json(raw in "\\PC{0,64}", n in any::<i64>(), b in any::<bool>()) {
            let candidates = [
                json!(raw.clone()),
                json!(n),
                json!({"status": raw.clone(), "metadata": n, "chunks": b}),
                json!({"message_id": raw.clone(), "chunks": [n, raw.clone(), {"start_pos": b}]}),
            ];
            for candidate in &candidates {
                let result = validate(candidate, &schema(Stage::Chunking));
                prop_assert!(!result.is_valid());
            }
        }
    }
}
