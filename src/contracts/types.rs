//! Report types shared by the validator, the integrity checker and the tracker.
//!
//! Nothing here is an error in the `Result` sense: every type describes a
//! problem found in a message, collected and handed back to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::enums::Stage;

// ═══════════════════════════════════════════
// Violations (schema + content)
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    // Schema
    NotAMapping,
    MissingField,
    TypeMismatch,
    EnumMismatch,
    EmptyValue,
    InvalidTimestamp,
    FutureTimestamp,
    MissingErrorMetadata,
    EmptyPrincipal,
    DuplicateEntityId,
    MatchTypeMismatch,
    // Content integrity
    ChunkOrder,
    ChunkSpan,
    ChunkOverlap,
    ChunkGap,
    ChunkCountMismatch,
    IncompleteCoverage,
    MetadataRemoved,
    MetadataMutated,
    LengthOutOfBounds,
    InvalidTolerance,
    CorrelationDrift,
    ReusedMessageId,
    TimestampRegression,
}

impl ViolationKind {
    /// Schema violations are recoverable: the producer fixes the message.
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            Self::NotAMapping
                | Self::MissingField
                | Self::TypeMismatch
                | Self::EnumMismatch
                | Self::EmptyValue
                | Self::InvalidTimestamp
                | Self::FutureTimestamp
                | Self::MissingErrorMetadata
                | Self::EmptyPrincipal
                | Self::DuplicateEntityId
                | Self::MatchTypeMismatch
        )
    }
}

/// A single problem, located by a field path such as `chunks[1].start_pos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
    pub reason: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Outcome of validating one message. Valid iff there are no violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub schema: String,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.path.as_str()).collect()
    }
}

// ═══════════════════════════════════════════
// Tracker findings
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Liveness concern, not an error per se.
    Notice,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    CorrelationDrift,
    DuplicateProcessing,
    /// A known message reported a status at or before one it already held.
    StatusRegression,
    StageSkip,
    OutOfOrder,
    StuckPipeline,
    IncompleteRun,
}

impl FindingKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::CorrelationDrift | Self::StatusRegression => Severity::Critical,
            Self::DuplicateProcessing | Self::StageSkip | Self::OutOfOrder => Severity::Major,
            Self::StuckPipeline | Self::IncompleteRun => Severity::Notice,
        }
    }
}

/// Cross-message integrity problem attributed to one correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub correlation_id: String,
    pub stage: Stage,
    pub message_id: Option<String>,
    pub detail: String,
}

impl IntegrityFinding {
    pub fn new(
        kind: FindingKind,
        correlation_id: impl Into<String>,
        stage: Stage,
        message_id: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            correlation_id: correlation_id.into(),
            stage,
            message_id,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for IntegrityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} at {}: {}",
            self.kind, self.correlation_id, self.stage, self.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_result_helpers() {
        let result = ValidationResult {
            schema: "chunking".into(),
            violations: vec![
                Violation::new("chunks", ViolationKind::MissingField, "required field is missing"),
                Violation::new("status", ViolationKind::EnumMismatch, "bad"),
            ],
        };
        assert!(!result.is_valid());
        assert!(result.has(ViolationKind::MissingField));
        assert_eq!(result.count(ViolationKind::TypeMismatch), 0);
        assert_eq!(result.paths(), vec!["chunks", "status"]);
    }

    #[test]
    fn drift_and_regression_are_critical() {
        assert_eq!(FindingKind::CorrelationDrift.severity(), Severity::Critical);
        assert_eq!(FindingKind::StatusRegression.severity(), Severity::Critical);
        assert_eq!(FindingKind::DuplicateProcessing.severity(), Severity::Major);
        assert_eq!(FindingKind::StuckPipeline.severity(), Severity::Notice);
        assert!(Severity::Critical > Severity::Major);
    }

    #[test]
    fn violation_serializes_kind_in_snake_case() {
        let v = Violation::new("metadata.patient_id", ViolationKind::MetadataMutated, "changed");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "metadata_mutated");
        assert_eq!(v.to_string(), "metadata.patient_id: changed");
    }
}
