//! Boundary checks: the one object stages call when a message crosses a queue.
//!
//! `ContractEngine` owns the schema registry, the integrity checker and the
//! correlation tracker for one pipeline instance. It is constructed
//! explicitly and passed around, so several pipelines can coexist in a
//! single test process.
//!
//! Producers call `check_outbound` before publishing a stage output;
//! consumers call `check_inbound` before processing what they received.
//! Both return a `BoundaryReport` whose `Verdict` tells the caller what to
//! do with the message. The engine itself never touches a queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::clock::{Clock, SystemClock};
use super::error::ContractError;
use super::integrity::{check_lineage, IntegrityChecker};
use super::schema::{Schema, SchemaRegistry};
use super::status::{disposition, Disposition};
use super::tracker::{CorrelationRecord, CorrelationTracker, Observation, TrackerSummary};
use super::types::{IntegrityFinding, Severity, ValidationResult, Violation, ViolationKind};
use super::validator::{validate_at, TimeBound};
use crate::config::EngineConfig;
use crate::models::enums::{MessageStatus, Stage};
use crate::models::message::PipelineMessage;

// ═══════════════════════════════════════════
// Report types
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Publish or process normally.
    Forward,
    /// Failed upstream: forward unprocessed with failure metadata.
    PassThrough,
    /// Schema violation: the caller NACKs and the producer must fix it.
    Reject,
    /// Integrity or state-machine problem: set aside for manual review.
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Everything found at one boundary crossing.
#[derive(Debug, Clone, Serialize)]
pub struct BoundaryReport {
    pub stage: Stage,
    pub direction: Direction,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub verdict: Verdict,
    pub schema: ValidationResult,
    pub content: Vec<Violation>,
    pub findings: Vec<IntegrityFinding>,
    /// Decoded message, present once the schema check passed.
    #[serde(skip)]
    pub message: Option<PipelineMessage>,
}

impl BoundaryReport {
    /// No violation and no finding of any severity.
    pub fn is_clean(&self) -> bool {
        self.schema.is_valid() && self.content.is_empty() && self.findings.is_empty()
    }

    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.schema.violations.iter().chain(self.content.iter())
    }
}

// ═══════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════

pub struct ContractEngine {
    config: EngineConfig,
    registry: SchemaRegistry,
    checker: IntegrityChecker,
    tracker: CorrelationTracker,
    clock: Arc<dyn Clock>,
}

impl ContractEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ContractError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, ContractError> {
        config.validate()?;
        tracing::info!(
            schema_version = %config.schema_version,
            stuck_timeout_secs = config.stuck_timeout_secs,
            "Contract engine initialized"
        );
        Ok(Self {
            registry: SchemaRegistry::new(config.schema_version),
            checker: IntegrityChecker::new(&config),
            tracker: CorrelationTracker::new(config.stuck_timeout()),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn checker(&self) -> &IntegrityChecker {
        &self.checker
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Schema applied to messages received by `stage`.
    pub fn input_schema(&self, stage: Stage) -> &Schema {
        match stage.previous() {
            Some(prev) => self.registry.schema_for(prev),
            None => self.registry.source_schema(),
        }
    }

    /// Validate a raw message against `stage`'s output schema.
    pub fn validate(&self, stage: Stage, message: &Value) -> ValidationResult {
        validate_at(message, self.registry.schema_for(stage), Some(self.time_bound()))
    }

    fn time_bound(&self) -> TimeBound {
        TimeBound {
            now: self.clock.now(),
            skew: self.config.clock_skew(),
        }
    }

    /// Check a stage output before it is published.
    ///
    /// `upstream` is the message the output was derived from; when given,
    /// lineage and payload preservation are checked against it.
    pub fn check_outbound(
        &self,
        stage: Stage,
        message: &Value,
        upstream: Option<&PipelineMessage>,
    ) -> BoundaryReport {
        let schema = validate_at(message, self.registry.schema_for(stage), Some(self.time_bound()));
        let mut report = BoundaryReport::new(stage, Direction::Outbound, message, schema);
        let Some(msg) = report.decode(message) else {
            return report.finish();
        };

        if msg.status == MessageStatus::Completed {
            report.content.extend(self.payload_checks(stage, &msg, upstream));
        }

        let mut observation = Observation::of_message(stage, &msg);
        if let Some(up) = upstream {
            report.content.extend(check_lineage(up, &msg));
            observation = observation.expecting(up.correlation_id.clone());
        }
        report.findings = self.tracker.observe(observation).findings;

        report.verdict = if !report.content.is_empty() || report.has_critical() {
            Verdict::Quarantine
        } else if msg.status == MessageStatus::Failed {
            Verdict::PassThrough
        } else {
            Verdict::Forward
        };
        report.message = Some(msg);
        report.finish()
    }

    /// Check a message a consumer at `stage` has just received.
    pub fn check_inbound(&self, stage: Stage, message: &Value) -> BoundaryReport {
        let schema = validate_at(message, self.input_schema(stage), Some(self.time_bound()));
        let mut report = BoundaryReport::new(stage, Direction::Inbound, message, schema);
        let Some(msg) = report.decode(message) else {
            return report.finish();
        };

        // The producing stage may not have checked its own output.
        if let Some(prev) = stage.previous() {
            report.findings = self.tracker.observe(Observation::of_message(prev, &msg)).findings;
        }

        let is_source = stage.previous().is_none() && msg.status == MessageStatus::Pending;
        report.verdict = if report.has_critical() {
            Verdict::Quarantine
        } else if is_source {
            Verdict::Forward
        } else {
            match disposition(&msg) {
                Disposition::Process => Verdict::Forward,
                Disposition::PassThrough => Verdict::PassThrough,
                Disposition::Quarantine => Verdict::Quarantine,
            }
        };
        report.message = Some(msg);
        report.finish()
    }

    fn payload_checks(
        &self,
        stage: Stage,
        msg: &PipelineMessage,
        upstream: Option<&PipelineMessage>,
    ) -> Vec<Violation> {
        let mut out = Vec::new();
        match stage {
            Stage::Preprocessing => {
                let original = upstream.and_then(|u| u.raw_text.as_deref());
                if let (Some(raw), Some(cleaned)) = (original, msg.preprocessed_text.as_deref()) {
                    out.extend(
                        self.checker
                            .check_text_bounds(raw.chars().count(), cleaned.chars().count()),
                    );
                }
            }
            Stage::Chunking => {
                let chunks = msg.chunks.as_deref().unwrap_or_default();
                out.extend(self.checker.check_chunks(chunks, msg.chunk_count));
                if let Some(text) = upstream.and_then(|u| u.preprocessed_text.as_deref()) {
                    out.extend(self.checker.check_chunk_coverage(chunks, text.chars().count()));
                }
            }
            Stage::EntityExtraction | Stage::Standardization => {}
        }
        out
    }

    // ═══════════════════════════════════════════
    // Tracker passthroughs
    // ═══════════════════════════════════════════

    pub fn find_stuck(&self) -> Vec<IntegrityFinding> {
        self.tracker.find_stuck(self.clock.now())
    }

    pub fn find_incomplete(&self) -> Vec<IntegrityFinding> {
        self.tracker.find_incomplete()
    }

    pub fn record(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        self.tracker.record(correlation_id)
    }

    pub fn summary(&self) -> TrackerSummary {
        self.tracker.summary()
    }
}

impl BoundaryReport {
    fn new(stage: Stage, direction: Direction, message: &Value, schema: ValidationResult) -> Self {
        let field = |name: &str| message.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            stage,
            direction,
            correlation_id: field("correlation_id"),
            message_id: field("message_id"),
            verdict: Verdict::Reject,
            schema,
            content: Vec::new(),
            findings: Vec::new(),
            message: None,
        }
    }

    /// Typed view of a schema-valid message. `None` leaves the verdict at `Reject`.
    fn decode(&mut self, message: &Value) -> Option<PipelineMessage> {
        if !self.schema.is_valid() {
            return None;
        }
        match PipelineMessage::from_value(message) {
            Ok(msg) => Some(msg),
            Err(err) => {
                self.schema
                    .violations
                    .push(Violation::new("$", ViolationKind::TypeMismatch, err.to_string()));
                None
            }
        }
    }

    fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }

    fn finish(self) -> Self {
        let correlation_id = self.correlation_id.as_deref().unwrap_or("");
        let message_id = self.message_id.as_deref().unwrap_or("");
        for v in self.violations() {
            tracing::warn!(
                correlation_id,
                message_id,
                stage = %self.stage,
                direction = ?self.direction,
                path = %v.path,
                kind = ?v.kind,
                "Contract violation: {}",
                v.reason
            );
        }
        if self.verdict != Verdict::Forward {
            tracing::info!(
                correlation_id,
                message_id,
                stage = %self.stage,
                direction = ?self.direction,
                verdict = ?self.verdict,
                "Boundary verdict"
            );
        }
        self
    }
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
