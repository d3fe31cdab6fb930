//! Correlation tracking across the pipeline's asynchronous hops.
//!
//! One `CorrelationRecord` per correlation id, created on first sighting and
//! only ever extended. The tracker is the single piece of shared mutable
//! state in the engine: records live in a sharded `DashMap`, so `observe`
//! calls for different ids proceed in parallel while calls for the same id
//! serialize on that id's entry.
//!
//! Findings are reported, never raised. The caller decides what a stage skip
//! or a duplicate means for the message at hand.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::types::{FindingKind, IntegrityFinding};
use crate::models::enums::{MessageStatus, Stage};
use crate::models::message::PipelineMessage;

// ═══════════════════════════════════════════
// Records
// ═══════════════════════════════════════════

/// What the tracker knows about one stage of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageVisit {
    pub arrived_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Most recent status reported for the stage.
    pub status: MessageStatus,
    pub first_message_id: String,
    pub last_message_id: String,
    /// Every message seen at this stage with the statuses it was reported in.
    pub messages: BTreeMap<String, BTreeSet<MessageStatus>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationRecord {
    pub correlation_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub stages: BTreeMap<Stage, StageVisit>,
}

impl CorrelationRecord {
    fn new(correlation_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            first_seen: at,
            last_seen: at,
            stages: BTreeMap::new(),
        }
    }

    /// Furthest stage reached so far.
    pub fn latest(&self) -> Option<(Stage, &StageVisit)> {
        self.stages.iter().next_back().map(|(s, v)| (*s, v))
    }

    pub fn status_at(&self, stage: Stage) -> Option<MessageStatus> {
        self.stages.get(&stage).map(|v| v.status)
    }

    /// The final stage reported a terminal status.
    pub fn is_finished(&self) -> bool {
        Stage::all()
            .last()
            .and_then(|last| self.status_at(*last))
            .is_some_and(|s| s.is_terminal())
    }
}

// ═══════════════════════════════════════════
// Observations
// ═══════════════════════════════════════════

/// One sighting of a message at a stage boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub correlation_id: String,
    pub stage: Stage,
    pub message_id: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the upstream message this one was derived from.
    pub expected_correlation_id: Option<String>,
}

impl Observation {
    pub fn new(
        correlation_id: impl Into<String>,
        stage: Stage,
        message_id: impl Into<String>,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            stage,
            message_id: message_id.into(),
            status,
            timestamp,
            expected_correlation_id: None,
        }
    }

    pub fn of_message(stage: Stage, message: &PipelineMessage) -> Self {
        Self::new(
            message.correlation_id.clone(),
            stage,
            message.message_id.clone(),
            message.status,
            message.timestamp,
        )
    }

    pub fn expecting(mut self, correlation_id: impl Into<String>) -> Self {
        self.expected_correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingOutcome {
    pub findings: Vec<IntegrityFinding>,
    pub is_new_record: bool,
    /// Exact repeat of an earlier report; nothing was changed.
    pub is_repeat: bool,
}

/// Per-stage status counts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerSummary {
    pub runs: usize,
    pub finished: usize,
    pub per_stage: BTreeMap<Stage, StageCounts>,
}

// ═══════════════════════════════════════════
// Tracker
// ═══════════════════════════════════════════

pub struct CorrelationTracker {
    records: DashMap<String, CorrelationRecord>,
    /// message_id -> correlation_id it was first seen under.
    message_owners: DashMap<String, String>,
    stuck_timeout: Duration,
}

impl CorrelationTracker {
    pub fn new(stuck_timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            message_owners: DashMap::new(),
            stuck_timeout,
        }
    }

    pub fn stuck_timeout(&self) -> Duration {
        self.stuck_timeout
    }

    /// Record a sighting and report anything it reveals.
    pub fn observe(&self, obs: Observation) -> TrackingOutcome {
        let mut outcome = TrackingOutcome::default();

        // Holding the entry serializes every update of this correlation id.
        let mut record = match self.records.entry(obs.correlation_id.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                outcome.is_new_record = true;
                entry.insert(CorrelationRecord::new(&obs.correlation_id, obs.timestamp))
            }
        };

        let seen = record
            .stages
            .get(&obs.stage)
            .and_then(|visit| visit.messages.get(&obs.message_id))
            .is_some_and(|statuses| statuses.contains(&obs.status));
        if seen {
            outcome.is_repeat = true;
            return outcome;
        }

        self.check_drift(&obs, &mut outcome.findings);

        let later_stage_seen = record.stages.keys().any(|s| *s > obs.stage);
        let predecessor_missing = obs
            .stage
            .previous()
            .is_some_and(|prev| !record.stages.contains_key(&prev));

        match record.stages.get_mut(&obs.stage) {
            None => {
                if predecessor_missing {
                    let missing = obs.stage.previous().map(|s| s.as_str()).unwrap_or_default();
                    outcome.findings.push(finding(
                        FindingKind::StageSkip,
                        &obs,
                        format!("arrived at {} without any record at {missing}", obs.stage),
                    ));
                }
                if later_stage_seen {
                    outcome.findings.push(finding(
                        FindingKind::OutOfOrder,
                        &obs,
                        format!("arrived at {} after a later stage was already recorded", obs.stage),
                    ));
                }
                record.stages.insert(obs.stage, new_visit(&obs));
            }
            Some(visit) => {
                if let Some(statuses) = visit.messages.get_mut(&obs.message_id) {
                    let latest = statuses.iter().next_back().copied();
                    match latest {
                        Some(prev) if prev.rank() >= obs.status.rank() => {
                            let detail = format!("message re-observed at {} as {} after {prev}", obs.stage, obs.status);
                            outcome
                                .findings
                                .push(finding(FindingKind::DuplicateProcessing, &obs, detail.clone()));
                            outcome.findings.push(finding(FindingKind::StatusRegression, &obs, detail));
                        }
                        _ => advance(&mut visit.status, obs.status),
                    }
                    statuses.insert(obs.status);
                } else {
                    if visit.status.is_terminal() {
                        outcome.findings.push(finding(
                            FindingKind::DuplicateProcessing,
                            &obs,
                            format!(
                                "{} already finalized as {} by message {}",
                                obs.stage, visit.status, visit.last_message_id
                            ),
                        ));
                    } else if obs.status.rank() < visit.status.rank() {
                        outcome.findings.push(finding(
                            FindingKind::DuplicateProcessing,
                            &obs,
                            format!(
                                "{} already {} under message {}, new message reports {}",
                                obs.stage, visit.status, visit.last_message_id, obs.status
                            ),
                        ));
                    } else {
                        visit.status = obs.status;
                    }
                    visit
                        .messages
                        .insert(obs.message_id.clone(), BTreeSet::from([obs.status]));
                }
                visit.last_message_id = obs.message_id.clone();
                visit.last_seen_at = visit.last_seen_at.max(obs.timestamp);
            }
        }

        record.last_seen = record.last_seen.max(obs.timestamp);
        record.first_seen = record.first_seen.min(obs.timestamp);
        drop(record);

        for f in &outcome.findings {
            tracing::warn!(
                correlation_id = %f.correlation_id,
                message_id = f.message_id.as_deref().unwrap_or(""),
                stage = %f.stage,
                kind = ?f.kind,
                severity = ?f.severity,
                "{}",
                f.detail
            );
        }
        outcome
    }

    fn check_drift(&self, obs: &Observation, findings: &mut Vec<IntegrityFinding>) {
        if let Some(expected) = &obs.expected_correlation_id {
            if *expected != obs.correlation_id {
                findings.push(finding(
                    FindingKind::CorrelationDrift,
                    obs,
                    format!("expected correlation_id `{expected}`, got `{}`", obs.correlation_id),
                ));
            }
        }

        let owner = self
            .message_owners
            .entry(obs.message_id.clone())
            .or_insert_with(|| obs.correlation_id.clone())
            .clone();
        if owner != obs.correlation_id {
            findings.push(finding(
                FindingKind::CorrelationDrift,
                obs,
                format!(
                    "message first seen under correlation_id `{owner}` now carries `{}`",
                    obs.correlation_id
                ),
            ));
        }
    }

    /// Runs parked in `processing` with no observation for longer than the timeout.
    pub fn find_stuck(&self, now: DateTime<Utc>) -> Vec<IntegrityFinding> {
        let mut stuck = Vec::new();
        for entry in self.records.iter() {
            let record = entry.value();
            let Some((stage, visit)) = record.latest() else {
                continue;
            };
            let idle = now - record.last_seen;
            if visit.status == MessageStatus::Processing && idle > self.stuck_timeout {
                stuck.push(IntegrityFinding::new(
                    FindingKind::StuckPipeline,
                    record.correlation_id.clone(),
                    stage,
                    Some(visit.last_message_id.clone()),
                    format!(
                        "processing at {stage} with no progress for {}s (timeout {}s)",
                        idle.num_seconds(),
                        self.stuck_timeout.num_seconds()
                    ),
                ));
            }
        }
        stuck.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        for f in &stuck {
            tracing::info!(correlation_id = %f.correlation_id, stage = %f.stage, "{}", f.detail);
        }
        stuck
    }

    /// Runs that never reached a terminal status at the final stage.
    pub fn find_incomplete(&self) -> Vec<IntegrityFinding> {
        let mut incomplete: Vec<IntegrityFinding> = self
            .records
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .filter_map(|entry| {
                let record = entry.value();
                let (stage, visit) = record.latest()?;
                Some(IntegrityFinding::new(
                    FindingKind::IncompleteRun,
                    record.correlation_id.clone(),
                    stage,
                    Some(visit.last_message_id.clone()),
                    format!("last seen at {stage} as {}", visit.status),
                ))
            })
            .collect();
        incomplete.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        incomplete
    }

    pub fn record(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        self.records.get(correlation_id).map(|r| r.value().clone())
    }

    /// Ordered copy of every record.
    pub fn snapshot(&self) -> BTreeMap<String, CorrelationRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> TrackerSummary {
        let mut summary = TrackerSummary::default();
        for entry in self.records.iter() {
            let record = entry.value();
            summary.runs += 1;
            if record.is_finished() {
                summary.finished += 1;
            }
            for (stage, visit) in &record.stages {
                let counts = summary.per_stage.entry(*stage).or_default();
                match visit.status {
                    MessageStatus::Pending => counts.pending += 1,
                    MessageStatus::Processing => counts.processing += 1,
                    MessageStatus::Completed => counts.completed += 1,
                    MessageStatus::Failed => counts.failed += 1,
                }
            }
        }
        summary
    }
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new(Duration::seconds(300))
    }
}

fn new_visit(obs: &Observation) -> StageVisit {
    StageVisit {
        arrived_at: obs.timestamp,
        last_seen_at: obs.timestamp,
        status: obs.status,
        first_message_id: obs.message_id.clone(),
        last_message_id: obs.message_id.clone(),
        messages: BTreeMap::from([(obs.message_id.clone(), BTreeSet::from([obs.status]))]),
    }
}

/// Move a stage status forward; never back.
fn advance(current: &mut MessageStatus, next: MessageStatus) {
    if next.rank() > current.rank() {
        *current = next;
    }
}

fn finding(kind: FindingKind, obs: &Observation, detail: String) -> IntegrityFinding {
    IntegrityFinding::new(
        kind,
        obs.correlation_id.clone(),
        obs.stage,
        Some(obs.message_id.clone()),
        detail,
    )
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
