//! Payload invariants that generic schema validation cannot express.
//!
//! Chunk contiguity, append-only metadata, text-length preservation and
//! message lineage between an upstream message and the one derived from it.

use serde_json::{Map, Value};

use super::types::{Violation, ViolationKind};
use crate::config::EngineConfig;
use crate::models::message::{format_timestamp, Chunk, Metadata, PipelineMessage};

/// Tolerances applied to adjacent chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTolerance {
    pub max_gap: usize,
    pub max_overlap: usize,
}

impl Default for ChunkTolerance {
    fn default() -> Self {
        Self {
            max_gap: 2,
            max_overlap: 0,
        }
    }
}

/// Stateless checker parameterized by the engine tolerances.
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    chunk_tolerance: ChunkTolerance,
    length_tolerance: f64,
}

impl IntegrityChecker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunk_tolerance: ChunkTolerance {
                max_gap: config.chunk_max_gap,
                max_overlap: config.chunk_max_overlap,
            },
            length_tolerance: config.length_tolerance,
        }
    }

    pub fn chunk_tolerance(&self) -> ChunkTolerance {
        self.chunk_tolerance
    }

    pub fn check_chunks(&self, chunks: &[Chunk], declared_count: Option<usize>) -> Vec<Violation> {
        check_chunks(chunks, declared_count, self.chunk_tolerance)
    }

    pub fn check_chunk_coverage(&self, chunks: &[Chunk], text_len: usize) -> Vec<Violation> {
        check_chunk_coverage(chunks, text_len, self.chunk_tolerance)
    }

    pub fn check_text_bounds(&self, original_length: usize, cleaned_length: usize) -> Vec<Violation> {
        check_text_bounds(original_length, cleaned_length, self.length_tolerance)
    }
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

// ═══════════════════════════════════════════
// Chunks
// ═══════════════════════════════════════════

/// Chunks in publication order must be sorted, self-consistent and contiguous.
pub fn check_chunks(chunks: &[Chunk], declared_count: Option<usize>, tolerance: ChunkTolerance) -> Vec<Violation> {
    let mut out = Vec::new();

    if let Some(declared) = declared_count {
        if declared != chunks.len() {
            out.push(Violation::new(
                "chunk_count",
                ViolationKind::ChunkCountMismatch,
                format!("chunk_count is {declared} but {} chunks were sent", chunks.len()),
            ));
        }
    }

    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.end_pos < chunk.start_pos {
            out.push(Violation::new(
                format!("chunks[{i}]"),
                ViolationKind::ChunkSpan,
                format!("end_pos {} precedes start_pos {}", chunk.end_pos, chunk.start_pos),
            ));
        } else if chunk.end_pos - chunk.start_pos != chunk.char_count {
            out.push(Violation::new(
                format!("chunks[{i}].char_count"),
                ViolationKind::ChunkSpan,
                format!(
                    "span {}..{} covers {} characters but char_count is {}",
                    chunk.start_pos,
                    chunk.end_pos,
                    chunk.end_pos - chunk.start_pos,
                    chunk.char_count
                ),
            ));
        }
    }

    for (i, pair) in chunks.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        let path = format!("chunks[{}]", i + 1);
        if next.start_pos < prev.start_pos {
            out.push(Violation::new(
                path,
                ViolationKind::ChunkOrder,
                format!("start_pos {} is before previous start_pos {}", next.start_pos, prev.start_pos),
            ));
            continue;
        }
        if next.start_pos < prev.end_pos {
            let overlap = prev.end_pos - next.start_pos;
            if overlap > tolerance.max_overlap {
                out.push(Violation::new(
                    path,
                    ViolationKind::ChunkOverlap,
                    format!(
                        "overlaps previous chunk by {overlap} characters ({}..{} vs {}..{})",
                        prev.start_pos, prev.end_pos, next.start_pos, next.end_pos
                    ),
                ));
            }
        } else {
            let gap = next.start_pos - prev.end_pos;
            if gap > tolerance.max_gap {
                out.push(Violation::new(
                    path,
                    ViolationKind::ChunkGap,
                    format!("leaves a gap of {gap} characters after the previous chunk"),
                ));
            }
        }
    }

    out
}

/// The chunk spans must reach both ends of the text, within the gap tolerance.
pub fn check_chunk_coverage(chunks: &[Chunk], text_len: usize, tolerance: ChunkTolerance) -> Vec<Violation> {
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        if text_len > tolerance.max_gap {
            return vec![Violation::new(
                "chunks",
                ViolationKind::IncompleteCoverage,
                format!("no chunks cover a text of {text_len} characters"),
            )];
        }
        return Vec::new();
    };

    let mut out = Vec::new();
    if first.start_pos > tolerance.max_gap {
        out.push(Violation::new(
            "chunks[0].start_pos",
            ViolationKind::IncompleteCoverage,
            format!("first chunk starts at {}, leaving the text head uncovered", first.start_pos),
        ));
    }
    let end = chunks.iter().map(|c| c.end_pos).max().unwrap_or(last.end_pos);
    if end > text_len {
        out.push(Violation::new(
            format!("chunks[{}].end_pos", chunks.len() - 1),
            ViolationKind::IncompleteCoverage,
            format!("chunks extend to {end}, past the text length {text_len}"),
        ));
    } else if text_len - end > tolerance.max_gap {
        out.push(Violation::new(
            format!("chunks[{}].end_pos", chunks.len() - 1),
            ViolationKind::IncompleteCoverage,
            format!("chunks stop at {end}, leaving {} trailing characters", text_len - end),
        ));
    }
    out
}

// ═══════════════════════════════════════════
// Metadata
// ═══════════════════════════════════════════

/// Every upstream key must survive with an identical value. New keys are fine.
///
/// Comparison is exact: strings are compared byte for byte, no Unicode
/// normalization or case folding.
pub fn check_metadata_preserved(upstream: &Map<String, Value>, downstream: &Map<String, Value>) -> Vec<Violation> {
    let mut out = Vec::new();
    for (key, before) in upstream {
        let path = format!("metadata.{key}");
        match downstream.get(key) {
            None => out.push(Violation::new(
                path,
                ViolationKind::MetadataRemoved,
                "key present upstream was dropped",
            )),
            Some(after) if after != before => out.push(Violation::new(
                path,
                ViolationKind::MetadataMutated,
                format!("value changed from {before} to {after}"),
            )),
            Some(_) => {}
        }
    }
    out
}

/// Typed convenience over `check_metadata_preserved`.
pub fn check_typed_metadata_preserved(upstream: &Metadata, downstream: &Metadata) -> Vec<Violation> {
    check_metadata_preserved(&upstream.to_map(), &downstream.to_map())
}

// ═══════════════════════════════════════════
// Text length
// ═══════════════════════════════════════════

/// `cleaned_length` must lie within `original_length × (1 ± tolerance)`.
pub fn check_text_bounds(original_length: usize, cleaned_length: usize, tolerance: f64) -> Vec<Violation> {
    if !(0.0..1.0).contains(&tolerance) {
        return vec![Violation::new(
            "tolerance",
            ViolationKind::InvalidTolerance,
            format!("tolerance must be in [0, 1), got {tolerance}"),
        )];
    }

    let original = original_length as f64;
    let cleaned = cleaned_length as f64;
    let lower = original * (1.0 - tolerance);
    let upper = original * (1.0 + tolerance);
    if cleaned < lower || cleaned > upper {
        let reason = if cleaned < lower {
            format!("cleaned text has {cleaned_length} characters, below {lower:.0} allowed for {original_length}; possible truncation")
        } else {
            format!("cleaned text has {cleaned_length} characters, above {upper:.0} allowed for {original_length}")
        };
        return vec![Violation::new("preprocessed_text", ViolationKind::LengthOutOfBounds, reason)];
    }
    Vec::new()
}

// ═══════════════════════════════════════════
// Lineage
// ═══════════════════════════════════════════

/// `downstream` must belong to the same run as `upstream`, under a fresh message id.
pub fn check_lineage(upstream: &PipelineMessage, downstream: &PipelineMessage) -> Vec<Violation> {
    let mut out = Vec::new();
    if upstream.correlation_id != downstream.correlation_id {
        out.push(Violation::new(
            "correlation_id",
            ViolationKind::CorrelationDrift,
            format!(
                "correlation_id changed from `{}` to `{}`",
                upstream.correlation_id, downstream.correlation_id
            ),
        ));
    }
    if upstream.message_id == downstream.message_id {
        out.push(Violation::new(
            "message_id",
            ViolationKind::ReusedMessageId,
            format!("message_id `{}` was carried forward instead of regenerated", downstream.message_id),
        ));
    }
    if downstream.timestamp < upstream.timestamp {
        out.push(Violation::new(
            "timestamp",
            ViolationKind::TimestampRegression,
            format!(
                "timestamp {} is earlier than upstream {}",
                format_timestamp(&downstream.timestamp),
                format_timestamp(&upstream.timestamp)
            ),
        ));
    }
    out.extend(check_typed_metadata_preserved(&upstream.metadata, &downstream.metadata));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn span(id: &str, start: usize, end: usize) -> Chunk {
        Chunk {
            chunk_id: id.into(),
            text: "x".repeat(end.saturating_sub(start)),
            start_pos: start,
            end_pos: end,
            word_count: 1,
            char_count: end.saturating_sub(start),
        }
    }

    fn kinds(violations: &[Violation]) -> Vec<ViolationKind> {
        violations.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn contiguous_chunks_pass() {
        let chunks = vec![span("c0", 0, 32), span("c1", 32, 64)];
        assert!(check_chunks(&chunks, Some(2), ChunkTolerance::default()).is_empty());
    }

    #[test]
    fn overlapping_chunks_fail() {
        let chunks = vec![span("c0", 0, 32), span("c1", 20, 50)];
        let violations = check_chunks(&chunks, None, ChunkTolerance::default());
        assert_eq!(kinds(&violations), vec![ViolationKind::ChunkOverlap]);
        assert_eq!(violations[0].path, "chunks[1]");
    }

    #[test]
    fn small_gap_tolerated_large_gap_flagged() {
        let tolerance = ChunkTolerance::default();
        let ok = vec![span("c0", 0, 10), span("c1", 12, 20)];
        assert!(check_chunks(&ok, None, tolerance).is_empty());

        let gappy = vec![span("c0", 0, 10), span("c1", 15, 20)];
        assert_eq!(kinds(&check_chunks(&gappy, None, tolerance)), vec![ViolationKind::ChunkGap]);
    }

    #[test]
    fn char_count_must_match_span() {
        let mut chunk = span("c0", 0, 10);
        chunk.char_count = 9;
        let violations = check_chunks(&[chunk], None, ChunkTolerance::default());
        assert_eq!(violations[0].path, "chunks[0].char_count");
        assert_eq!(violations[0].kind, ViolationKind::ChunkSpan);
    }

    #[test]
    fn order_and_count_checked() {
        let chunks = vec![span("c0", 10, 20), span("c1", 0, 10)];
        let violations = check_chunks(&chunks, Some(3), ChunkTolerance::default());
        assert_eq!(
            kinds(&violations),
            vec![ViolationKind::ChunkCountMismatch, ViolationKind::ChunkOrder]
        );
    }

    #[test]
    fn coverage_reaches_both_ends() {
        let tolerance = ChunkTolerance::default();
        let chunks = vec![span("c0", 0, 32), span("c1", 32, 64)];
        assert!(check_chunk_coverage(&chunks, 64, tolerance).is_empty());
        assert!(check_chunk_coverage(&chunks, 66, tolerance).is_empty());
        assert_eq!(check_chunk_coverage(&chunks, 80, tolerance).len(), 1);
        assert_eq!(check_chunk_coverage(&chunks, 50, tolerance).len(), 1);
        assert_eq!(check_chunk_coverage(&[], 10, tolerance).len(), 1);
        assert!(check_chunk_coverage(&[], 0, tolerance).is_empty());
    }

    #[test]
    fn metadata_keys_cannot_change_or_disappear() {
        let upstream = json!({"patient_id": "TEST001", "document_id": "DOC001", "source": "ehr"});
        let downstream = json!({"patient_id": "test001", "document_id": "DOC001", "word_count": 10});
        let violations = check_metadata_preserved(
            upstream.as_object().unwrap(),
            downstream.as_object().unwrap(),
        );
        assert_eq!(
            kinds(&violations),
            vec![ViolationKind::MetadataMutated, ViolationKind::MetadataRemoved]
        );
    }

    #[test]
    fn unicode_ids_compared_without_normalization() {
        // "é" precomposed vs "e" + combining acute.
        let upstream = Metadata::new("PAT-\u{e9}", "DOC/\u{1F600}");
        let downstream = Metadata::new("PAT-e\u{301}", "DOC/\u{1F600}");
        let violations = check_typed_metadata_preserved(&upstream, &downstream);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "metadata.patient_id");
    }

    #[test]
    fn text_bounds_within_five_percent() {
        assert!(check_text_bounds(1000, 960, 0.05).is_empty());
        assert!(check_text_bounds(1000, 1050, 0.05).is_empty());
        assert_eq!(
            kinds(&check_text_bounds(1000, 900, 0.05)),
            vec![ViolationKind::LengthOutOfBounds]
        );
        assert_eq!(check_text_bounds(1000, 1100, 0.05).len(), 1);
        assert!(check_text_bounds(0, 0, 0.05).is_empty());
        assert_eq!(
            kinds(&check_text_bounds(10, 10, 1.5)),
            vec![ViolationKind::InvalidTolerance]
        );
    }

    #[test]
    fn lineage_requires_same_run_and_fresh_id() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let upstream = PipelineMessage::new("corr-001", Metadata::new("TEST001", "DOC001"), now);

        let mut good = PipelineMessage::new("corr-001", upstream.metadata.clone(), now + Duration::seconds(1));
        good.metadata.append("chunk_total", json!(2)).unwrap();
        assert!(check_lineage(&upstream, &good).is_empty());

        let mut bad = upstream.clone();
        bad.correlation_id = "corr-999".into();
        bad.timestamp = now - Duration::seconds(5);
        assert_eq!(
            kinds(&check_lineage(&upstream, &bad)),
            vec![
                ViolationKind::CorrelationDrift,
                ViolationKind::ReusedMessageId,
                ViolationKind::TimestampRegression
            ]
        );
    }

    proptest! {
        #[test]
        fn forwarded_metadata_is_byte_identical(patient in "\\PC{1,40}", document in "\\PC{1,40}", extra in "\\PC{0,20}") {
            let upstream = Metadata::new(patient.clone(), document.clone());
            let mut downstream = upstream.clone();
            downstream.append("stage_note", json!(extra)).unwrap();
            prop_assert!(check_typed_metadata_preserved(&upstream, &downstream).is_empty());
            prop_assert_eq!(downstream.patient_id.as_bytes(), patient.as_bytes());
            prop_assert_eq!(downstream.document_id.as_bytes(), document.as_bytes());
        }

        #[test]
        fn any_altered_id_is_detected(patient in "\\PC{1,40}", suffix in "\\PC{1,4}") {
            let upstream = Metadata::new(patient.clone(), "DOC001");
            let downstream = Metadata::new(format!("{patient}{suffix}"), "DOC001");
            let violations = check_typed_metadata_preserved(&upstream, &downstream);
            prop_assert_eq!(violations.len(), 1);
            prop_assert_eq!(violations[0].kind, ViolationKind::MetadataMutated);
        }

        #[test]
        fn partitions_cover_text(len in 1usize..2000, cuts in proptest::collection::vec(1usize..2000, 0..20)) {
            let mut bounds: Vec<usize> = cuts.into_iter().filter(|c| *c < len).collect();
            bounds.push(0);
            bounds.push(len);
            bounds.sort_unstable();
            bounds.dedup();
            let chunks: Vec<Chunk> = bounds
                .windows(2)
                .enumerate()
                .map(|(i, w)| span(&format!("c{i}"), w[0], w[1]))
                .collect();
            let tolerance = ChunkTolerance::default();
            prop_assert!(check_chunks(&chunks, Some(chunks.len()), tolerance).is_empty());
            prop_assert!(check_chunk_coverage(&chunks, len, tolerance).is_empty());
        }
    }
}
