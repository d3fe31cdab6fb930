//! Stage collaborators for simulated runs.
//!
//! The real stages (text cleaning, chunking, NER, vocabulary lookup) are black
//! boxes to the contract engine. `StageHandler` is the seam they plug into;
//! the stubs here produce payloads that are contract-valid by construction so
//! end-to-end tests exercise the boundaries rather than the algorithms.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::contracts::ContractError;
use crate::models::enums::{Domain, MatchType, Stage};
use crate::models::message::{Chunk, ConceptRef, ExtractedTerm, PipelineMessage, StandardizedTerm};

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").expect("valid regex"));

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Input field `{0}` is missing")]
    MissingInput(&'static str),

    #[error("Nothing to process: {0}")]
    EmptyInput(String),

    #[error("Stage rejected input: {0}")]
    Rejected(String),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),
}

impl HandlerError {
    /// Short machine-readable kind recorded under `metadata.error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "missing_input",
            Self::EmptyInput(_) => "empty_input",
            Self::Rejected(_) => "rejected",
            Self::Contract(_) => "contract",
        }
    }
}

/// One pipeline stage's business logic.
///
/// `output` arrives as a `processing` envelope derived from `input`; the
/// handler fills in the stage payload and may append metadata. Status is
/// managed by the caller.
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    fn process(&self, input: &PipelineMessage, output: &mut PipelineMessage) -> Result<(), HandlerError>;
}

// ═══════════════════════════════════════════
// Preprocessing
// ═══════════════════════════════════════════

/// Collapses whitespace runs and trims the document.
#[derive(Debug, Clone, Default)]
pub struct WhitespacePreprocessor;

impl StageHandler for WhitespacePreprocessor {
    fn stage(&self) -> Stage {
        Stage::Preprocessing
    }

    fn process(&self, input: &PipelineMessage, output: &mut PipelineMessage) -> Result<(), HandlerError> {
        let raw = input.raw_text.as_deref().ok_or(HandlerError::MissingInput("raw_text"))?;
        let cleaned = WHITESPACE_RUN.replace_all(raw.trim(), " ").into_owned();
        if cleaned.is_empty() {
            return Err(HandlerError::EmptyInput("document has no text".into()));
        }

        output
            .metadata
            .append("original_length", Value::from(raw.chars().count()))?;
        output
            .metadata
            .append("cleaned_length", Value::from(cleaned.chars().count()))?;
        output.preprocessed_text = Some(cleaned);
        Ok(())
    }
}

// ═══════════════════════════════════════════
// Chunking
// ═══════════════════════════════════════════

/// Packs whole words into chunks of at most `window` characters.
///
/// Chunks are separated by the single space between words, which stays
/// inside the default gap tolerance.
#[derive(Debug, Clone)]
pub struct WindowChunker {
    pub window: usize,
}

impl Default for WindowChunker {
    fn default() -> Self {
        Self { window: 64 }
    }
}

impl WindowChunker {
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut push = |start: usize, end: usize| {
            let id = format!("chunk_{:03}", chunks.len());
            let offset = text[..start].chars().count();
            chunks.push(Chunk::from_span(id, &text[start..end], offset));
        };

        // Byte range of the chunk being filled.
        let mut open: Option<(usize, usize)> = None;
        for word in WORD.find_iter(text) {
            open = match open {
                Some((start, _)) if text[start..word.end()].chars().count() <= self.window => {
                    Some((start, word.end()))
                }
                Some((start, end)) => {
                    push(start, end);
                    Some((word.start(), word.end()))
                }
                None => Some((word.start(), word.end())),
            };
        }
        if let Some((start, end)) = open {
            push(start, end);
        }
        chunks
    }
}

impl StageHandler for WindowChunker {
    fn stage(&self) -> Stage {
        Stage::Chunking
    }

    fn process(&self, input: &PipelineMessage, output: &mut PipelineMessage) -> Result<(), HandlerError> {
        if self.window == 0 {
            return Err(HandlerError::Rejected("chunk window must be positive".into()));
        }
        let text = input
            .preprocessed_text
            .as_deref()
            .ok_or(HandlerError::MissingInput("preprocessed_text"))?;
        let chunks = self.chunk(text);
        if chunks.is_empty() {
            return Err(HandlerError::EmptyInput("preprocessed text has no words".into()));
        }
        output.set_chunks(chunks);
        Ok(())
    }
}

// ═══════════════════════════════════════════
// Entity extraction
// ═══════════════════════════════════════════

/// Case-insensitive phrase lookup over chunk text.
#[derive(Debug, Clone)]
pub struct LexiconExtractor {
    lexicon: Vec<(String, Domain)>,
}

impl LexiconExtractor {
    pub fn new(entries: impl IntoIterator<Item = (impl Into<String>, Domain)>) -> Self {
        Self {
            lexicon: entries
                .into_iter()
                .map(|(term, domain)| (term.into().to_lowercase(), domain))
                .collect(),
        }
    }
}

impl Default for LexiconExtractor {
    fn default() -> Self {
        Self::new([
            ("chest pain", Domain::Condition),
            ("hypertension", Domain::Condition),
            ("aspirin", Domain::Drug),
            ("troponin", Domain::Measurement),
            ("electrocardiogram", Domain::Procedure),
        ])
    }
}

impl StageHandler for LexiconExtractor {
    fn stage(&self) -> Stage {
        Stage::EntityExtraction
    }

    fn process(&self, input: &PipelineMessage, output: &mut PipelineMessage) -> Result<(), HandlerError> {
        let chunks = input.chunks.as_deref().ok_or(HandlerError::MissingInput("chunks"))?;

        let mut terms: Vec<ExtractedTerm> = Vec::new();
        for chunk in chunks {
            let lowered = chunk.text.to_lowercase();
            for (phrase, domain) in &self.lexicon {
                let seen = terms.iter().any(|t| t.term == *phrase);
                if !seen && lowered.contains(phrase.as_str()) {
                    terms.push(ExtractedTerm {
                        term: phrase.clone(),
                        domain: *domain,
                        entity_id: format!("ent_{:03}", terms.len()),
                    });
                }
            }
        }

        tracing::debug!(
            correlation_id = %input.correlation_id,
            terms = terms.len(),
            "Lexicon extraction finished"
        );
        output.terms = Some(terms);
        Ok(())
    }
}

// ═══════════════════════════════════════════
// Standardization
// ═══════════════════════════════════════════

/// Maps extracted terms to standard concepts from a fixed table.
#[derive(Debug, Clone)]
pub struct LexiconStandardizer {
    concepts: HashMap<String, ConceptRef>,
}

impl LexiconStandardizer {
    pub fn new(entries: impl IntoIterator<Item = (impl Into<String>, ConceptRef)>) -> Self {
        Self {
            concepts: entries
                .into_iter()
                .map(|(term, concept)| (term.into().to_lowercase(), concept))
                .collect(),
        }
    }
}

fn concept(id: i64, name: &str, vocabulary: &str) -> ConceptRef {
    ConceptRef {
        concept_id: id,
        concept_name: name.to_string(),
        vocabulary_id: Some(vocabulary.to_string()),
    }
}

impl Default for LexiconStandardizer {
    fn default() -> Self {
        Self::new([
            ("chest pain", concept(77670, "Chest pain", "SNOMED")),
            ("hypertension", concept(320128, "Essential hypertension", "SNOMED")),
            ("aspirin", concept(1112807, "aspirin", "RxNorm")),
        ])
    }
}

impl StageHandler for LexiconStandardizer {
    fn stage(&self) -> Stage {
        Stage::Standardization
    }

    fn process(&self, input: &PipelineMessage, output: &mut PipelineMessage) -> Result<(), HandlerError> {
        // No terms is a finished document with nothing to map.
        let terms = input.terms.as_deref().ok_or(HandlerError::MissingInput("terms"))?;
        let results = terms
            .iter()
            .map(|term| {
                let matches: Vec<ConceptRef> =
                    self.concepts.get(&term.term.to_lowercase()).cloned().into_iter().collect();
                StandardizedTerm {
                    original_term: term.term.clone(),
                    domain: term.domain,
                    entity_id: term.entity_id.clone(),
                    match_type: if matches.is_empty() {
                        MatchType::NoMatch
                    } else {
                        MatchType::Direct
                    },
                    matches,
                }
            })
            .collect();
        output.results = Some(results);
        Ok(())
    }
}
