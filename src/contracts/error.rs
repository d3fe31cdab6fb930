//! Fatal error types for the contract engine.
//!
//! Per-message schema and integrity problems are never raised through this
//! type. They are collected as `Violation`s and `IntegrityFinding`s so a single
//! call surfaces every problem at once. `ContractError` is reserved for the
//! conditions that stop processing of a message or indicate a wiring bug.

use thiserror::Error;

use crate::models::enums::MessageStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    /// Unknown stage, unknown schema or unusable configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Status state-machine violation. The message must be quarantined.
    #[error("Illegal status transition {from} -> {to} for message {message_id}")]
    IllegalTransition {
        message_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// A wire string that does not belong to a closed enum domain.
    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    /// A message entered `failed` without an `error` metadata entry.
    #[error("Message {0} is failed but carries no error metadata")]
    MissingErrorMetadata(String),

    /// Append-only metadata would lose or overwrite an existing key.
    #[error("Metadata key `{0}` already exists and cannot be replaced")]
    MetadataOverwrite(String),

    /// The message could not be decoded into the typed model.
    #[error("Message decoding error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for ContractError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
