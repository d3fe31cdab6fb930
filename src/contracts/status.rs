//! Status state machine and failure propagation.
//!
//! Legal transitions: `pending -> processing -> completed | failed`. A stage
//! that fails does not drop the message. It attaches `metadata.error` and the
//! failed message keeps flowing, so downstream stages pass it through
//! unprocessed and the final consumer still sees the whole run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ContractError;
use crate::models::enums::{MessageStatus, Stage};
use crate::models::message::{new_message_id, ErrorInfo, PipelineMessage, ERROR_KEY};

/// What a stage should do with a message it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Upstream completed: run the stage.
    Process,
    /// Upstream failed: forward unprocessed, failure metadata intact.
    PassThrough,
    /// Unfinalized or malformed failure: set aside for manual review.
    Quarantine,
}

/// Move a message to `to`, refusing anything outside the state machine.
pub fn transition(message: &mut PipelineMessage, to: MessageStatus) -> Result<(), ContractError> {
    ensure_transition(message, to)?;
    tracing::debug!(
        correlation_id = %message.correlation_id,
        message_id = %message.message_id,
        from = %message.status,
        to = %to,
        "Status transition"
    );
    message.status = to;
    Ok(())
}

fn ensure_transition(message: &PipelineMessage, to: MessageStatus) -> Result<(), ContractError> {
    if message.status.can_transition_to(to) {
        Ok(())
    } else {
        tracing::error!(
            correlation_id = %message.correlation_id,
            message_id = %message.message_id,
            from = %message.status,
            to = %to,
            "Illegal status transition"
        );
        Err(ContractError::IllegalTransition {
            message_id: message.message_id.clone(),
            from: message.status,
            to,
        })
    }
}

/// Mark a processing message as failed and record why.
///
/// Nothing is changed if either the transition or the metadata append is
/// refused.
pub fn fail(message: &mut PipelineMessage, error: ErrorInfo) -> Result<(), ContractError> {
    ensure_transition(message, MessageStatus::Failed)?;
    let value = serde_json::to_value(&error)?;
    message.metadata.append(ERROR_KEY, value)?;
    message.status = MessageStatus::Failed;

    tracing::warn!(
        correlation_id = %message.correlation_id,
        message_id = %message.message_id,
        stage = error.stage.map(|s| s.as_str()).unwrap_or("unknown"),
        error_kind = %error.kind,
        "Message failed: {}",
        error.description
    );
    Ok(())
}

pub fn disposition(message: &PipelineMessage) -> Disposition {
    match message.status {
        MessageStatus::Completed => Disposition::Process,
        MessageStatus::Failed if message.metadata.error().is_some() => Disposition::PassThrough,
        MessageStatus::Failed | MessageStatus::Pending | MessageStatus::Processing => {
            Disposition::Quarantine
        }
    }
}

/// Build the message a stage forwards when it skips a failed upstream message.
///
/// Fresh message id, same correlation id and metadata, no payload, still
/// `failed`.
pub fn pass_through(
    upstream: &PipelineMessage,
    stage: Stage,
    now: DateTime<Utc>,
) -> Result<PipelineMessage, ContractError> {
    if upstream.status != MessageStatus::Failed {
        return Err(ContractError::IllegalTransition {
            message_id: upstream.message_id.clone(),
            from: upstream.status,
            to: MessageStatus::Failed,
        });
    }
    if upstream.metadata.error().is_none() {
        return Err(ContractError::MissingErrorMetadata(upstream.message_id.clone()));
    }

    let mut forwarded = upstream.clone();
    forwarded.message_id = new_message_id();
    forwarded.timestamp = now.max(upstream.timestamp);
    forwarded.clear_payload();

    tracing::info!(
        correlation_id = %forwarded.correlation_id,
        message_id = %forwarded.message_id,
        upstream_message_id = %upstream.message_id,
        stage = %stage,
        "Passing failed message through"
    );
    Ok(forwarded)
}

/// Envelope for the next stage's work on the same document.
pub fn derive_next(upstream: &PipelineMessage, now: DateTime<Utc>) -> PipelineMessage {
    let mut next = PipelineMessage::new(
        upstream.correlation_id.clone(),
        upstream.metadata.clone(),
        now.max(upstream.timestamp),
    );
    next.status = MessageStatus::Pending;
    next
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
