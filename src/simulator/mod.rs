//! In-process pipeline run over tokio channels.
//!
//! Four stage tasks connected by bounded `mpsc` channels stand in for the
//! message broker. Messages travel between tasks as JSON values, the same
//! form they take on a real queue, and every hop goes through the engine's
//! inbound and outbound checks. Rejected and quarantined messages are
//! collected instead of being forwarded.

pub mod handlers;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::contracts::engine::{BoundaryReport, ContractEngine, Verdict};
use crate::contracts::status::{derive_next, fail, pass_through, transition};
use crate::contracts::ContractError;
use crate::models::enums::{MessageStatus, Stage};
use crate::models::message::{ErrorInfo, PipelineMessage};

pub use handlers::{
    HandlerError, LexiconExtractor, LexiconStandardizer, StageHandler, WhitespacePreprocessor,
    WindowChunker,
};

/// Queue depth between two stages.
const CHANNEL_CAPACITY: usize = 32;

/// What came out the far end of a simulated run.
#[derive(Debug, Default)]
pub struct SimulationOutcome {
    /// Messages published by the final stage, completed or failed.
    pub delivered: Vec<PipelineMessage>,
    pub quarantined: Vec<BoundaryReport>,
    pub rejected: Vec<BoundaryReport>,
    /// Wiring errors raised while building a stage output.
    pub errors: Vec<(Stage, ContractError)>,
}

impl SimulationOutcome {
    pub fn delivered_for(&self, correlation_id: &str) -> Option<&PipelineMessage> {
        self.delivered.iter().find(|m| m.correlation_id == correlation_id)
    }
}

enum Event {
    Quarantined(BoundaryReport),
    Rejected(BoundaryReport),
    Error(Stage, ContractError),
}

impl Event {
    fn label(&self) -> &'static str {
        match self {
            Self::Quarantined(_) => "quarantined",
            Self::Rejected(_) => "rejected",
            Self::Error(..) => "error",
        }
    }

    fn correlation_id(&self) -> &str {
        match self {
            Self::Quarantined(report) | Self::Rejected(report) => report.correlation_id.as_deref().unwrap_or(""),
            Self::Error(..) => "",
        }
    }
}

/// Hand an event to the collector. Returns `false` once the collector is gone.
fn emit(events: &mpsc::UnboundedSender<Event>, stage: Stage, event: Event) -> bool {
    match events.send(event) {
        Ok(()) => true,
        Err(mpsc::error::SendError(event)) => {
            tracing::debug!(
                stage = %stage,
                correlation_id = event.correlation_id(),
                event = event.label(),
                "Event collector closed, report dropped"
            );
            false
        }
    }
}

pub struct PipelineSimulator {
    engine: Arc<ContractEngine>,
    handlers: Vec<Arc<dyn StageHandler>>,
}

impl PipelineSimulator {
    /// Simulator using the stub handler for every stage.
    pub fn new(engine: Arc<ContractEngine>) -> Self {
        Self {
            engine,
            handlers: vec![
                Arc::new(WhitespacePreprocessor),
                Arc::new(WindowChunker::default()),
                Arc::new(LexiconExtractor::default()),
                Arc::new(LexiconStandardizer::default()),
            ],
        }
    }

    /// One handler per stage, in pipeline order.
    pub fn with_handlers(
        engine: Arc<ContractEngine>,
        handlers: Vec<Arc<dyn StageHandler>>,
    ) -> Result<Self, ContractError> {
        let stages: Vec<Stage> = handlers.iter().map(|h| h.stage()).collect();
        if stages != Stage::all() {
            return Err(ContractError::Configuration(format!(
                "expected one handler per stage in order, got {stages:?}"
            )));
        }
        Ok(Self { engine, handlers })
    }

    pub fn engine(&self) -> &Arc<ContractEngine> {
        &self.engine
    }

    /// Push `documents` through all four stages and wait for the pipeline to drain.
    pub async fn run(&self, documents: Vec<PipelineMessage>) -> SimulationOutcome {
        let mut outcome = SimulationOutcome::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let (source_tx, mut upstream_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let (tx, rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
            tasks.push(tokio::spawn(stage_loop(
                Arc::clone(&self.engine),
                Arc::clone(handler),
                upstream_rx,
                tx,
                events_tx.clone(),
            )));
            upstream_rx = rx;
        }
        drop(events_tx);

        let feeder = tokio::spawn(async move {
            for doc in documents {
                match doc.to_value() {
                    Ok(value) => {
                        if source_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::error!(
                        correlation_id = %doc.correlation_id,
                        message_id = %doc.message_id,
                        error = %err,
                        "Could not encode source document"
                    ),
                }
            }
        });

        let mut sink = upstream_rx;
        while let Some(value) = sink.recv().await {
            match PipelineMessage::from_value(&value) {
                Ok(msg) => outcome.delivered.push(msg),
                Err(err) => outcome.errors.push((Stage::Standardization, err)),
            }
        }

        for task in std::iter::once(feeder).chain(tasks) {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Simulator task ended abnormally");
            }
        }

        while let Some(event) = events_rx.recv().await {
            match event {
                Event::Quarantined(report) => outcome.quarantined.push(report),
                Event::Rejected(report) => outcome.rejected.push(report),
                Event::Error(stage, err) => outcome.errors.push((stage, err)),
            }
        }

        tracing::info!(
            delivered = outcome.delivered.len(),
            quarantined = outcome.quarantined.len(),
            rejected = outcome.rejected.len(),
            "Simulated run drained"
        );
        outcome
    }
}

async fn stage_loop(
    engine: Arc<ContractEngine>,
    handler: Arc<dyn StageHandler>,
    mut rx: mpsc::Receiver<Value>,
    tx: mpsc::Sender<Value>,
    events: mpsc::UnboundedSender<Event>,
) {
    let stage = handler.stage();
    while let Some(value) = rx.recv().await {
        let inbound = engine.check_inbound(stage, &value);
        let input = match (inbound.verdict, inbound.message.clone()) {
            (Verdict::Forward | Verdict::PassThrough, Some(msg)) => msg,
            (Verdict::Reject, _) => {
                emit(&events, stage, Event::Rejected(inbound));
                continue;
            }
            _ => {
                emit(&events, stage, Event::Quarantined(inbound));
                continue;
            }
        };

        let built = if inbound.verdict == Verdict::PassThrough {
            pass_through(&input, stage, engine.now())
        } else {
            run_handler(&engine, handler.as_ref(), &input)
        };
        let output = match built.and_then(|msg| msg.to_value()) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(
                    correlation_id = %input.correlation_id,
                    message_id = %input.message_id,
                    stage = %stage,
                    error = %err,
                    "Could not build stage output"
                );
                emit(&events, stage, Event::Error(stage, err));
                continue;
            }
        };

        let outbound = engine.check_outbound(stage, &output, Some(&input));
        match outbound.verdict {
            Verdict::Forward | Verdict::PassThrough => {
                if tx.send(output).await.is_err() {
                    break;
                }
            }
            Verdict::Reject => {
                emit(&events, stage, Event::Rejected(outbound));
            }
            Verdict::Quarantine => {
                emit(&events, stage, Event::Quarantined(outbound));
            }
        }
    }
    tracing::debug!(stage = %stage, "Stage input closed");
}

/// Derive the stage output and drive it through the status lifecycle.
fn run_handler(
    engine: &ContractEngine,
    handler: &dyn StageHandler,
    input: &PipelineMessage,
) -> Result<PipelineMessage, ContractError> {
    let stage = handler.stage();
    let mut output = derive_next(input, engine.now());
    transition(&mut output, MessageStatus::Processing)?;

    match handler.process(input, &mut output) {
        Ok(()) => transition(&mut output, MessageStatus::Completed)?,
        Err(err) => {
            output.clear_payload();
            fail(&mut output, ErrorInfo::new(err.kind(), err.to_string()).at_stage(stage))?;
        }
    }
    Ok(output)
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
