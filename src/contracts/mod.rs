//! Contract and integrity checks for messages crossing stage boundaries.

pub mod clock;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod schema;
pub mod status;
pub mod tracker;
pub mod types;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{BoundaryReport, ContractEngine, Direction, Verdict};
pub use error::ContractError;
pub use integrity::{ChunkTolerance, IntegrityChecker};
pub use schema::{Schema, SchemaRegistry};
pub use status::Disposition;
pub use tracker::{CorrelationRecord, CorrelationTracker, Observation, TrackerSummary, TrackingOutcome};
pub use types::{FindingKind, IntegrityFinding, Severity, ValidationResult, Violation, ViolationKind};
pub use validator::{validate, validate_at, TimeBound};
