//! Engine configuration.
//!
//! Defaults are usable as-is. Every value can be overridden from the
//! environment with an `OMOP_CONTRACTS_*` variable, which is how the four
//! services tune tolerances without a rebuild.

use serde::{Deserialize, Serialize};

use crate::contracts::ContractError;
use crate::models::enums::SchemaVersion;

/// Application-level constants
pub const APP_NAME: &str = "omop-contracts";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const ENV_PREFIX: &str = "OMOP_CONTRACTS_";

/// Longest accepted stuck timeout: 30 days.
pub const MAX_STUCK_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;
/// Largest accepted producer clock lead: one hour.
pub const MAX_CLOCK_SKEW_MS: i64 = 60 * 60 * 1000;

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "omop_contracts=debug,warn"
    } else {
        "omop_contracts=info,warn"
    }
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Tolerances and timeouts shared by every component of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest gap (in characters) allowed between adjacent chunks.
    /// Covers whitespace collapsed during normalization. Default: 2.
    pub chunk_max_gap: usize,
    /// Largest overlap allowed between adjacent chunks. Default: 0.
    pub chunk_max_overlap: usize,
    /// Relative bound for preprocessed vs raw text length. Default: 0.05.
    pub length_tolerance: f64,
    /// A run sitting in `processing` longer than this is reported stuck. Default: 300.
    pub stuck_timeout_secs: u64,
    /// Allowed producer clock lead before a timestamp counts as future. Default: 1000.
    pub max_clock_skew_ms: i64,
    /// Schema revision to validate against. Default: v2.
    pub schema_version: SchemaVersion,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_max_gap: 2,
            chunk_max_overlap: 0,
            length_tolerance: 0.05,
            stuck_timeout_secs: 300,
            max_clock_skew_ms: 1000,
            schema_version: SchemaVersion::V2,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `OMOP_CONTRACTS_*` variables that are set.
    pub fn from_env() -> Result<Self, ContractError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ContractError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(raw) = get("CHUNK_MAX_GAP") {
            config.chunk_max_gap = parse_var("CHUNK_MAX_GAP", &raw)?;
        }
        if let Some(raw) = get("CHUNK_MAX_OVERLAP") {
            config.chunk_max_overlap = parse_var("CHUNK_MAX_OVERLAP", &raw)?;
        }
        if let Some(raw) = get("LENGTH_TOLERANCE") {
            config.length_tolerance = parse_var("LENGTH_TOLERANCE", &raw)?;
        }
        if let Some(raw) = get("STUCK_TIMEOUT_SECS") {
            config.stuck_timeout_secs = parse_var("STUCK_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("MAX_CLOCK_SKEW_MS") {
            config.max_clock_skew_ms = parse_var("MAX_CLOCK_SKEW_MS", &raw)?;
        }
        if let Some(raw) = get("SCHEMA_VERSION") {
            config.schema_version = parse_var("SCHEMA_VERSION", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every check meaningless.
    pub fn validate(&self) -> Result<(), ContractError> {
        if !(0.0..1.0).contains(&self.length_tolerance) {
            return Err(ContractError::Configuration(format!(
                "length_tolerance must be in [0, 1), got {}",
                self.length_tolerance
            )));
        }
        if !(1..=MAX_STUCK_TIMEOUT_SECS).contains(&self.stuck_timeout_secs) {
            return Err(ContractError::Configuration(format!(
                "stuck_timeout_secs must be in [1, {MAX_STUCK_TIMEOUT_SECS}], got {}",
                self.stuck_timeout_secs
            )));
        }
        if !(0..=MAX_CLOCK_SKEW_MS).contains(&self.max_clock_skew_ms) {
            return Err(ContractError::Configuration(format!(
                "max_clock_skew_ms must be in [0, {MAX_CLOCK_SKEW_MS}], got {}",
                self.max_clock_skew_ms
            )));
        }
        Ok(())
    }

    /// Clamped to the accepted range, so an unvalidated config still yields a duration.
    pub fn stuck_timeout(&self) -> chrono::Duration {
        let secs = self.stuck_timeout_secs.clamp(1, MAX_STUCK_TIMEOUT_SECS);
        chrono::Duration::try_seconds(secs as i64).unwrap_or(chrono::Duration::zero())
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        let ms = self.max_clock_skew_ms.clamp(0, MAX_CLOCK_SKEW_MS);
        chrono::Duration::try_milliseconds(ms).unwrap_or(chrono::Duration::zero())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ContractError> {
    raw.trim().parse().map_err(|_| {
        ContractError::Configuration(format!("{ENV_PREFIX}{name} has unparsable value `{raw}`"))
    })
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
