pub mod config;
pub mod contracts; // Schema registry, validator, tracker, integrity, status
pub mod models;
pub mod simulator; // Channel-connected stage simulation

pub use contracts::{BoundaryReport, ContractEngine, ContractError, Verdict};
pub use models::{PipelineMessage, Stage};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `config::default_log_filter()` applies.
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);
    }
}
