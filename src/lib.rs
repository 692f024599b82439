//! Payer coverage policy intelligence.
//!
//! Digitizes policy documents into versioned structured policies, computes
//! semantic diffs between versions and projects their effect on patients
//! assessed against an earlier version.

pub mod config;
pub mod core_state;
pub mod db;
pub mod diff;
pub mod gateway;
pub mod impact;
pub mod models;
pub mod pipeline;
pub mod pipeline_config;

pub use core_state::{CoreError, PolicyCore, PolicyCoreBuilder};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once.
pub fn init_tracing() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();

    if result.is_ok() {
        tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);
    }
}
