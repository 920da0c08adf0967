// src/observability/mod.rs
//! Logging and decision counters
//!
//! Every component logs through `tracing`. Counters go through the `metrics`
//! facade; installing an exporter is left to the host process.

use crate::utils::config::LoggingSettings;
use crate::utils::errors::{AirgapError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding `logging.filter`
pub const LOG_FILTER_ENV: &str = "AIRGAP_LOG";

/// Install the global `tracing` subscriber, writing to stderr.
///
/// Stdout belongs to the code under test. A second call, or a call after the
/// host installed its own subscriber, leaves the existing one in place.
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&settings.filter),
    }
    .map_err(|e| AirgapError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let installed = if settings.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed, keeping it");
    }
    Ok(())
}

/// Count one decision. `outcome` is one of `allowed`, `blocked`, `exempt`,
/// `no_configuration`.
pub fn record_decision(outcome: &'static str, caller: &str) {
    metrics::counter!(
        "airgap_decisions_total",
        "outcome" => outcome,
        "caller" => caller.to_string()
    )
    .increment(1);
}

/// Count a hook invocation that went straight to the original function
pub fn record_passthrough(entry_point: &'static str, reason: &'static str) {
    metrics::counter!(
        "airgap_hook_passthrough_total",
        "entry_point" => entry_point,
        "reason" => reason
    )
    .increment(1);
}
