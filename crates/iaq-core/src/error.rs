//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine and subscriber fan-out."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use iaq_common::telemetry::InvalidChannelSpec;
use thiserror::Error;

/// Errors surfaced by engine commands. Acquisition itself never fails.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reconnect rejected: force simulation is configured")]
    SimulationForced,
    #[error("invalid channel table: {0}")]
    InvalidChannel(#[from] InvalidChannelSpec),
}
