//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Shared primitives and utilities for the acquisition runtime."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
//! Core shared primitives for the IAQ acquisition workspace.
//! This crate exposes the channel/reading data model, configuration loading,
//! and logging setup consumed across the workspace.

pub mod config;
pub mod logging;
pub mod telemetry;

pub use config::{
    AcquisitionConfig, AppConfig, ChannelTable, LoadedAppConfig, LoggingConfig, MetricsConfig,
    Parity, RegisterLayout, TransportConfig,
};
pub use logging::{
    init_tracing, LogFormat, BROADCASTER_TARGET, MACHINE_TARGET, UPDATES_TARGET,
};
pub use telemetry::{
    Channel, ChannelSpec, ChannelValues, InvalidChannelSpec, Reading, ReadingSource,
};
