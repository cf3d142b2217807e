//! ---
//! iaq_section: "11-simulation"
//! iaq_subsection: "01-bootstrap"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Simulation module exports and shared types."
//! iaq_version: "v0.1.0"
//! iaq_owner: "tbd"
//! ---
//! Synthetic telemetry for the IAQ acquisition engine.
//!
//! The simulator produces a slowly drifting, trend-persistent value per channel so that
//! fallback data resembles a real sensor rather than white noise.

pub mod simulator;

pub use simulator::{ChannelSimulator, SimulatorState};
