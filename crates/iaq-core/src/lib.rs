//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine and subscriber fan-out."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
//! Acquisition engine for the IAQ workspace.
//!
//! One [`AcquisitionStateMachine`] decides per tick whether a reading comes from the
//! instrument or from the simulator; the [`Broadcaster`] drives it on a fixed period and
//! fans each result out through the [`SubscriptionRegistry`].

pub mod broadcaster;
pub mod error;
pub mod machine;
pub mod registry;
pub mod update;

pub use broadcaster::{Broadcaster, EngineStatus};
pub use error::EngineError;
pub use machine::{Acquisition, AcquisitionStateMachine, ConnectionState};
pub use registry::{FanOut, Subscriber, SubscriberClosed, SubscriptionId, SubscriptionRegistry};
pub use update::{AcquisitionError, Update};
