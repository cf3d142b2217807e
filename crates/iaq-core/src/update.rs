//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine and subscriber fan-out."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use chrono::{DateTime, SecondsFormat, Utc};
use iaq_common::telemetry::Reading;
use iaq_link::LinkError;
use serde::{Serialize, Serializer};

use crate::machine::Acquisition;

/// Link fault observed during a tick, paired with the reading that replaced the
/// hardware sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionError {
    pub error: String,
    pub kind: &'static str,
    #[serde(serialize_with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub reading: Reading,
}

impl AcquisitionError {
    pub fn new(fault: &LinkError, reading: Reading) -> Self {
        Self {
            error: fault.to_string(),
            kind: fault.kind(),
            timestamp: reading.timestamp(),
            reading,
        }
    }
}

fn rfc3339_millis<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// What subscribers receive on every publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Update {
    Reading(Reading),
    Fault(AcquisitionError),
}

impl Update {
    /// The reading carried by the update; faults still carry the tick's fallback reading.
    pub fn reading(&self) -> &Reading {
        match self {
            Update::Reading(reading) => reading,
            Update::Fault(fault) => &fault.reading,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Update::Fault(_))
    }
}

impl From<Acquisition> for Update {
    fn from(acquisition: Acquisition) -> Self {
        match acquisition.fault {
            Some(fault) => Update::Fault(AcquisitionError::new(&fault, acquisition.reading)),
            None => Update::Reading(acquisition.reading),
        }
    }
}
