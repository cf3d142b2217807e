//! ---
//! iaq_section: "05-instrument-link"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Instrument link abstraction and transport adapters."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
//! The instrument link is the only part of the workspace that talks to hardware.
//!
//! [`InstrumentLink`] is implemented by [`SerialRtuLink`] for real instruments and by
//! [`ScriptedLink`] for tests and loopback runs.
#![warn(missing_docs)]

use async_trait::async_trait;
use iaq_common::config::{ChannelTable, RegisterLayout, TransportConfig};
use iaq_common::telemetry::Channel;
use thiserror::Error;

pub mod rtu;
pub mod scripted;
pub mod serial;

pub use scripted::{ScriptHandle, ScriptedLink};
pub use serial::SerialRtuLink;

/// Typed transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The transport did not answer within the configured timeout.
    #[error("instrument timed out")]
    Timeout,
    /// The session was dropped by the peer or the OS.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// The instrument answered with a malformed or exception frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A read was attempted before the link was opened.
    #[error("link is not open")]
    NotOpen,
    /// The transport could not be opened (missing port, permissions, probe failure).
    #[error("instrument unavailable: {0}")]
    Unavailable(String),
}

impl LinkError {
    /// Static label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::Timeout => "timeout",
            LinkError::ConnectionReset(_) => "connection_reset",
            LinkError::Protocol(_) => "protocol",
            LinkError::NotOpen => "not_open",
            LinkError::Unavailable(_) => "unavailable",
        }
    }

    /// Whether the session must be considered lost.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, LinkError::Timeout | LinkError::ConnectionReset(_))
    }
}

/// Raw holding-register values returned by one block read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegisterBlock {
    layout: RegisterLayout,
    registers: Vec<u16>,
}

impl RawRegisterBlock {
    /// Pair a register vector with its layout; the lengths must agree.
    pub fn new(layout: RegisterLayout, registers: Vec<u16>) -> Result<Self, LinkError> {
        if registers.len() != layout.channels.len() {
            return Err(LinkError::Protocol(format!(
                "expected {} registers, received {}",
                layout.channels.len(),
                registers.len()
            )));
        }
        Ok(Self { layout, registers })
    }

    /// Raw value for a channel, `None` when the channel has no register.
    pub fn raw(&self, channel: Channel) -> Option<u16> {
        self.layout
            .channels
            .iter()
            .position(|candidate| *candidate == channel)
            .map(|index| self.registers[index])
    }

    /// Iterate `(channel, raw)` pairs in register order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, u16)> + '_ {
        self.layout
            .channels
            .iter()
            .copied()
            .zip(self.registers.iter().copied())
    }

    /// Convert every register into physical units using the table's scaling factors.
    pub fn to_physical(&self, table: &ChannelTable) -> Vec<(Channel, f64)> {
        self.iter()
            .map(|(channel, raw)| (channel, table.spec(channel).scale_raw(raw)))
            .collect()
    }
}

/// Owner of the physical connection.
#[async_trait]
pub trait InstrumentLink: Send {
    /// Establish the connection. Calling while already open is a no-op success.
    async fn open(&mut self, settings: &TransportConfig) -> Result<(), LinkError>;

    /// Read the contiguous register block covering every hardware-backed channel.
    async fn read_channels(&mut self) -> Result<RawRegisterBlock, LinkError>;

    /// Release the transport. Idempotent.
    async fn close(&mut self) -> Result<(), LinkError>;

    /// Whether a session is currently established.
    fn is_open(&self) -> bool;

    /// Device descriptor reported in hardware readings.
    fn descriptor(&self) -> Option<String>;
}
