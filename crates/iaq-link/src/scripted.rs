//! ---
//! iaq_section: "05-instrument-link"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "In-memory scripted instrument link for tests and loopback runs."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iaq_common::config::{RegisterLayout, TransportConfig};
use parking_lot::Mutex;
use tracing::debug;

use crate::{InstrumentLink, LinkError, RawRegisterBlock};

#[derive(Debug, Default)]
struct ScriptState {
    registers: HashMap<u16, u16>,
    open_script: VecDeque<Result<(), LinkError>>,
    open_fallback: Option<LinkError>,
    read_failures: VecDeque<LinkError>,
    read_delay: Option<Duration>,
    open_delay: Option<Duration>,
    open: bool,
    open_attempts: u32,
    reads: u32,
    closes: u32,
}

/// In-memory Modbus register bank behind the [`InstrumentLink`] trait.
///
/// Outcomes of `open` and `read_channels` are scripted through a [`ScriptHandle`],
/// which stays usable after the link has been moved into the engine.
#[derive(Debug)]
pub struct ScriptedLink {
    layout: RegisterLayout,
    state: Arc<Mutex<ScriptState>>,
    descriptor: Option<String>,
}

/// Cloneable control surface for a [`ScriptedLink`].
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedLink {
    /// Build a link whose registers all read zero, plus its control handle.
    pub fn new(layout: RegisterLayout) -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let link = Self {
            layout,
            state: Arc::clone(&state),
            descriptor: None,
        };
        (link, ScriptHandle { state })
    }
}

impl ScriptHandle {
    /// Write a holding register.
    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    /// Write consecutive holding registers starting at `start`.
    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(start + offset as u16, *value);
        }
    }

    /// Fail the next `times` open attempts, then succeed.
    pub fn fail_open_times(&self, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state
                .open_script
                .push_back(Err(LinkError::Unavailable("scripted open failure".into())));
        }
    }

    /// Fail every open attempt once the script queue is drained.
    pub fn always_fail_open(&self) {
        self.state.lock().open_fallback =
            Some(LinkError::Unavailable("instrument absent".into()));
    }

    /// Let open attempts succeed again once the script queue is drained.
    pub fn allow_open(&self) {
        self.state.lock().open_fallback = None;
    }

    /// Queue a failure for the next read.
    pub fn push_read_failure(&self, error: LinkError) {
        self.state.lock().read_failures.push_back(error);
    }

    /// Delay every read by `delay` before answering.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// Delay every open attempt by `delay` before its scripted outcome applies.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.state.lock().open_delay = delay;
    }

    /// Number of `open` calls observed, successful or not.
    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    /// Number of `read_channels` calls observed.
    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }

    /// Number of `close` calls observed.
    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }

    /// Whether the scripted session is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[async_trait]
impl InstrumentLink for ScriptedLink {
    async fn open(&mut self, settings: &TransportConfig) -> Result<(), LinkError> {
        let delay = {
            let mut state = self.state.lock();
            if state.open {
                return Ok(());
            }
            state.open_attempts += 1;
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let outcome = match state.open_script.pop_front() {
            Some(outcome) => outcome,
            None => match &state.open_fallback {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
        };
        if outcome.is_ok() {
            state.open = true;
            self.descriptor = Some(settings.descriptor());
        }
        debug!(attempt = state.open_attempts, ok = outcome.is_ok(), "scripted open");
        outcome
    }

    async fn read_channels(&mut self) -> Result<RawRegisterBlock, LinkError> {
        let delay = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(LinkError::NotOpen);
            }
            state.reads += 1;
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.read_failures.pop_front() {
            if error.is_connection_loss() {
                state.open = false;
            }
            return Err(error);
        }
        let registers = (0..self.layout.count())
            .map(|offset| {
                state
                    .registers
                    .get(&(self.layout.start + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        RawRegisterBlock::new(self.layout.clone(), registers)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.open = false;
        state.closes += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn descriptor(&self) -> Option<String> {
        self.descriptor.clone()
    }
}
