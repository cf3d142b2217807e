//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine and subscriber fan-out."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::time::Duration;

use iaq_common::config::{AcquisitionConfig, AppConfig, ChannelTable, TransportConfig};
use iaq_common::logging::MACHINE_TARGET;
use iaq_common::telemetry::{Channel, ChannelValues, Reading, ReadingSource};
use iaq_link::{InstrumentLink, LinkError, RawRegisterBlock};
use iaq_metrics::AcquisitionMetrics;
use iaq_sim::ChannelSimulator;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Largest backoff exponent; `max_retries` is validated to stay below it.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Connection lifecycle of the instrument link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted or simulation forced; only simulated readings until reconnect.
    Degraded,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Degraded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one tick: always a reading, plus the link fault seen on an established
/// session, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub reading: Reading,
    pub fault: Option<LinkError>,
}

/// Run a link call under the transport timeout.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, LinkError>>,
) -> Result<T, LinkError> {
    match tokio::time::timeout(limit, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(LinkError::Timeout),
    }
}

/// Decides per tick between the instrument and the simulator and owns the
/// connect/retry/give-up transitions.
pub struct AcquisitionStateMachine {
    link: Box<dyn InstrumentLink>,
    simulator: ChannelSimulator,
    channels: ChannelTable,
    transport: TransportConfig,
    policy: AcquisitionConfig,
    state: ConnectionState,
    retry_count: u32,
    next_retry_at: Option<Instant>,
    metrics: Option<AcquisitionMetrics>,
}

impl fmt::Debug for AcquisitionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionStateMachine")
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("next_retry_at", &self.next_retry_at)
            .field("device", &self.transport.descriptor())
            .finish()
    }
}

impl AcquisitionStateMachine {
    pub fn new(
        link: Box<dyn InstrumentLink>,
        config: &AppConfig,
        metrics: Option<AcquisitionMetrics>,
    ) -> Result<Self, EngineError> {
        let simulator =
            ChannelSimulator::from_table(&config.channels, config.acquisition.simulation_seed)?;
        let state = if config.acquisition.force_simulation {
            ConnectionState::Degraded
        } else {
            ConnectionState::Disconnected
        };
        let machine = Self {
            link,
            simulator,
            channels: config.channels.clone(),
            transport: config.transport.clone(),
            policy: config.acquisition.clone(),
            state,
            retry_count: 0,
            next_retry_at: None,
            metrics,
        };
        machine.publish_state();
        info!(
            target: MACHINE_TARGET,
            state = %machine.state,
            device = %machine.transport.descriptor(),
            force_simulation = machine.policy.force_simulation,
            "acquisition state machine ready"
        );
        Ok(machine)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn is_simulating(&self) -> bool {
        self.state != ConnectionState::Connected
    }

    pub fn force_simulation(&self) -> bool {
        self.policy.force_simulation
    }

    /// Descriptor of the configured instrument (`<port>:<unit>`).
    pub fn device(&self) -> String {
        self.transport.descriptor()
    }

    /// Scheduled reconnect attempt while disconnected or backing off.
    pub fn pending_retry(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => self.next_retry_at,
            ConnectionState::Connected | ConnectionState::Degraded => None,
        }
    }

    /// Produce the reading for this tick. Never fails.
    pub async fn acquire(&mut self) -> Acquisition {
        let started = std::time::Instant::now();
        let acquisition = match self.state {
            ConnectionState::Connected => self.read_hardware().await,
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if self.retry_due() && self.attempt_connect().await {
                    self.read_hardware().await
                } else {
                    self.simulated(None)
                }
            }
            ConnectionState::Degraded => self.simulated(None),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_tick(
                acquisition.reading.source().as_str(),
                started.elapsed().as_secs_f64(),
            );
        }
        acquisition
    }

    /// Perform a due reconnect attempt without producing a reading.
    /// Returns whether the link is connected afterwards.
    pub async fn retry_if_due(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting if self.retry_due() => {
                self.attempt_connect().await
            }
            state => state == ConnectionState::Connected,
        }
    }

    /// Leave `Degraded` and retry immediately with a fresh retry budget.
    pub fn request_reconnect(&mut self) -> Result<(), EngineError> {
        if self.policy.force_simulation {
            return Err(EngineError::SimulationForced);
        }
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.set_retry_count(0);
        self.next_retry_at = Some(Instant::now());
        self.transition(ConnectionState::Connecting, "reconnect requested");
        Ok(())
    }

    /// Close the link and park in `Degraded` until a reconnect is requested.
    pub async fn enter_simulation(&mut self) {
        self.close_link().await;
        self.next_retry_at = None;
        self.transition(ConnectionState::Degraded, "simulation requested");
    }

    /// Release the transport. The machine keeps simulating if used afterwards.
    pub async fn shutdown(&mut self) {
        self.close_link().await;
        if self.state == ConnectionState::Connected {
            self.next_retry_at = None;
            self.transition(ConnectionState::Disconnected, "shutdown");
        }
    }

    fn retry_due(&self) -> bool {
        self.next_retry_at
            .map_or(true, |at| Instant::now() >= at)
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.policy
            .retry_unit
            .saturating_mul(1_u32 << retry.min(MAX_BACKOFF_EXPONENT))
    }

    async fn attempt_connect(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            self.transition(ConnectionState::Connecting, "connect attempt");
        }
        let outcome = bounded(self.transport.timeout, self.link.open(&self.transport)).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_connect_attempt(outcome.is_ok());
        }

        match outcome {
            Ok(()) => {
                self.set_retry_count(0);
                self.next_retry_at = None;
                self.transition(ConnectionState::Connected, "instrument link open");
                true
            }
            Err(err) => {
                self.record_error(&err);
                // A timed-out open may have been cancelled mid-handshake.
                self.close_link().await;
                self.set_retry_count(self.retry_count + 1);
                if self.retry_count > self.policy.max_retries {
                    warn!(
                        target: MACHINE_TARGET,
                        error = %err,
                        attempts = self.retry_count,
                        "connect retries exhausted; falling back to simulation"
                    );
                    self.next_retry_at = None;
                    self.transition(ConnectionState::Degraded, "retries exhausted");
                } else {
                    let delay = self.backoff(self.retry_count);
                    self.next_retry_at = Some(Instant::now() + delay);
                    warn!(
                        target: MACHINE_TARGET,
                        error = %err,
                        retry = self.retry_count,
                        max_retries = self.policy.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        "connect attempt failed"
                    );
                }
                false
            }
        }
    }

    async fn read_hardware(&mut self) -> Acquisition {
        match bounded(self.transport.timeout, self.link.read_channels()).await {
            Ok(block) => {
                self.set_retry_count(0);
                let values = self.merge_block(&block);
                let device = self
                    .link
                    .descriptor()
                    .unwrap_or_else(|| self.transport.descriptor());
                let reading = Reading::new(values, ReadingSource::Hardware, Some(device));
                if let Some(metrics) = &self.metrics {
                    metrics.record_hardware_reading(
                        reading.timestamp().timestamp_millis() as f64 / 1000.0,
                    );
                }
                Acquisition {
                    reading,
                    fault: None,
                }
            }
            Err(err) if err.is_connection_loss() => {
                self.record_error(&err);
                warn!(target: MACHINE_TARGET, error = %err, "instrument connection lost");
                self.close_link().await;
                self.next_retry_at = Some(Instant::now());
                self.transition(ConnectionState::Disconnected, "connection lost");
                self.simulated(Some(err))
            }
            Err(err) => {
                self.record_error(&err);
                warn!(target: MACHINE_TARGET, error = %err, "instrument read failed; simulating this tick");
                self.simulated(Some(err))
            }
        }
    }

    /// Hardware values for register-backed channels, simulator for the rest. The
    /// simulator follows the hardware so a later fallback continues from real values.
    fn merge_block(&mut self, block: &RawRegisterBlock) -> ChannelValues {
        ChannelValues::from_fn(|channel: Channel| match block.raw(channel) {
            Some(raw) => {
                let value = self.channels.spec(channel).scale_raw(raw);
                self.simulator.seed_value(channel, value);
                value
            }
            None => self.simulator.advance(channel),
        })
    }

    fn simulated(&mut self, fault: Option<LinkError>) -> Acquisition {
        Acquisition {
            reading: Reading::simulated(self.simulator.advance_all()),
            fault,
        }
    }

    async fn close_link(&mut self) {
        if let Err(err) = bounded(self.transport.timeout, self.link.close()).await {
            debug!(target: MACHINE_TARGET, error = %err, "closing instrument link failed");
        }
    }

    fn set_retry_count(&mut self, retries: u32) {
        self.retry_count = retries;
        if let Some(metrics) = &self.metrics {
            metrics.set_retry_count(retries);
        }
    }

    fn record_error(&self, err: &LinkError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_link_error(err.kind());
        }
    }

    fn transition(&mut self, next: ConnectionState, reason: &'static str) {
        if self.state == next {
            return;
        }
        info!(
            target: MACHINE_TARGET,
            from = %self.state,
            to = %next,
            retry_count = self.retry_count,
            reason,
            "connection state changed"
        );
        self.state = next;
        self.publish_state();
    }

    fn publish_state(&self) {
        if let Some(metrics) = &self.metrics {
            let labels = ConnectionState::ALL.map(|state| state.as_str());
            metrics.set_connection_state(self.state.as_str(), &labels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iaq_link::{ScriptHandle, ScriptedLink};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.acquisition.simulation_seed = Some(7);
        config
    }

    fn machine(config: &AppConfig) -> (AcquisitionStateMachine, ScriptHandle) {
        let layout = config.channels.register_layout().unwrap().unwrap();
        let (link, handle) = ScriptedLink::new(layout);
        let machine = AcquisitionStateMachine::new(Box::new(link), config, None).unwrap();
        (machine, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_connects_and_reads_hardware() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        handle.set_registers(61, &[650, 725, 2590, 5347, 1]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        let acquisition = machine.acquire().await;
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(acquisition.fault.is_none());
        let reading = acquisition.reading;
        assert_eq!(reading.source(), ReadingSource::Hardware);
        assert_eq!(reading.device(), Some("/dev/ttyACM0:1"));
        assert!((reading.value(Channel::Temperature) - 25.90).abs() < 1e-9);
        assert_eq!(reading.value(Channel::Co2), 725.0);
        // No register: always simulated, within range.
        let pressure = Channel::DifferentialPressure.default_spec();
        assert!(pressure.contains(reading.value(Channel::DifferentialPressure)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_per_retry() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        handle.always_fail_open();

        let start = Instant::now();
        let acquisition = machine.acquire().await;
        assert!(acquisition.reading.is_simulated());
        assert!(acquisition.fault.is_none());
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 1);
        assert_eq!(machine.next_retry_at(), Some(start + Duration::from_secs(2)));

        // Not due yet: no attempt.
        tokio::time::advance(Duration::from_secs(1)).await;
        machine.acquire().await;
        assert_eq!(handle.open_attempts(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!machine.retry_if_due().await);
        assert_eq!(machine.retry_count(), 2);
        assert_eq!(
            machine.next_retry_at(),
            Some(start + Duration::from_secs(2 + 4))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_degrade_until_reconnect() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        handle.always_fail_open();

        machine.acquire().await;
        for _ in 0..3 {
            let due = machine.next_retry_at().unwrap();
            tokio::time::advance(due - Instant::now()).await;
            machine.retry_if_due().await;
        }
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert_eq!(handle.open_attempts(), 4);
        assert!(handle.closes() >= 1);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(machine.acquire().await.reading.is_simulated());
        assert_eq!(handle.open_attempts(), 4);

        handle.allow_open();
        machine.request_reconnect().unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 0);
        assert!(!machine.acquire().await.reading.is_simulated());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_open_counts_as_failed_attempt_and_degrades() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        handle.set_open_delay(Some(Duration::from_secs(60)));

        let before = Instant::now();
        let acquisition = machine.acquire().await;
        assert_eq!(Instant::now() - before, config.transport.timeout);
        assert!(acquisition.reading.is_simulated());
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 1);
        assert!(!handle.is_open());

        while machine.state() != ConnectionState::Degraded {
            let due = machine.next_retry_at().unwrap();
            tokio::time::advance(due.saturating_duration_since(Instant::now())).await;
            assert!(!machine.retry_if_due().await);
            assert!(handle.open_attempts() <= config.acquisition.max_retries + 1);
        }
        assert_eq!(handle.open_attempts(), config.acquisition.max_retries + 1);
        assert_eq!(handle.closes(), handle.open_attempts());
        assert!(!handle.is_open());

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(machine.acquire().await.reading.is_simulated());
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert_eq!(handle.open_attempts(), config.acquisition.max_retries + 1);
    }

    fn gauge(registry: &iaq_metrics::prometheus::Registry, name: &str) -> f64 {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_gauge().get_value())
            .unwrap_or_else(|| panic!("{name} not exported"))
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_follow_retries_and_hardware_reads() {
        let config = config();
        let registry = iaq_metrics::new_registry();
        let metrics = AcquisitionMetrics::new(&registry).unwrap();
        let layout = config.channels.register_layout().unwrap().unwrap();
        let (link, handle) = ScriptedLink::new(layout);
        handle.fail_open_times(2);
        let mut machine =
            AcquisitionStateMachine::new(Box::new(link), &config, Some(metrics)).unwrap();

        machine.acquire().await;
        assert_eq!(gauge(&registry, "iaq_retry_count"), 1.0);
        tokio::time::advance(Duration::from_secs(2)).await;
        machine.retry_if_due().await;
        assert_eq!(gauge(&registry, "iaq_retry_count"), 2.0);
        assert_eq!(
            gauge(&registry, "iaq_last_hardware_reading_timestamp_seconds"),
            0.0
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        let reading = machine.acquire().await.reading;
        assert_eq!(reading.source(), ReadingSource::Hardware);
        assert_eq!(gauge(&registry, "iaq_retry_count"), 0.0);
        assert_eq!(
            gauge(&registry, "iaq_last_hardware_reading_timestamp_seconds"),
            reading.timestamp().timestamp_millis() as f64 / 1000.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_disconnects_and_schedules_immediate_retry() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        machine.acquire().await;
        assert_eq!(machine.state(), ConnectionState::Connected);

        handle.set_read_delay(Some(Duration::from_secs(30)));
        let before = Instant::now();
        let acquisition = machine.acquire().await;
        assert_eq!(Instant::now() - before, config.transport.timeout);
        assert_eq!(acquisition.fault, Some(LinkError::Timeout));
        assert!(acquisition.reading.is_simulated());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.pending_retry().unwrap() <= Instant::now());
        assert!(!handle.is_open());

        handle.set_read_delay(None);
        let acquisition = machine.acquire().await;
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(acquisition.reading.source(), ReadingSource::Hardware);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_errors_keep_the_session() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        machine.acquire().await;

        handle.push_read_failure(LinkError::Protocol("exception code 0x02".into()));
        let acquisition = machine.acquire().await;
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(acquisition.fault.as_ref().map(LinkError::kind), Some("protocol"));
        assert!(acquisition.reading.is_simulated());

        assert!(machine.acquire().await.fault.is_none());
        assert_eq!(handle.open_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_simulation_never_touches_the_link() {
        let mut config = config();
        config.acquisition.force_simulation = true;
        let (mut machine, handle) = machine(&config);
        assert_eq!(machine.state(), ConnectionState::Degraded);

        for _ in 0..5 {
            assert!(machine.acquire().await.reading.is_simulated());
        }
        assert_eq!(handle.open_attempts(), 0);
        assert!(matches!(
            machine.request_reconnect(),
            Err(EngineError::SimulationForced)
        ));
        assert_eq!(machine.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn enter_simulation_closes_the_link() {
        let config = config();
        let (mut machine, handle) = machine(&config);
        machine.acquire().await;
        machine.enter_simulation().await;
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert!(!handle.is_open());
        assert!(machine.acquire().await.reading.is_simulated());
    }
}
