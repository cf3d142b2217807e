//! ---
//! iaq_section: "11-simulation"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Per-channel bounded random-walk simulator."
//! iaq_version: "v0.1.0"
//! iaq_owner: "tbd"
//! ---
use iaq_common::config::ChannelTable;
use iaq_common::telemetry::{Channel, ChannelSpec, ChannelValues, InvalidChannelSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Weight of the persistent trend relative to the per-tick noise.
const TREND_INFLUENCE: f64 = 0.3;
/// Trend is redrawn once the tick counter exceeds a threshold drawn from this range.
const TREND_WINDOW: std::ops::Range<f64> = 10.0..30.0;
/// Fraction of the overshoot reflected back inside the range at a boundary.
const BOUNCE_DAMPING: f64 = 0.5;

/// Mutable walk state for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorState {
    pub current_value: f64,
    /// Persistent drift in `[-1, 1]`.
    pub trend_direction: f64,
    pub ticks_since_trend_change: u32,
}

impl SimulatorState {
    fn seeded(spec: &ChannelSpec) -> Self {
        Self {
            current_value: spec.midpoint(),
            trend_direction: 0.0,
            ticks_since_trend_change: 0,
        }
    }
}

/// Generates one continuous, bounded value per channel.
#[derive(Debug)]
pub struct ChannelSimulator {
    specs: [ChannelSpec; Channel::COUNT],
    states: [SimulatorState; Channel::COUNT],
    rng: StdRng,
}

impl ChannelSimulator {
    /// Build a simulator over validated specs. `seed` fixes the RNG for reproducible runs.
    pub fn new(
        specs: [ChannelSpec; Channel::COUNT],
        seed: Option<u64>,
    ) -> Result<Self, InvalidChannelSpec> {
        for spec in &specs {
            spec.validate()?;
        }
        let states = specs.map(|spec| SimulatorState::seeded(&spec));
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { specs, states, rng })
    }

    pub fn from_table(table: &ChannelTable, seed: Option<u64>) -> Result<Self, InvalidChannelSpec> {
        Self::new(table.specs(), seed)
    }

    pub fn spec(&self, channel: Channel) -> &ChannelSpec {
        &self.specs[channel.index()]
    }

    pub fn state(&self, channel: Channel) -> &SimulatorState {
        &self.states[channel.index()]
    }

    /// Override the current value of a channel, clamped into its range.
    pub fn seed_value(&mut self, channel: Channel, value: f64) {
        let spec = self.specs[channel.index()];
        self.states[channel.index()].current_value = value.clamp(spec.minimum, spec.maximum);
    }

    /// Advance one channel by a single tick and return its new value.
    pub fn advance(&mut self, channel: Channel) -> f64 {
        let spec = self.specs[channel.index()];
        let state = &mut self.states[channel.index()];

        state.ticks_since_trend_change += 1;
        if f64::from(state.ticks_since_trend_change) > self.rng.gen_range(TREND_WINDOW) {
            state.trend_direction = self.rng.gen_range(-1.0..=1.0);
            state.ticks_since_trend_change = 0;
        }

        let noise: f64 = self.rng.gen_range(-1.0..=1.0);
        let delta = ((state.trend_direction * TREND_INFLUENCE + noise) * spec.max_step)
            .clamp(-spec.max_step, spec.max_step);
        let mut candidate = state.current_value + delta;

        if candidate < spec.minimum {
            candidate = spec.minimum + (spec.minimum - candidate) * BOUNCE_DAMPING;
            state.trend_direction = state.trend_direction.abs();
        } else if candidate > spec.maximum {
            candidate = spec.maximum - (candidate - spec.maximum) * BOUNCE_DAMPING;
            state.trend_direction = -state.trend_direction.abs();
        }

        let value = candidate.clamp(spec.minimum, spec.maximum);
        state.current_value = value;
        trace!(%channel, value, trend = state.trend_direction, "simulated tick");
        value
    }

    /// Advance every channel once.
    pub fn advance_all(&mut self) -> ChannelValues {
        ChannelValues::from_fn(|channel| self.advance(channel))
    }
}
