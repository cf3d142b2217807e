//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Channel model and reading snapshots shared by the acquisition engine."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::fmt;
use std::ops::{Index, IndexMut};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// One measured environmental quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    ParticulateMatter,
    Co2,
    Temperature,
    Humidity,
    VolatileCompounds,
    DifferentialPressure,
}

impl Channel {
    pub const COUNT: usize = 6;

    /// Every channel in declared (register) order.
    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::ParticulateMatter,
        Channel::Co2,
        Channel::Temperature,
        Channel::Humidity,
        Channel::VolatileCompounds,
        Channel::DifferentialPressure,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Key used for this channel in the published JSON payload.
    pub fn wire_key(self) -> &'static str {
        match self {
            Channel::ParticulateMatter => "PM25",
            Channel::Co2 => "CO2",
            Channel::Temperature => "TEMPERATURE",
            Channel::Humidity => "HUMIDITY",
            Channel::VolatileCompounds => "TVOC",
            Channel::DifferentialPressure => "DIFFERENTIAL_PRESSURE",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::ParticulateMatter => "particulate_matter",
            Channel::Co2 => "co2",
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::VolatileCompounds => "volatile_compounds",
            Channel::DifferentialPressure => "differential_pressure",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Channel::ParticulateMatter => "µg/m³",
            Channel::Co2 => "ppm",
            Channel::Temperature => "°C",
            Channel::Humidity => "%",
            Channel::VolatileCompounds => "mg/m³",
            Channel::DifferentialPressure => "Pa",
        }
    }

    /// Factory defaults of the deployed instrument. Differential pressure has no
    /// register and is always simulated.
    pub fn default_spec(self) -> ChannelSpec {
        let (minimum, maximum, max_step, scale, register) = match self {
            Channel::ParticulateMatter => (4.0, 9.0, 0.15, 100.0, Some(61)),
            Channel::Co2 => (600.0, 850.0, 8.0, 1.0, Some(62)),
            Channel::Temperature => (24.0, 26.0, 0.08, 100.0, Some(63)),
            Channel::Humidity => (47.0, 60.0, 0.3, 100.0, Some(64)),
            Channel::VolatileCompounds => (0.15, 0.3, 0.008, 1.0, Some(65)),
            Channel::DifferentialPressure => (1.0, 2.5, 0.05, 1.0, None),
        };
        ChannelSpec {
            minimum,
            maximum,
            max_step,
            scale,
            register,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a channel specification violates its range invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidChannelSpec {
    #[error("minimum {minimum} must be below maximum {maximum}")]
    EmptyRange { minimum: f64, maximum: f64 },
    #[error("max step per tick must be positive (got {0})")]
    NonPositiveStep(f64),
    #[error("register scaling factor must be positive (got {0})")]
    NonPositiveScale(f64),
}

/// Static configuration of one channel: simulation range, step bound and register scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub minimum: f64,
    pub maximum: f64,
    /// Largest change the simulator may apply in one tick.
    pub max_step: f64,
    /// Raw register integers are divided by this factor.
    #[serde(default = "ChannelSpec::default_scale")]
    pub scale: f64,
    /// Holding register address, `None` for channels without a physical sensor.
    #[serde(default)]
    pub register: Option<u16>,
}

impl ChannelSpec {
    fn default_scale() -> f64 {
        1.0
    }

    pub fn new(
        minimum: f64,
        maximum: f64,
        max_step: f64,
        scale: f64,
    ) -> Result<Self, InvalidChannelSpec> {
        let spec = Self {
            minimum,
            maximum,
            max_step,
            scale,
            register: None,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_register(mut self, register: u16) -> Self {
        self.register = Some(register);
        self
    }

    pub fn validate(&self) -> Result<(), InvalidChannelSpec> {
        // Negated comparisons also reject NaN bounds.
        if !(self.minimum < self.maximum) {
            return Err(InvalidChannelSpec::EmptyRange {
                minimum: self.minimum,
                maximum: self.maximum,
            });
        }
        if !(self.max_step > 0.0) {
            return Err(InvalidChannelSpec::NonPositiveStep(self.max_step));
        }
        if !(self.scale > 0.0) {
            return Err(InvalidChannelSpec::NonPositiveScale(self.scale));
        }
        Ok(())
    }

    pub fn midpoint(&self) -> f64 {
        (self.minimum + self.maximum) / 2.0
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.minimum..=self.maximum).contains(&value)
    }

    pub fn is_hardware_backed(&self) -> bool {
        self.register.is_some()
    }

    /// Convert a raw register integer into physical units.
    pub fn scale_raw(&self, raw: u16) -> f64 {
        f64::from(raw) / self.scale
    }

    /// Inverse of [`ChannelSpec::scale_raw`], truncating towards zero and saturating at
    /// the register width.
    pub fn to_raw(&self, value: f64) -> u16 {
        let raw = (value * self.scale).trunc();
        raw.clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

/// Dense per-channel value storage indexed by [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelValues([f64; Channel::COUNT]);

impl ChannelValues {
    pub fn from_fn(mut f: impl FnMut(Channel) -> f64) -> Self {
        let mut values = [0.0; Channel::COUNT];
        for channel in Channel::ALL {
            values[channel.index()] = f(channel);
        }
        Self(values)
    }

    pub fn get(&self, channel: Channel) -> f64 {
        self.0[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, value: f64) {
        self.0[channel.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL.iter().map(move |channel| (*channel, self.get(*channel)))
    }
}

impl Index<Channel> for ChannelValues {
    type Output = f64;

    fn index(&self, channel: Channel) -> &Self::Output {
        &self.0[channel.index()]
    }
}

impl IndexMut<Channel> for ChannelValues {
    fn index_mut(&mut self, channel: Channel) -> &mut Self::Output {
        &mut self.0[channel.index()]
    }
}

/// Provenance of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    Hardware,
    Simulation,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Hardware => "hardware",
            ReadingSource::Simulation => "simulation",
        }
    }
}

impl fmt::Display for ReadingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable timestamped snapshot of every channel plus provenance.
///
/// Serializes to the published wire shape:
/// `{"PM25": .., ..., "timestamp": "..", "connectionStatus": {"connected", "simulation", "device"}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    values: ChannelValues,
    captured_at: DateTime<Utc>,
    source: ReadingSource,
    device: Option<String>,
}

impl Reading {
    pub fn new(values: ChannelValues, source: ReadingSource, device: Option<String>) -> Self {
        Self::captured_at(values, Utc::now(), source, device)
    }

    pub fn captured_at(
        values: ChannelValues,
        captured_at: DateTime<Utc>,
        source: ReadingSource,
        device: Option<String>,
    ) -> Self {
        Self {
            values,
            captured_at,
            source,
            device,
        }
    }

    pub fn simulated(values: ChannelValues) -> Self {
        Self::new(values, ReadingSource::Simulation, None)
    }

    pub fn value(&self, channel: Channel) -> f64 {
        self.values.get(channel)
    }

    pub fn values(&self) -> &ChannelValues {
        &self.values
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn source(&self) -> ReadingSource {
        self.source
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.source, ReadingSource::Simulation)
    }
}

#[derive(Serialize)]
struct ConnectionStatus<'a> {
    connected: bool,
    simulation: bool,
    device: Option<&'a str>,
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Channel::COUNT + 2))?;
        for (channel, value) in self.values.iter() {
            map.serialize_entry(channel.wire_key(), &value)?;
        }
        map.serialize_entry(
            "timestamp",
            &self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        let hardware = matches!(self.source, ReadingSource::Hardware);
        map.serialize_entry(
            "connectionStatus",
            &ConnectionStatus {
                connected: hardware,
                simulation: !hardware,
                device: self.device(),
            },
        )?;
        map.end()
    }
}
