//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Shared primitives and utilities for the acquisition runtime."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;

use crate::logging::LogFormat;
use crate::telemetry::{Channel, ChannelSpec};

fn default_transport_name() -> String {
    "Default Config".to_owned()
}

fn default_port() -> String {
    "/dev/ttyACM0".to_owned()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_unit_id() -> u8 {
    1
}

fn default_transport_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_period() -> Duration {
    Duration::from_millis(5000)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the acquisition daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub channels: ChannelTable,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "IAQ_CONFIG";

    /// Load configuration from disk, respecting the `IAQ_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.acquisition.validate()?;
        self.channels.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial transport parameters for the instrument link.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Human-readable profile name reported in status payloads.
    #[serde(default = "default_transport_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Modbus unit (slave) identifier.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Upper bound for any single transport call.
    #[serde(default = "default_transport_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

impl TransportConfig {
    /// Descriptor identifying the device in published readings (`<port>:<unit>`).
    pub fn descriptor(&self) -> String {
        format!("{}:{}", self.port, self.unit_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(anyhow!("transport port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(anyhow!("transport baud_rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(anyhow!(
                "transport data_bits must be within 5..=8 (got {})",
                self.data_bits
            ));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(anyhow!(
                "transport stop_bits must be 1 or 2 (got {})",
                self.stop_bits
            ));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("transport timeout must be positive"));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: default_transport_name(),
            port: default_port(),
            baud_rate: default_baud_rate(),
            parity: Parity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            unit_id: default_unit_id(),
            timeout: default_transport_timeout(),
        }
    }
}

/// Polling cadence, retry policy and simulation switches.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    #[serde(default = "default_period", rename = "period_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub period: Duration,
    /// Reconnect attempts after the initial one before falling back permanently.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_unit * 2^n`.
    #[serde(default = "default_retry_unit", rename = "retry_unit_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_unit: Duration,
    /// Never open the instrument link; start directly in degraded simulation.
    #[serde(default)]
    pub force_simulation: bool,
    /// Fixed simulator seed for reproducible runs.
    #[serde(default)]
    pub simulation_seed: Option<u64>,
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(anyhow!("acquisition period must be positive"));
        }
        if self.max_retries > 16 {
            return Err(anyhow!(
                "acquisition max_retries must not exceed 16 (got {})",
                self.max_retries
            ));
        }
        Ok(())
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            max_retries: default_max_retries(),
            retry_unit: default_retry_unit(),
            force_simulation: false,
            simulation_seed: None,
        }
    }
}

/// Contiguous holding-register block covering every hardware-backed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    pub start: u16,
    /// Channels in register order; register `start + i` feeds `channels[i]`.
    pub channels: Vec<Channel>,
}

impl RegisterLayout {
    pub fn count(&self) -> u16 {
        self.channels.len() as u16
    }
}

/// Per-channel overrides on top of [`Channel::default_spec`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ChannelTable(IndexMap<Channel, ChannelSpec>);

impl ChannelTable {
    pub fn spec(&self, channel: Channel) -> ChannelSpec {
        self.0
            .get(&channel)
            .copied()
            .unwrap_or_else(|| channel.default_spec())
    }

    pub fn set(&mut self, channel: Channel, spec: ChannelSpec) {
        self.0.insert(channel, spec);
    }

    /// Effective specs for every channel in declared order.
    pub fn specs(&self) -> [ChannelSpec; Channel::COUNT] {
        Channel::ALL.map(|channel| self.spec(channel))
    }

    /// Register block read in one transaction. Hardware-backed channels must occupy
    /// consecutive registers in declared channel order.
    pub fn register_layout(&self) -> Result<Option<RegisterLayout>> {
        let mut start = None;
        let mut channels = Vec::new();
        for channel in Channel::ALL {
            let Some(register) = self.spec(channel).register else {
                continue;
            };
            let first = *start.get_or_insert(register);
            let expected = u32::from(first) + channels.len() as u32;
            if u32::from(register) != expected {
                return Err(anyhow!(
                    "channel {channel} uses register {register}, expected {expected} to keep the block contiguous"
                ));
            }
            channels.push(channel);
        }
        Ok(start.map(|start| RegisterLayout { start, channels }))
    }

    pub fn validate(&self) -> Result<()> {
        for channel in Channel::ALL {
            self.spec(channel)
                .validate()
                .with_context(|| format!("invalid spec for channel {channel}"))?;
        }
        self.register_layout()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Level for everything outside the engine targets.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Level for connection transitions and timer events; falls back to `level`.
    #[serde(default)]
    pub engine_level: Option<String>,
    /// Append every published update to a dedicated `<prefix>-readings` file.
    #[serde(default)]
    pub reading_journal: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
            engine_level: None,
            reading_journal: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        let levels = [
            ("level", Some(&self.level)),
            ("engine_level", self.engine_level.as_ref()),
        ];
        for (field, level) in levels {
            if let Some(level) = level {
                level
                    .parse::<LevelFilter>()
                    .map_err(|_| anyhow!("logging {field} `{level}` is not a log level"))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.acquisition.period, Duration::from_millis(5000));
        assert_eq!(config.acquisition.max_retries, 3);
        assert!(!config.acquisition.force_simulation);
        assert_eq!(config.transport.timeout, Duration::from_secs(5));
        assert_eq!(config.transport.descriptor(), "/dev/ttyACM0:1");

        let layout = config.channels.register_layout().unwrap().unwrap();
        assert_eq!(layout.start, 61);
        assert_eq!(layout.count(), 5);
        assert!(!layout.channels.contains(&Channel::DifferentialPressure));
    }

    #[test]
    fn channel_overrides_replace_defaults() {
        let config: AppConfig = r#"
            [acquisition]
            period_ms = 1000
            force_simulation = true

            [channels.temperature]
            minimum = 18.0
            maximum = 30.0
            max_step = 0.2
            scale = 10.0
            register = 63
        "#
        .parse()
        .unwrap();
        assert_eq!(config.acquisition.period, Duration::from_secs(1));
        assert!(config.acquisition.force_simulation);
        let spec = config.channels.spec(Channel::Temperature);
        assert_eq!(spec.maximum, 30.0);
        assert_eq!(spec.scale, 10.0);
        assert_eq!(config.channels.spec(Channel::Co2), Channel::Co2.default_spec());
    }

    #[test]
    fn invalid_channel_range_is_rejected() {
        let result = r#"
            [channels.humidity]
            minimum = 60.0
            maximum = 47.0
            max_step = 0.3
        "#
        .parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn non_contiguous_registers_are_rejected() {
        let result = r#"
            [channels.co2]
            minimum = 600.0
            maximum = 850.0
            max_step = 8.0
            register = 70
        "#
        .parse::<AppConfig>();
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("contiguous"));
    }

    #[test]
    fn logging_levels_are_checked() {
        let config: AppConfig = "[logging]\nlevel = \"warn\"\nengine_level = \"debug\""
            .parse()
            .unwrap();
        assert_eq!(config.logging.engine_level.as_deref(), Some("debug"));

        let err = "[logging]\nengine_level = \"chatty\"".parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("engine_level"));
    }

    #[test]
    fn load_with_source_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nport = \"/dev/ttyUSB3\"\nunit_id = 7").unwrap();
        let loaded = AppConfig::load_with_source(&[file.path()]).unwrap();
        assert_eq!(loaded.source, file.path());
        assert_eq!(loaded.config.transport.descriptor(), "/dev/ttyUSB3:7");
    }

    #[test]
    fn missing_candidates_fail() {
        let err = AppConfig::load(&["/nonexistent/iaqd.toml"]).unwrap_err();
        assert!(err.to_string().contains("no configuration files found"));
    }
}
