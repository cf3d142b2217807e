//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Tracing setup keyed on the acquisition engine's log targets."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
//! Log routing for the acquisition daemon.
//!
//! Engine code logs under three fixed targets: connection transitions
//! ([`MACHINE_TARGET`]), timer and fan-out events ([`BROADCASTER_TARGET`]) and
//! one event per published update ([`UPDATES_TARGET`]). Their levels are set
//! separately from the rest of the process, and updates can be diverted into a
//! reading journal file instead of the general log.

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Connection state transitions of the acquisition state machine.
pub const MACHINE_TARGET: &str = "iaq::machine";
/// Timer lifecycle and subscriber fan-out.
pub const BROADCASTER_TARGET: &str = "iaq::broadcaster";
/// One event per published reading or fault.
pub const UPDATES_TARGET: &str = "iaq::updates";

const LOG_ENV: &str = "IAQ_LOG";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon console.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directive built from configuration alone.
pub fn config_directive(config: &LoggingConfig) -> String {
    let engine = config.engine_level.as_deref().unwrap_or(&config.level);
    // The journal needs update events even when the engine is quieter.
    let updates = if config.reading_journal { "info" } else { engine };
    format!(
        "{},{MACHINE_TARGET}={engine},{BROADCASTER_TARGET}={engine},{UPDATES_TARGET}={updates}",
        config.level
    )
}

fn is_update(meta: &Metadata<'_>) -> bool {
    meta.target() == UPDATES_TARGET
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let fallback = config_directive(config);
    let from_env = [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.trim().is_empty()));
    match from_env {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring log directive `{directive}` ({err}); using `{fallback}`");
            EnvFilter::new(&fallback)
        }),
        None => EnvFilter::new(&fallback),
    }
}

/// Install the process-wide subscriber.
///
/// `IAQ_LOG`, then `RUST_LOG`, replace the configured directive entirely. The console
/// gets every event; the rolling `<prefix>.log` file gets everything except update
/// events when the reading journal is enabled, which go to `<prefix>-readings.log`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let mut guards = Vec::with_capacity(3);
    let (console_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);
    let (file_writer, guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    guards.push(guard);

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };

    let journal_enabled = config.reading_journal;
    let general_file = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .with_filter(filter_fn(move |meta| !(journal_enabled && is_update(meta))))
        .boxed();

    let journal = if journal_enabled {
        let (writer, guard) = tracing_appender::non_blocking(daily(
            &config.directory,
            format!("{prefix}-readings.log"),
        ));
        guards.push(guard);
        Some(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .flatten_event(true)
                .with_target(false)
                .with_writer(writer)
                .with_filter(filter_fn(is_update))
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(build_filter(config))
        .with(console)
        .with(general_file)
        .with(journal)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
    }

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        directive = %config_directive(config),
        reading_journal = journal_enabled,
        installed,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_uses_kebab_case() {
        let json = serde_json::to_string(&LogFormat::StructuredJson).unwrap();
        assert_eq!(json, "\"structured-json\"");
        let parsed: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(parsed, LogFormat::Pretty);
    }

    #[test]
    fn engine_targets_follow_the_base_level_by_default() {
        let config = LoggingConfig::default();
        assert_eq!(
            config_directive(&config),
            "info,iaq::machine=info,iaq::broadcaster=info,iaq::updates=info"
        );
    }

    #[test]
    fn engine_level_overrides_and_journal_keeps_updates() {
        let config = LoggingConfig {
            level: "warn".into(),
            engine_level: Some("debug".into()),
            reading_journal: true,
            ..LoggingConfig::default()
        };
        let directive = config_directive(&config);
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("iaq::machine=debug"));
        assert!(directive.contains("iaq::updates=info"));
        assert!(EnvFilter::try_new(&directive).is_ok());

        let quiet = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        assert!(config_directive(&quiet).ends_with("iaq::updates=warn"));
    }

    #[test]
    fn init_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            format: LogFormat::Pretty,
            file_prefix: Some("iaq-test".into()),
            reading_journal: true,
            ..LoggingConfig::default()
        };
        init_tracing("iaq-test", &config).unwrap();
        assert!(config.directory.is_dir());
    }
}
