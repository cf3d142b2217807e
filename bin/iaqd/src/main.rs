//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "binary"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Binary entrypoint for the IAQ acquisition daemon."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iaq_common::config::{AppConfig, RegisterLayout};
use iaq_common::logging::{init_tracing, UPDATES_TARGET};
use iaq_core::{AcquisitionStateMachine, Broadcaster, Update};
use iaq_link::{InstrumentLink, ScriptedLink, SerialRtuLink};
use iaq_metrics::{new_registry, AcquisitionMetrics, MetricsExporter};
use tokio::signal;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};

const SERVICE_NAME: &str = "iaqd";
const DEFAULT_CONFIG: &str = "configs/iaqd.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Indoor air quality acquisition daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Never open the instrument; publish simulated readings only")]
    force_simulation: bool,

    #[arg(long, value_name = "PATH", help = "Override the serial port of the instrument")]
    port: Option<String>,

    #[arg(long, value_name = "MS", help = "Override the polling period in milliseconds")]
    period_ms: Option<u64>,

    #[arg(
        long,
        help = "Use an in-memory instrument answering mid-range values instead of the serial port"
    )]
    loopback: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the acquisition engine until interrupted")]
    Run,
    #[command(about = "Perform one acquisition and print the update as JSON")]
    Sample,
    #[command(about = "Validate configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    apply_overrides(&mut config, &cli)?;

    init_tracing(SERVICE_NAME, &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        device = %config.transport.descriptor(),
        force_simulation = config.acquisition.force_simulation,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, cli.loopback).await?,
        Commands::Sample => sample_once(config, cli.loopback).await?,
        Commands::CheckConfig => check_config(&config, &loaded.source)?,
    }

    Ok(())
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) -> Result<()> {
    if cli.force_simulation {
        config.acquisition.force_simulation = true;
    }
    if let Some(port) = &cli.port {
        config.transport.port = port.clone();
    }
    if let Some(period_ms) = cli.period_ms {
        config.acquisition.period = Duration::from_millis(period_ms);
    }
    config
        .validate()
        .context("configuration invalid after command-line overrides")
}

fn build_link(config: &AppConfig, loopback: bool) -> Result<Box<dyn InstrumentLink>> {
    let layout = config
        .channels
        .register_layout()?
        .unwrap_or(RegisterLayout {
            start: 0,
            channels: Vec::new(),
        });

    if loopback {
        let (link, handle) = ScriptedLink::new(layout.clone());
        for channel in &layout.channels {
            let spec = config.channels.spec(*channel);
            if let Some(register) = spec.register {
                handle.set_register(register, spec.to_raw(spec.midpoint()));
            }
        }
        info!(registers = layout.channels.len(), "loopback instrument enabled");
        return Ok(Box::new(link));
    }

    Ok(Box::new(SerialRtuLink::new(layout)))
}

async fn run_daemon(mut config: AppConfig, loopback: bool) -> Result<()> {
    if config.channels.register_layout()?.is_none() && !config.acquisition.force_simulation {
        warn!("no hardware-backed channels configured; forcing simulation");
        config.acquisition.force_simulation = true;
    }

    let (acquisition_metrics, metrics_server) = if config.metrics.enabled {
        let registry = new_registry();
        let metrics = AcquisitionMetrics::new(&registry)?;
        let exporter = MetricsExporter::bind(registry, config.metrics.listen).await?;
        info!(address = %exporter.addr(), "metrics exporter enabled");
        (Some(metrics), Some(exporter))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let link = build_link(&config, loopback)?;
    let machine = AcquisitionStateMachine::new(link, &config, acquisition_metrics.clone())?;
    let broadcaster = Broadcaster::new(machine, acquisition_metrics);

    let (tx, mut rx) = unbounded_channel::<Update>();
    let subscription = broadcaster.subscribe(tx).await;
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match serde_json::to_string(&update) {
                Ok(payload) if update.is_fault() => {
                    warn!(target: UPDATES_TARGET, %payload, "acquisition fault")
                }
                Ok(payload) => info!(target: UPDATES_TARGET, %payload, "reading published"),
                Err(err) => warn!(error = %err, "failed to encode update"),
            }
        }
    });

    broadcaster.start(config.acquisition.period);
    info!(
        period_ms = config.acquisition.period.as_millis() as u64,
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    broadcaster.shutdown().await;
    broadcaster.unsubscribe(subscription);
    if let Err(err) = printer.await {
        warn!(error = %err, "update printer task failed");
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn sample_once(config: AppConfig, loopback: bool) -> Result<()> {
    let link = build_link(&config, loopback)?;
    let mut machine = AcquisitionStateMachine::new(link, &config, None)?;
    let update = Update::from(machine.acquire().await);
    machine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&update)?);
    Ok(())
}

fn check_config(config: &AppConfig, source: &std::path::Path) -> Result<()> {
    let layout = config.channels.register_layout()?;
    println!("source: {}", source.display());
    match layout {
        Some(layout) => println!(
            "register block: {} registers from {} ({})",
            layout.count(),
            layout.start,
            layout
                .channels
                .iter()
                .map(|channel| channel.wire_key())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        None => println!("register block: none (simulation only)"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
