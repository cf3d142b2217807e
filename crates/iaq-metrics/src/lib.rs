//! ---
//! iaq_section: "03-observability"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine metrics and the Prometheus scrape endpoint."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Registry shared between the engine and the scrape endpoint.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

async fn scrape(State(registry): State<SharedRegistry>) -> impl IntoResponse {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body)),
        Err(err) => {
            warn!(error = %err, "metrics scrape failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

/// `/metrics` endpoint serving one registry until shut down.
#[derive(Debug)]
pub struct MetricsExporter {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl MetricsExporter {
    /// Bind `addr` and start serving. Port 0 picks a free port; see [`Self::addr`].
    pub async fn bind(registry: SharedRegistry, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read metrics listener address")?;

        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(registry);
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.wait_for(|stop| *stop).await;
                })
                .await
                .context("metrics exporter failed")
        });

        info!(address = %addr, "metrics exporter listening");
        Ok(Self { addr, stop, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Instrumentation for the acquisition engine and its subscribers.
#[derive(Clone, Debug)]
pub struct AcquisitionMetrics {
    ticks: IntCounterVec,
    link_errors: IntCounterVec,
    connect_attempts: IntCounterVec,
    connection_state: IntGaugeVec,
    retry_count: IntGauge,
    last_hardware_reading: Gauge,
    subscribers: IntGauge,
    delivery_failures: IntCounter,
    acquisition_seconds: Histogram,
}

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl AcquisitionMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        Ok(Self {
            ticks: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "iaq_acquisition_ticks_total",
                        "Readings produced, labelled by hardware or simulation source",
                    ),
                    &["source"],
                )?,
            )?,
            link_errors: register(
                registry,
                IntCounterVec::new(
                    Opts::new("iaq_link_errors_total", "Instrument link failures by error kind"),
                    &["kind"],
                )?,
            )?,
            connect_attempts: register(
                registry,
                IntCounterVec::new(
                    Opts::new("iaq_connect_attempts_total", "Instrument open attempts by outcome"),
                    &["outcome"],
                )?,
            )?,
            connection_state: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "iaq_connection_state",
                        "Indicator (0/1) of the current acquisition connection state",
                    ),
                    &["state"],
                )?,
            )?,
            retry_count: register(
                registry,
                IntGauge::with_opts(Opts::new(
                    "iaq_retry_count",
                    "Consecutive failed connect attempts in the current backoff cycle",
                ))?,
            )?,
            last_hardware_reading: register(
                registry,
                Gauge::with_opts(Opts::new(
                    "iaq_last_hardware_reading_timestamp_seconds",
                    "Unix time of the last reading taken from the instrument",
                ))?,
            )?,
            subscribers: register(
                registry,
                IntGauge::with_opts(Opts::new(
                    "iaq_subscribers",
                    "Number of registered reading subscribers",
                ))?,
            )?,
            delivery_failures: register(
                registry,
                IntCounter::with_opts(Opts::new(
                    "iaq_delivery_failures_total",
                    "Subscriber deliveries that returned an error or panicked",
                ))?,
            )?,
            acquisition_seconds: register(
                registry,
                Histogram::with_opts(
                    HistogramOpts::new(
                        "iaq_acquisition_seconds",
                        "Wall time of one acquisition including link I/O",
                    )
                    .buckets(buckets),
                )?,
            )?,
        })
    }

    pub fn record_tick(&self, source: &str, seconds: f64) {
        self.ticks.with_label_values(&[source]).inc();
        self.acquisition_seconds.observe(seconds);
    }

    pub fn record_link_error(&self, kind: &str) {
        self.link_errors.with_label_values(&[kind]).inc();
    }

    pub fn record_connect_attempt(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.connect_attempts.with_label_values(&[outcome]).inc();
    }

    /// Flip the indicator so exactly `current` out of `states` reads 1.
    pub fn set_connection_state(&self, current: &str, states: &[&str]) {
        for &state in states {
            let gauge = self.connection_state.with_label_values(&[state]);
            gauge.set(i64::from(state == current));
        }
    }

    pub fn set_retry_count(&self, retries: u32) {
        self.retry_count.set(i64::from(retries));
    }

    pub fn record_hardware_reading(&self, unix_seconds: f64) {
        self.last_hardware_reading.set(unix_seconds);
    }

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as i64);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.inc();
    }
}

pub use prometheus;
