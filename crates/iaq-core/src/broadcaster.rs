//! ---
//! iaq_section: "01-core-functionality"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Acquisition engine and subscriber fan-out."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iaq_common::logging::BROADCASTER_TARGET;
use iaq_common::telemetry::Reading;
use iaq_metrics::AcquisitionMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::machine::{AcquisitionStateMachine, ConnectionState};
use crate::registry::{Subscriber, SubscriptionId, SubscriptionRegistry};
use crate::update::Update;

/// Snapshot returned by [`Broadcaster::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub connection_state: ConnectionState,
    pub is_simulating: bool,
    pub last_reading_timestamp: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    pub retry_count: u32,
    pub force_simulation: bool,
    pub device: String,
    pub uptime_seconds: u64,
}

struct Shared {
    machine: AsyncMutex<AcquisitionStateMachine>,
    registry: SubscriptionRegistry,
    /// Wakes the timer loop when a command changes the retry schedule.
    reschedule: Notify,
    metrics: Option<AcquisitionMetrics>,
    started_at: Instant,
}

impl Shared {
    /// Acquire and publish as one unit under the machine lock.
    async fn tick(&self) -> Reading {
        let mut machine = self.machine.lock().await;
        let update = Update::from(machine.acquire().await);
        let reading = update.reading().clone();
        self.publish(&update);
        if machine.pending_retry().is_some() {
            self.reschedule.notify_one();
        }
        drop(machine);
        reading
    }

    async fn retry(&self) {
        let mut machine = self.machine.lock().await;
        if machine.retry_if_due().await {
            debug!(target: BROADCASTER_TARGET, "reconnected outside the polling schedule");
        }
    }

    async fn pending_retry(&self) -> Option<Instant> {
        self.machine.lock().await.pending_retry()
    }

    fn publish(&self, update: &Update) {
        self.registry.record(update.reading().clone());
        let report = self.registry.fan_out(update);
        if let Some(metrics) = &self.metrics {
            for _ in 0..report.failed {
                metrics.record_delivery_failure();
            }
            metrics.set_subscribers(self.registry.len());
        }
        debug!(
            target: BROADCASTER_TARGET,
            source = %update.reading().source(),
            fault = update.is_fault(),
            delivered = report.delivered,
            failed = report.failed,
            pruned = report.pruned,
            "update published"
        );
    }
}

struct Timer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn retry_wakeup(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_timer(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(target: BROADCASTER_TARGET, period_ms = period.as_millis() as u64, "acquisition timer started");

    loop {
        let retry_at = shared.pending_retry().await;
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                shared.tick().await;
            }
            _ = retry_wakeup(retry_at) => {
                shared.retry().await;
            }
            _ = shared.reschedule.notified() => {}
        }
    }
    info!(target: BROADCASTER_TARGET, "acquisition timer stopped");
}

/// Drives the state machine on a fixed period and fans results out to subscribers.
pub struct Broadcaster {
    shared: Arc<Shared>,
    timer: Mutex<Option<Timer>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("registry", &self.shared.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Broadcaster {
    pub fn new(machine: AcquisitionStateMachine, metrics: Option<AcquisitionMetrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                machine: AsyncMutex::new(machine),
                registry: SubscriptionRegistry::new(),
                reschedule: Notify::new(),
                metrics,
                started_at: Instant::now(),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Start periodic acquisition, replacing any running timer. Subscribers are kept.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, period: Duration) {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(run_timer(Arc::clone(&self.shared), period, receiver));
        let previous = self.timer.lock().replace(Timer { shutdown, task });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            debug!(target: BROADCASTER_TARGET, "previous acquisition timer replaced");
        }
    }

    /// Stop the timer and pending retry wake-ups. An in-flight tick completes first.
    pub async fn stop(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.shutdown.send(true);
            if let Err(err) = timer.task.await {
                warn!(target: BROADCASTER_TARGET, error = %err, "acquisition timer task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Out-of-band acquisition delivered to every subscriber; the periodic schedule is
    /// left untouched.
    pub async fn request_immediate(&self) -> Reading {
        self.shared.tick().await
    }

    /// Register a consumer. It immediately receives the last published reading, or the
    /// result of a fresh acquisition when nothing has been published yet.
    ///
    /// Deliveries run while the acquisition lock is held; a subscriber must not await
    /// other `Broadcaster` methods from inside `deliver`.
    pub async fn subscribe<S>(&self, subscriber: S) -> SubscriptionId
    where
        S: Subscriber + 'static,
    {
        let mut machine = self.shared.machine.lock().await;
        let replay = match self.shared.registry.last_reading() {
            Some(reading) => Update::Reading(reading),
            None => {
                let update = Update::from(machine.acquire().await);
                self.shared.registry.record(update.reading().clone());
                update
            }
        };
        let id = self.shared.registry.subscribe(Arc::new(subscriber), Some(replay));
        drop(machine);

        if let Some(metrics) = &self.shared.metrics {
            metrics.set_subscribers(self.shared.registry.len());
        }
        id
    }

    /// Remove a consumer. Idempotent; returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.registry.unsubscribe(id);
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_subscribers(self.shared.registry.len());
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn last_reading(&self) -> Option<Reading> {
        self.shared.registry.last_reading()
    }

    pub async fn request_reconnect(&self) -> Result<(), EngineError> {
        self.shared.machine.lock().await.request_reconnect()?;
        self.shared.reschedule.notify_one();
        Ok(())
    }

    pub async fn enter_simulation(&self) {
        self.shared.machine.lock().await.enter_simulation().await;
        self.shared.reschedule.notify_one();
    }

    pub async fn status(&self) -> EngineStatus {
        let machine = self.shared.machine.lock().await;
        EngineStatus {
            connection_state: machine.state(),
            is_simulating: machine.is_simulating(),
            last_reading_timestamp: self
                .shared
                .registry
                .last_reading()
                .map(|reading| reading.timestamp()),
            subscriber_count: self.shared.registry.len(),
            retry_count: machine.retry_count(),
            force_simulation: machine.force_simulation(),
            device: machine.device(),
            uptime_seconds: self.shared.started_at.elapsed().as_secs(),
        }
    }

    /// Stop the timer and release the instrument link.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.shared.machine.lock().await.shutdown().await;
        info!(target: BROADCASTER_TARGET, "acquisition engine shut down");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            let _ = timer.shutdown.send(true);
        }
    }
}
