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
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use iaq_common::telemetry::Reading;
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::update::Update;

/// Returned by a subscriber that will never accept deliveries again; the registry drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscriber is closed")]
pub struct SubscriberClosed;

/// Consumer of published updates.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, update: Update) -> anyhow::Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(Update) -> anyhow::Result<()> + Send + Sync,
{
    fn deliver(&self, update: Update) -> anyhow::Result<()> {
        self(update)
    }
}

impl Subscriber for UnboundedSender<Update> {
    fn deliver(&self, update: Update) -> anyhow::Result<()> {
        self.send(update).map_err(|_| SubscriberClosed.into())
    }
}

/// Opaque handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    subscribers: IndexMap<SubscriptionId, Arc<dyn Subscriber>>,
    last: Option<Reading>,
}

/// Active consumers plus the last published reading for late joiners.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("subscribers", &state.subscribers.len())
            .field("has_last", &state.last.is_some())
            .finish()
    }
}

enum Delivery {
    Delivered,
    Failed,
    Closed,
}

fn deliver_isolated(id: SubscriptionId, subscriber: &dyn Subscriber, update: Update) -> Delivery {
    match catch_unwind(AssertUnwindSafe(|| subscriber.deliver(update))) {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(err)) if err.is::<SubscriberClosed>() => {
            debug!(subscription = %id, "subscriber closed; pruning");
            Delivery::Closed
        }
        Ok(Err(err)) => {
            warn!(subscription = %id, error = %err, "subscriber delivery failed");
            Delivery::Failed
        }
        Err(_) => {
            warn!(subscription = %id, "subscriber panicked during delivery");
            Delivery::Failed
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer and hand it `replay` right away.
    ///
    /// `replay` is normally the last published reading; the caller decides how to
    /// obtain one when nothing has been published yet.
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
        replay: Option<Update>,
    ) -> SubscriptionId {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = SubscriptionId(state.next_id);
            state.subscribers.insert(id, Arc::clone(&subscriber));
            id
        };
        debug!(subscription = %id, "subscriber registered");

        if let Some(update) = replay {
            if let Delivery::Closed = deliver_isolated(id, subscriber.as_ref(), update) {
                self.unsubscribe(id);
            }
        }
        id
    }

    /// Remove a consumer. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.state.lock().subscribers.shift_remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "subscriber removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscribers.contains_key(&id)
    }

    pub fn last_reading(&self) -> Option<Reading> {
        self.state.lock().last.clone()
    }

    /// Remember the reading replayed to late joiners.
    pub fn record(&self, reading: Reading) {
        self.state.lock().last = Some(reading);
    }

    /// Deliver `update` to every subscriber, one call each.
    ///
    /// Deliveries run outside the registry lock, so subscribers may (un)subscribe from
    /// inside their callback. Errors and panics are contained per subscriber; closed
    /// subscribers are pruned.
    pub fn fan_out(&self, update: &Update) -> FanOut {
        let targets: Vec<(SubscriptionId, Arc<dyn Subscriber>)> = self
            .state
            .lock()
            .subscribers
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();

        let mut report = FanOut::default();
        let mut closed = Vec::new();
        for (id, subscriber) in targets {
            match deliver_isolated(id, subscriber.as_ref(), update.clone()) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::Closed => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut state = self.state.lock();
            for id in &closed {
                state.subscribers.shift_remove(id);
            }
            report.pruned = closed.len();
        }
        report
    }
}
