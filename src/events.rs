//! Quota outcome events for the metrics collaborator.
//!
//! An event is emitted only when a window's outcome code changes between two
//! consecutive allocations (pass to limited, or limited back to pass), so
//! sinks see edges rather than per-request noise.

use crate::transport::CounterKey;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Outcome of one window allocation, as seen by event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    Pass,
    Limited,
}

/// One outcome transition on one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaEvent {
    /// Destination service the limited call targeted.
    pub destination: String,
    /// Revision of the rule owning the window.
    pub revision: String,
    /// Label combination inside the rule (empty for exact-match rules).
    pub labels: String,
    /// `None` on the first allocation a window ever serves.
    pub previous: Option<OutcomeCode>,
    pub current: OutcomeCode,
    /// Calling service, when the request carried one.
    pub caller: Option<String>,
}

impl QuotaEvent {
    pub(crate) fn transition(
        key: &CounterKey,
        previous: Option<OutcomeCode>,
        current: OutcomeCode,
        caller: Option<String>,
    ) -> Self {
        Self {
            destination: key.service.clone(),
            revision: key.revision.clone(),
            labels: key.label.clone(),
            previous,
            current,
            caller,
        }
    }
}

/// Consumer of outcome transitions (metrics exporters, alerting, tests).
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: QuotaEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: QuotaEvent) {}
}

/// Bounded in-memory sink; oldest events are evicted first.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<QuotaEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(VecDeque::new())), capacity: capacity.max(1) }
    }

    pub fn events(&self) -> Vec<QuotaEvent> {
        self.events.lock().expect("event sink poisoned").iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event sink poisoned").clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: QuotaEvent) {
        let mut events = self.events.lock().expect("event sink poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that logs transitions through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: QuotaEvent) {
        info!(
            target: "tollgate::events",
            destination = %event.destination,
            revision = %event.revision,
            labels = %event.labels,
            previous = ?event.previous,
            current = ?event.current,
            caller = ?event.caller,
            "quota outcome changed"
        );
    }
}
