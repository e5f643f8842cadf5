//! Quota windows: the unit of enforcement for one rule-revision/label pair.
//!
//! A window owns a local token bucket and a lifecycle state machine:
//! `Created -> Initializing -> Initialized`, with `Deleted` reachable from
//! everywhere. Exactly one caller wins the Created->Initializing transition;
//! remote windows then run a recurring sync task until `uninit` aborts it.
//! Allocation works in every state, so a window still waiting on its first
//! remote handshake degrades to conservative local accounting instead of
//! blocking.

use crate::bucket::{BucketDecision, RemoteUpdate, TokenBucket};
use crate::clock::Clock;
use crate::events::OutcomeCode;
use crate::rule::{Rule, RuleScope};
use crate::transport::CounterKey;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const STATE_CREATED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_INITIALIZED: u8 = 2;
const STATE_DELETED: u8 = 3;

const CODE_NONE: u8 = 0;
const CODE_PASS: u8 = 1;
const CODE_LIMITED: u8 = 2;

/// Lifecycle state of a [`QuotaWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Created,
    Initializing,
    Initialized,
    Deleted,
}

fn state_from_u8(v: u8) -> WindowState {
    match v {
        STATE_CREATED => WindowState::Created,
        STATE_INITIALIZING => WindowState::Initializing,
        STATE_INITIALIZED => WindowState::Initialized,
        _ => WindowState::Deleted,
    }
}

/// How the window keeps its bucket calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Pure local accounting; no authority involved.
    LocalOnly,
    /// Background sync against the remote authority.
    Remote,
}

/// One rule-revision/label enforcement unit.
#[derive(Debug)]
pub struct QuotaWindow {
    key: CounterKey,
    rule: Arc<Rule>,
    mode: WindowMode,
    bucket: TokenBucket,
    state: AtomicU8,
    last_code: AtomicU8,
    last_access_ms: AtomicU64,
    last_remote_init_ms: AtomicU64,
    expire_slack: Duration,
    clock: Arc<dyn Clock>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl QuotaWindow {
    pub fn new(
        key: CounterKey,
        rule: Arc<Rule>,
        mode: WindowMode,
        expire_slack: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bucket = TokenBucket::new(&rule.amounts, rule.resource);
        let now = clock.now_millis();
        Self {
            key,
            rule,
            mode,
            bucket,
            state: AtomicU8::new(STATE_CREATED),
            last_code: AtomicU8::new(CODE_NONE),
            last_access_ms: AtomicU64::new(now),
            last_remote_init_ms: AtomicU64::new(0),
            expire_slack,
            clock,
            sync_task: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &CounterKey {
        &self.key
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    pub fn state(&self) -> WindowState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Derive the mode a rule implies: explicitly local rules and rules with
    /// no reachable authority run local-only forever.
    pub fn mode_for(rule: &Rule, authority_reachable: bool) -> WindowMode {
        if rule.scope == RuleScope::Local || !authority_reachable {
            WindowMode::LocalOnly
        } else {
            WindowMode::Remote
        }
    }

    /// Start initialization. Exactly one caller wins the CAS and gets the
    /// scheduling closure invoked; everyone else returns immediately.
    ///
    /// Local-only windows skip straight to Initialized. Remote windows stay
    /// Initializing until the first successful handshake reply flips them
    /// (see [`QuotaWindow::apply_remote_init`]); `schedule` must hand back
    /// the recurring sync task driving that handshake.
    pub fn init<F>(self: &Arc<Self>, schedule: F)
    where
        F: FnOnce(Arc<Self>) -> Option<JoinHandle<()>>,
    {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        if self.mode == WindowMode::LocalOnly {
            self.mark_initialized();
            return;
        }
        let handle = schedule(Arc::clone(self));
        match handle {
            Some(handle) => {
                let mut slot = self.sync_task.lock().expect("sync task slot poisoned");
                if self.state() == WindowState::Deleted {
                    // uninit raced us; the task must not outlive the window.
                    handle.abort();
                } else {
                    *slot = Some(handle);
                }
            }
            // No task means nothing will ever flip the state remotely; run local.
            None => self.mark_initialized(),
        }
    }

    /// Tear the window down: cancel the sync task and mark Deleted.
    /// Idempotent, and safe to race with an in-flight `init`.
    pub fn uninit(&self) {
        self.state.store(STATE_DELETED, Ordering::Release);
        let handle = self.sync_task.lock().expect("sync task slot poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Allocate from the local bucket, whatever the lifecycle state.
    pub fn allocate(&self, tokens: u32) -> BucketDecision {
        let now = self.clock.now_millis();
        self.last_access_ms.store(now, Ordering::Relaxed);
        self.bucket.allocate(tokens, now)
    }

    /// Return tokens (request rollback, or a concurrency release).
    pub fn give_back(&self, tokens: u32) {
        self.bucket.give_back(tokens, self.clock.now_millis());
    }

    /// Record the outcome of an allocation; returns the previous code when
    /// it differs from the new one (the edge the event stream reports).
    pub fn swap_code(&self, code: OutcomeCode) -> Option<Option<OutcomeCode>> {
        let new = match code {
            OutcomeCode::Pass => CODE_PASS,
            OutcomeCode::Limited => CODE_LIMITED,
        };
        let old = self.last_code.swap(new, Ordering::AcqRel);
        if old == new {
            return None;
        }
        Some(match old {
            CODE_PASS => Some(OutcomeCode::Pass),
            CODE_LIMITED => Some(OutcomeCode::Limited),
            _ => None,
        })
    }

    /// Idle longer than the rule's longest validity plus slack.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let idle_for = now_ms.saturating_sub(self.last_access_ms.load(Ordering::Relaxed));
        let threshold = self.rule.max_duration() + self.expire_slack;
        idle_for > threshold.as_millis() as u64
    }

    /// Called by the channel on a successful init reply: calibrate the
    /// bucket and flip Initializing -> Initialized.
    pub fn apply_remote_init(&self, updates: &[RemoteUpdate]) {
        for update in updates {
            self.bucket.apply_remote(update);
        }
        self.last_remote_init_ms
            .store(self.clock.now_millis(), Ordering::Relaxed);
        self.mark_initialized();
    }

    /// Called by the channel on report replies; no lifecycle transition.
    pub fn apply_remote_update(&self, updates: &[RemoteUpdate]) {
        for update in updates {
            self.bucket.apply_remote(update);
        }
    }

    /// Drain local usage for the periodic report.
    pub fn take_report(&self) -> Vec<crate::bucket::SliceUsage> {
        self.bucket.take_report()
    }

    /// Channel teardown clears this so a reused window re-initializes from
    /// scratch.
    pub fn reset_remote_init(&self) {
        self.last_remote_init_ms.store(0, Ordering::Relaxed);
    }

    pub fn last_remote_init_ms(&self) -> u64 {
        self.last_remote_init_ms.load(Ordering::Relaxed)
    }

    fn mark_initialized(&self) {
        // Deleted wins over a late init reply.
        let _ = self.state.compare_exchange(
            STATE_INITIALIZING,
            STATE_INITIALIZED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> Vec<u64> {
        self.bucket.remaining(self.clock.now_millis())
    }
}
