//! Local token accounting for one quota window.
//!
//! A [`TokenBucket`] holds one fixed-window slice per configured
//! `(amount, validity)` pair. Slice state packs the window epoch and the
//! remaining tokens into a single `AtomicU64`, so allocation, rollback, and
//! remote reconciliation are lock-free CAS loops; the hot path never takes a
//! lock and never blocks.

use crate::rule::{Amount, ResourceKind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Calibration pushed into the bucket by the remote counter channel.
///
/// `as_of_local_ms` is the remote server timestamp already converted to
/// local time via the channel's clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub remaining: u64,
    pub client_count: u32,
    pub as_of_local_ms: u64,
    pub duration: Duration,
}

/// Outcome of a local allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDecision {
    /// Tokens granted. `wait` is the suggested pacing delay (zero for the
    /// reject behavior shipped here).
    Allowed { wait: Duration },
    /// Not enough tokens; `wait` is how long until the binding slice rolls.
    Limited { wait: Duration },
}

impl BucketDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BucketDecision::Allowed { .. })
    }
}

/// Usage drained for one periodic report, per validity duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceUsage {
    pub duration: Duration,
    pub used: u64,
}

// Epoch in the high 32 bits, remaining tokens in the low 32.
fn pack(epoch: u32, remaining: u32) -> u64 {
    (u64::from(epoch) << 32) | u64::from(remaining)
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

#[derive(Debug)]
struct DurationSlice {
    duration_ms: u64,
    amount: u32,
    /// Packed (epoch, remaining).
    state: AtomicU64,
    used_since_report: AtomicU64,
    client_count: AtomicU32,
}

impl DurationSlice {
    fn new(amount: &Amount) -> Self {
        let capped = u32::try_from(amount.max).unwrap_or(u32::MAX);
        Self {
            duration_ms: amount.validity.as_millis().max(1) as u64,
            amount: capped,
            state: AtomicU64::new(pack(0, capped)),
            used_since_report: AtomicU64::new(0),
            client_count: AtomicU32::new(1),
        }
    }

    fn epoch_at(&self, now_ms: u64, rolling: bool) -> u32 {
        if rolling {
            (now_ms / self.duration_ms) as u32
        } else {
            0
        }
    }

    fn wait_until_roll(&self, now_ms: u64, rolling: bool) -> Duration {
        if !rolling {
            return Duration::ZERO;
        }
        let next = (now_ms / self.duration_ms + 1) * self.duration_ms;
        Duration::from_millis(next - now_ms)
    }

    fn try_take(&self, tokens: u32, now_ms: u64, rolling: bool) -> Result<(), Duration> {
        let now_epoch = self.epoch_at(now_ms, rolling);
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (epoch, remaining) = unpack(cur);
            let effective = if epoch == now_epoch { remaining } else { self.amount };
            if effective < tokens {
                return Err(self.wait_until_roll(now_ms, rolling));
            }
            let next = pack(now_epoch, effective - tokens);
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.used_since_report
                    .fetch_add(u64::from(tokens), Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    fn give_back(&self, tokens: u32, now_ms: u64, rolling: bool) {
        let now_epoch = self.epoch_at(now_ms, rolling);
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (epoch, remaining) = unpack(cur);
            if epoch != now_epoch {
                // The window rolled; those tokens are gone either way.
                return;
            }
            let next = pack(epoch, remaining.saturating_add(tokens).min(self.amount));
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        // Keep the report honest: the tokens were never really spent.
        let mut used = self.used_since_report.load(Ordering::Relaxed);
        loop {
            let next = used.saturating_sub(u64::from(tokens));
            match self.used_since_report.compare_exchange_weak(
                used,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => used = observed,
            }
        }
    }

    fn apply_remote(&self, update: &RemoteUpdate, rolling: bool) {
        let update_epoch = self.epoch_at(update.as_of_local_ms, rolling);
        let remaining = u32::try_from(update.remaining).unwrap_or(u32::MAX);
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (epoch, _) = unpack(cur);
            if rolling && epoch > update_epoch {
                // Stale: the local window already rolled past the remote view.
                return;
            }
            let next = pack(update_epoch, remaining.min(self.amount));
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.client_count.store(update.client_count, Ordering::Relaxed);
    }
}

/// Lock-free multi-duration token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    slices: Vec<DurationSlice>,
    rolling: bool,
}

impl TokenBucket {
    pub fn new(amounts: &[Amount], resource: ResourceKind) -> Self {
        Self {
            slices: amounts.iter().map(DurationSlice::new).collect(),
            rolling: resource == ResourceKind::Qps,
        }
    }

    /// Take `tokens` from every slice, or from none.
    ///
    /// Slices are charged in order; if one refuses, the ones already charged
    /// in this call are refunded before returning, so a limited attempt
    /// leaves the bucket untouched.
    pub fn allocate(&self, tokens: u32, now_ms: u64) -> BucketDecision {
        for (idx, slice) in self.slices.iter().enumerate() {
            match slice.try_take(tokens, now_ms, self.rolling) {
                Ok(()) => {}
                Err(roll_wait) => {
                    for charged in &self.slices[..idx] {
                        charged.give_back(tokens, now_ms, self.rolling);
                    }
                    return BucketDecision::Limited { wait: roll_wait };
                }
            }
        }
        BucketDecision::Allowed { wait: Duration::ZERO }
    }

    /// Refund tokens to every slice (caller-driven rollback or a
    /// concurrency-resource release).
    pub fn give_back(&self, tokens: u32, now_ms: u64) {
        for slice in &self.slices {
            slice.give_back(tokens, now_ms, self.rolling);
        }
    }

    /// Reconcile the slice matching `update.duration` to the remote view.
    /// Updates for unknown durations are ignored.
    pub fn apply_remote(&self, update: &RemoteUpdate) {
        let duration_ms = update.duration.as_millis().max(1) as u64;
        for slice in &self.slices {
            if slice.duration_ms == duration_ms {
                slice.apply_remote(update, self.rolling);
                return;
            }
        }
    }

    /// Drain used-since-last-report counters for the periodic quota report.
    pub fn take_report(&self) -> Vec<SliceUsage> {
        self.slices
            .iter()
            .map(|s| SliceUsage {
                duration: Duration::from_millis(s.duration_ms),
                used: s.used_since_report.swap(0, Ordering::Relaxed),
            })
            .collect()
    }

    /// Remaining tokens per slice, for inspection and tests.
    pub fn remaining(&self, now_ms: u64) -> Vec<u64> {
        self.slices
            .iter()
            .map(|s| {
                let (epoch, remaining) = unpack(s.state.load(Ordering::Acquire));
                if s.epoch_at(now_ms, self.rolling) == epoch {
                    u64::from(remaining)
                } else {
                    u64::from(s.amount)
                }
            })
            .collect()
    }
}
