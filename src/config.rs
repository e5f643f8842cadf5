//! Engine configuration.
//!
//! The engine consumes these values, it does not own their loading: an
//! external configuration collaborator builds a [`QuotaConfig`] and hands the
//! engine a [`DynamicConfig`] handle. Reads on the hot path are lock-free via
//! `ArcSwap`; a config reload is a single `set` on the handle.

use crate::resolver::RemoteNode;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
        T: Clone,
    {
        let cur = self.inner.load_full();
        self.inner.store(Arc::new(f(&cur)));
    }
}

/// Read-only knobs consumed by the quota engine.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Master switch. When false, `get_quota` returns OK without touching state.
    pub enabled: bool,
    /// How long to wait for a remote init/report reply before re-issuing.
    pub sync_timeout: Duration,
    /// Unanswered init handshakes tolerated before a channel declares its
    /// stream dead and lets the connector reopen it.
    pub max_retry: u32,
    /// Authority addresses used when a rule names no remote cluster but the
    /// deployment still runs a shared authority.
    pub fallback_addresses: Vec<RemoteNode>,
    /// Cadence of the per-window sync task (init retry / usage report).
    pub sync_interval: Duration,
    /// Cadence of the idle-window sweeper.
    pub sweep_interval: Duration,
    /// Added on top of a window's longest validity duration before it counts
    /// as idle.
    pub expire_slack: Duration,
    /// Floor of the adaptive time-probe interval.
    pub probe_interval_min: Duration,
    /// Ceiling of the adaptive time-probe interval.
    pub probe_interval_max: Duration,
    /// Share of the probe round-trip attributed to the outbound leg. A
    /// heuristic, not a correctness knob.
    pub rtt_apportionment: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_timeout: Duration::from_millis(500),
            max_retry: 3,
            fallback_addresses: Vec::new(),
            sync_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(5),
            expire_slack: Duration::from_secs(1),
            probe_interval_min: Duration::from_millis(100),
            probe_interval_max: Duration::from_secs(30),
            rtt_apportionment: 0.5,
        }
    }
}

impl QuotaConfig {
    /// Validate knobs that would otherwise wedge background loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "sync_interval" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "sweep_interval" });
        }
        if self.probe_interval_min.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "probe_interval_min" });
        }
        if self.max_retry == 0 {
            return Err(ConfigError::ZeroRetry);
        }
        if self.probe_interval_max < self.probe_interval_min {
            return Err(ConfigError::ProbeCeilingBelowFloor {
                min: self.probe_interval_min,
                max: self.probe_interval_max,
            });
        }
        if !(0.0..=1.0).contains(&self.rtt_apportionment) {
            return Err(ConfigError::ApportionmentOutOfRange(self.rtt_apportionment));
        }
        Ok(())
    }
}

/// Errors produced when validating engine configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("max_retry must be at least 1")]
    ZeroRetry,
    #[error("probe_interval_max ({max:?}) must be >= probe_interval_min ({min:?})")]
    ProbeCeilingBelowFloor { min: Duration, max: Duration },
    #[error("rtt_apportionment must be within [0, 1] (got {0})")]
    ApportionmentOutOfRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_config_get_set_update() {
        let handle = DynamicConfig::new(1);
        assert_eq!(*handle.get(), 1);
        handle.set(2);
        assert_eq!(*handle.get(), 2);
        handle.update(|v| v + 3);
        assert_eq!(*handle.get(), 5);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(QuotaConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_sync_interval_is_rejected() {
        let cfg = QuotaConfig { sync_interval: Duration::ZERO, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroInterval { field: "sync_interval" }));
    }

    #[test]
    fn zero_max_retry_is_rejected() {
        let cfg = QuotaConfig { max_retry: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRetry));
    }

    #[test]
    fn inverted_probe_bounds_are_rejected() {
        let cfg = QuotaConfig {
            probe_interval_min: Duration::from_secs(10),
            probe_interval_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ProbeCeilingBelowFloor { .. })));
    }

    #[test]
    fn apportionment_must_be_a_fraction() {
        let cfg = QuotaConfig { rtt_apportionment: 1.5, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ApportionmentOutOfRange(_))));
    }
}
