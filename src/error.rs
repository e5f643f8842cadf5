//! Error types for the quota engine.
//!
//! Only fundamental misconfiguration reaches `get_quota` callers; transport
//! and protocol failures are contained inside the background sync layer (a
//! window silently degrades to local-only accuracy instead).

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the flow boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuotaError {
    /// No rule source can answer for this destination at all. This is a
    /// wiring bug, not a runtime condition, so it propagates.
    #[error("no rule source configured for destination '{destination}'")]
    NoRuleSource {
        /// Destination service key the caller asked about.
        destination: String,
    },
    /// A rule declared a behavior no registered algorithm implements. The
    /// rule is skipped with a warning; this variant exists for callers that
    /// probe window creation directly.
    #[error("rule {revision} declares unsupported behavior '{behavior}'")]
    UnsupportedBehavior {
        /// Revision of the offending rule.
        revision: String,
        /// Declared behavior/action name.
        behavior: String,
    },
    /// Engine configuration failed validation at construction.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Failures at the remote-authority transport boundary. Never crosses the
/// flow boundary; channels are torn down and lazily recreated instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {node} failed: {reason}")]
    Connect {
        /// Target authority node.
        node: String,
        /// Transport-level detail.
        reason: String,
    },
    #[error("stream to {node} closed by remote")]
    StreamClosed {
        /// Target authority node.
        node: String,
    },
    #[error("send on stream failed: {0}")]
    Send(String),
    #[error("time probe failed: {0}")]
    Probe(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Error returned by the tower middleware when a request is limited.
#[derive(Debug, Error)]
pub enum GateError<E> {
    /// The quota engine denied the request.
    #[error("request rate limited, retry after {wait:?}")]
    Limited {
        /// Suggested wait before retrying.
        wait: Duration,
        /// Identity of the limiting rule, if one was recorded.
        rule: Option<String>,
    },
    /// The engine itself was mis-wired.
    #[error(transparent)]
    Quota(QuotaError),
    /// The wrapped service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> GateError<E> {
    /// Check if this error is a rate-limit rejection.
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access the suggested wait if this is a rejection.
    pub fn wait_hint(&self) -> Option<Duration> {
        match self {
            Self::Limited { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rule_source_display_names_destination() {
        let err = QuotaError::NoRuleSource { destination: "orders".into() };
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn gate_error_accessors() {
        let err: GateError<std::io::Error> =
            GateError::Limited { wait: Duration::from_millis(250), rule: None };
        assert!(err.is_limited());
        assert_eq!(err.wait_hint(), Some(Duration::from_millis(250)));
        assert!(err.into_inner().is_none());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let inner: GateError<std::io::Error> = GateError::Inner(io);
        assert!(!inner.is_limited());
        assert_eq!(inner.into_inner().unwrap().to_string(), "boom");
    }

    #[test]
    fn config_error_converts() {
        let cfg = crate::config::QuotaConfig {
            sync_interval: Duration::ZERO,
            ..Default::default()
        };
        let err: QuotaError = cfg.validate().unwrap_err().into();
        assert!(matches!(err, QuotaError::Config(_)));
    }
}
