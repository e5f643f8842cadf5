#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Client-side distributed rate limiting: quota decisions made in-process,
//! calibrated in the background against a remote counting authority.
//!
//! ## Features
//!
//! - **Rule matching** with exact and pattern matchers over method, headers,
//!   query parameters, and caller identity
//! - **Fixed quota windows** backed by lock-free token buckets
//! - **Multi-rule atomic allocation**: a denied request consumes nothing
//! - **Background synchronization** over a streaming transport, with
//!   consistent-hash channel routing and adaptive clock probing
//! - **Graceful degradation**: an unreachable authority means local-only
//!   accounting, never an error on the request path
//! - **Tower middleware** for gating any `Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{Amount, InMemoryRuleSource, QuotaEngine, QuotaRequest, Rule};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let rules = Arc::new(InMemoryRuleSource::new());
//!     rules.put(
//!         "orders",
//!         vec![Rule::rejecting(
//!             "orders",
//!             "v1",
//!             vec![Amount { max: 100, validity: Duration::from_secs(1) }],
//!         )],
//!     );
//!     let engine = QuotaEngine::builder(rules).build().unwrap();
//!
//!     let decision = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap();
//!     assert!(decision.is_allowed());
//! }
//! ```

pub mod bucket;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod flow;
pub mod middleware;
pub mod resolver;
pub mod ring;
pub mod rule;
pub mod timesync;
pub mod transport;
pub mod window;
pub mod window_set;

// Re-exports
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{ConfigError, DynamicConfig, QuotaConfig};
pub use error::{GateError, QuotaError, TransportError};
pub use events::{EventSink, MemorySink, NullSink, OutcomeCode, QuotaEvent, TracingSink};
pub use flow::{QuotaCode, QuotaEngine, QuotaEngineBuilder, QuotaGuard, QuotaResult};
pub use middleware::{QuotaLayer, QuotaService};
pub use resolver::{InstanceResolver, RemoteNode, StaticResolver};
pub use rule::{
    Amount, InMemoryRuleSource, MatchRule, MatchSource, Matcher, QuotaRequest, ResourceKind,
    Rule, RuleScope, RuleSource,
};
pub use transport::{AuthoritySink, AuthoritySource, AuthorityTransport, CounterKey};
pub use window::{QuotaWindow, WindowMode, WindowState};
