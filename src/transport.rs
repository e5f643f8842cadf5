//! Abstract boundary to the remote quota authority.
//!
//! The wire encoding is out of scope for this crate; deployments provide an
//! [`AuthorityTransport`] that opens one bidirectional stream per node and
//! answers time probes. The engine only depends on the message shapes below.

use crate::error::TransportError;
use crate::resolver::RemoteNode;
use crate::rule::Amount;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Identity of one logical counter: destination service, rule revision, and
/// the label combination inside a spread rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub service: String,
    pub revision: String,
    pub label: String,
}

impl CounterKey {
    pub fn new(
        service: impl Into<String>,
        revision: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self { service: service.into(), revision: revision.into(), label: label.into() }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.service, self.revision, self.label)
    }
}

/// Handshake registering a counter with the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub key: CounterKey,
    pub amounts: Vec<Amount>,
}

/// Periodic usage report for an initialized counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub key: CounterKey,
    /// Tokens consumed locally since the previous report, per duration.
    pub used: Vec<(Duration, u64)>,
    /// Local send time in epoch millis, for the authority's bookkeeping.
    pub timestamp_ms: u64,
}

/// Outbound frames multiplexed onto one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterRequest {
    Init(InitRequest),
    Report(ReportRequest),
}

impl CounterRequest {
    pub fn key(&self) -> &CounterKey {
        match self {
            CounterRequest::Init(r) => &r.key,
            CounterRequest::Report(r) => &r.key,
        }
    }
}

/// Authority verdict on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCode {
    Success,
    /// Non-success replies are logged and applied as no-ops.
    Failure(String),
}

impl ReplyCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyCode::Success)
    }
}

/// Per-duration counter state returned by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationGrant {
    pub duration: Duration,
    /// The authority's identifier for this counter slice.
    pub counter_id: u64,
    /// Fleet-wide remaining tokens as of `server_time_ms`.
    pub remaining: u64,
}

/// Reply to an [`InitRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReply {
    pub code: ReplyCode,
    pub key: CounterKey,
    pub grants: Vec<DurationGrant>,
    /// Number of processes the authority currently sees on this counter.
    pub client_count: u32,
    /// Authority wall clock in epoch millis.
    pub server_time_ms: u64,
}

/// Reply to a [`ReportRequest`]; same shape, no lifecycle meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportReply {
    pub code: ReplyCode,
    pub key: CounterKey,
    pub grants: Vec<DurationGrant>,
    pub client_count: u32,
    pub server_time_ms: u64,
}

/// Inbound frames, processed strictly in receipt order per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterReply {
    Init(InitReply),
    Report(ReportReply),
}

/// Reply to a time probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeProbeReply {
    pub server_time_ms: u64,
}

/// Write half of one node's stream. All sends are serialized through the
/// channel's writer task, so implementations need not be re-entrant.
#[async_trait]
pub trait AuthoritySink: Send {
    async fn send(&mut self, request: CounterRequest) -> Result<(), TransportError>;
}

/// Read half of one node's stream. `Ok(None)` signals an orderly remote
/// close; errors and closes both terminate the channel.
#[async_trait]
pub trait AuthoritySource: Send {
    async fn recv(&mut self) -> Result<Option<CounterReply>, TransportError>;
}

/// Factory for per-node streams and time probes.
#[async_trait]
pub trait AuthorityTransport: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        node: &RemoteNode,
    ) -> Result<(Box<dyn AuthoritySink>, Box<dyn AuthoritySource>), TransportError>;

    async fn time_probe(&self, node: &RemoteNode) -> Result<TimeProbeReply, TransportError>;
}
