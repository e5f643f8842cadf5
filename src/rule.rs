//! Rate-limit rules and request matching.
//!
//! A [`Rule`] is an immutable versioned policy fetched from a rule source.
//! Matching a request against a rule yields a label key: exact-match rules
//! collapse to the empty label, pattern ("spread") rules fan out into one
//! label per distinct observed value combination. Pattern matchers compile
//! through a shared [`PatternCache`] keyed by the raw pattern text.

use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// What a rule limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Requests per validity duration.
    Qps,
    /// In-flight requests.
    Concurrency,
}

/// Whether a rule is enforced fleet-wide or per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Each process enforces the numeric limit independently.
    Local,
    /// Enforced as a fleet-wide aggregate via the remote authority.
    Global,
}

/// One `(amount, validity duration)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Amount {
    /// Tokens available per validity window.
    pub max: u64,
    /// Length of the window.
    pub validity: Duration,
}

/// Which part of the request a matcher inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSource {
    Method,
    Header(String),
    Query(String),
    CallerService,
    CallerMetadata(String),
}

impl MatchSource {
    fn tag(&self) -> &'static str {
        match self {
            MatchSource::Method => "method",
            MatchSource::Header(_) => "header",
            MatchSource::Query(_) => "query",
            MatchSource::CallerService => "caller",
            MatchSource::CallerMetadata(_) => "meta",
        }
    }

    fn key(&self) -> &str {
        match self {
            MatchSource::Method => "",
            MatchSource::Header(k) | MatchSource::Query(k) | MatchSource::CallerMetadata(k) => k,
            MatchSource::CallerService => "",
        }
    }
}

/// Exact or pattern comparison against an observed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    Exact(String),
    Pattern(String),
}

/// One predicate over a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub source: MatchSource,
    pub rule: MatchRule,
}

impl Matcher {
    pub fn exact(source: MatchSource, value: impl Into<String>) -> Self {
        Self { source, rule: MatchRule::Exact(value.into()) }
    }

    pub fn pattern(source: MatchSource, pattern: impl Into<String>) -> Self {
        Self { source, rule: MatchRule::Pattern(pattern.into()) }
    }
}

/// Compiled-regex cache keyed by raw pattern text.
///
/// Invalid patterns are remembered as misses so a bad rule logs once per
/// pattern instead of once per request.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: DashMap<String, Option<Arc<Regex>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or compile `pattern`. `None` means the pattern does not compile.
    pub fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(entry) = self.compiled.get(pattern) {
            return entry.clone();
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(Arc::new(re)),
            Err(err) => {
                warn!(target: "tollgate::rule", pattern, %err, "pattern does not compile; matcher never matches");
                None
            }
        };
        self.compiled
            .entry(pattern.to_string())
            .or_insert(compiled)
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.compiled.len()
    }
}

/// The request view the engine matches against.
#[derive(Debug, Clone, Default)]
pub struct QuotaRequest {
    pub destination: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub caller_service: Option<String>,
    pub caller_metadata: HashMap<String, String>,
    /// Tokens this call consumes; defaults to 1.
    pub count: u32,
}

impl QuotaRequest {
    pub fn new(destination: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            method: method.into(),
            count: 1,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_caller(mut self, service: impl Into<String>) -> Self {
        self.caller_service = Some(service.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.caller_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    fn value_for(&self, source: &MatchSource) -> Option<&str> {
        match source {
            MatchSource::Method => Some(self.method.as_str()),
            MatchSource::Header(k) => self.headers.get(k).map(String::as_str),
            MatchSource::Query(k) => self.query.get(k).map(String::as_str),
            MatchSource::CallerService => self.caller_service.as_deref(),
            MatchSource::CallerMetadata(k) => self.caller_metadata.get(k).map(String::as_str),
        }
    }
}

/// An immutable versioned rate-limit policy.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Revision string; a new revision invalidates all windows built from
    /// the old one.
    pub revision: String,
    /// Destination service this rule belongs to.
    pub service: String,
    pub resource: ResourceKind,
    /// Enforcement scope; `Local` rules never talk to the authority.
    pub scope: RuleScope,
    /// Behavior/algorithm name; only `reject` ships in this crate.
    pub behavior: String,
    /// Remote authority cluster; `None` falls back to configured addresses.
    pub remote_cluster: Option<String>,
    pub matchers: Vec<Matcher>,
    pub amounts: Vec<Amount>,
    pub disabled: bool,
}

/// Behavior name every deployment supports.
pub const BEHAVIOR_REJECT: &str = "reject";

impl Rule {
    /// Minimal rule: match everything on `service`, reject past the amounts.
    pub fn rejecting(
        service: impl Into<String>,
        revision: impl Into<String>,
        amounts: Vec<Amount>,
    ) -> Self {
        Self {
            revision: revision.into(),
            service: service.into(),
            resource: ResourceKind::Qps,
            scope: RuleScope::Global,
            behavior: BEHAVIOR_REJECT.to_string(),
            remote_cluster: None,
            matchers: Vec::new(),
            amounts,
            disabled: false,
        }
    }

    /// Rules with no amounts or explicitly disabled never produce windows.
    pub fn usable(&self) -> bool {
        !self.disabled && !self.amounts.is_empty()
    }

    /// True when any matcher is pattern-based: each observed value
    /// combination gets its own window.
    pub fn is_spread(&self) -> bool {
        self.matchers
            .iter()
            .any(|m| matches!(m.rule, MatchRule::Pattern(_)))
    }

    /// Longest validity duration across the configured amounts.
    pub fn max_duration(&self) -> Duration {
        self.amounts
            .iter()
            .map(|a| a.validity)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Evaluate every matcher against the request. An absent value fails an
    /// exact or pattern matcher the same way a mismatched one does.
    pub fn matches(&self, request: &QuotaRequest, patterns: &PatternCache) -> bool {
        self.matchers.iter().all(|m| {
            let observed = request.value_for(&m.source);
            match (&m.rule, observed) {
                (MatchRule::Exact(want), Some(got)) => want == got,
                (MatchRule::Pattern(pattern), Some(got)) => patterns
                    .get(pattern)
                    .map(|re| re.is_match(got))
                    .unwrap_or(false),
                (_, None) => false,
            }
        })
    }

    /// Deterministic label for the window this request lands in.
    ///
    /// Exact-only rules collapse to the empty label. For spread rules the
    /// label is the sorted `tag:key:value` tuples of the pattern matchers'
    /// observed values, so the same combination always keys the same window.
    pub fn label_key(&self, request: &QuotaRequest) -> String {
        let mut tuples: Vec<String> = self
            .matchers
            .iter()
            .filter(|m| matches!(m.rule, MatchRule::Pattern(_)))
            .filter_map(|m| {
                request
                    .value_for(&m.source)
                    .map(|v| format!("{}:{}:{}", m.source.tag(), m.source.key(), v))
            })
            .collect();
        if tuples.is_empty() {
            return String::new();
        }
        tuples.sort();
        tuples.join("|")
    }
}

/// Where rules come from. Implemented by the discovery/registry collaborator.
pub trait RuleSource: Send + Sync + std::fmt::Debug {
    /// Ordered rules for a destination. `None` means no source knows this
    /// destination at all (a wiring error at the flow boundary); an empty
    /// list means "no rules", which is an allow.
    fn lookup_rules(&self, destination: &str) -> Option<Vec<Arc<Rule>>>;
}

/// In-memory rule source for tests and static deployments.
#[derive(Debug, Default)]
pub struct InMemoryRuleSource {
    rules: DashMap<String, Vec<Arc<Rule>>>,
}

impl InMemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule list for a destination.
    pub fn put(&self, destination: impl Into<String>, rules: Vec<Rule>) {
        self.rules
            .insert(destination.into(), rules.into_iter().map(Arc::new).collect());
    }

    /// Drop a destination entirely.
    pub fn remove(&self, destination: &str) {
        self.rules.remove(destination);
    }
}

impl RuleSource for InMemoryRuleSource {
    fn lookup_rules(&self, destination: &str) -> Option<Vec<Arc<Rule>>> {
        self.rules.get(destination).map(|r| r.clone())
    }
}
