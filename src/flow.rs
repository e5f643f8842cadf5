//! The quota flow: rule matching, window fan-out, and atomic allocation.
//!
//! [`QuotaEngine`] is the SDK root context. It owns the per-destination
//! window sets, the pattern cache, the event sink, and the background
//! sweeper; everything else reaches it as an injected collaborator. The hot
//! path ([`QuotaEngine::get_quota`]) touches only in-memory structures:
//! remote synchronization happens on background tasks spawned per window,
//! and their failures never surface here.

use crate::clock::{Clock, SystemClock};
use crate::config::{DynamicConfig, QuotaConfig};
use crate::connector::Connector;
use crate::error::QuotaError;
use crate::events::{EventSink, NullSink, OutcomeCode, QuotaEvent};
use crate::resolver::{InstanceResolver, RemoteNode};
use crate::ring::HashRing;
use crate::rule::{PatternCache, QuotaRequest, Rule, RuleSource, BEHAVIOR_REJECT};
use crate::transport::AuthorityTransport;
use crate::window::{QuotaWindow, WindowState};
use crate::window_set::WindowSet;
use crate::bucket::BucketDecision;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Overall verdict of one `get_quota` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCode {
    Ok,
    Limited,
}

/// Why the engine answered the way it did.
pub mod reason {
    pub const DISABLED: &str = "rate limiting disabled";
    pub const NO_RULE: &str = "no matching rule";
    pub const OK: &str = "quota granted";
    pub const LIMITED: &str = "quota exceeded";
}

/// Held permits for concurrency-resource windows; returning them releases
/// the in-flight slots. Dropping the guard releases as well.
#[derive(Debug, Default)]
pub struct QuotaGuard {
    held: Vec<(Arc<QuotaWindow>, u32)>,
}

impl QuotaGuard {
    /// Explicitly release the held permits.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        for (window, tokens) in self.held.drain(..) {
            window.give_back(tokens);
        }
    }
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Result of one quota decision.
#[derive(Debug)]
pub struct QuotaResult {
    pub code: QuotaCode,
    /// Suggested wait before retrying (limited) or pacing hint (allowed).
    pub wait: Duration,
    /// Human-readable reason code.
    pub info: &'static str,
    /// The rule that limited the request, or `None` when allowed.
    pub active_rule: Option<Arc<Rule>>,
    /// Permits to hold for concurrency-resource rules; `None` when no such
    /// rule matched.
    pub guard: Option<QuotaGuard>,
}

impl QuotaResult {
    fn allowed(info: &'static str, wait: Duration, guard: Option<QuotaGuard>) -> Self {
        Self { code: QuotaCode::Ok, wait, info, active_rule: None, guard }
    }

    fn limited(wait: Duration, rule: Arc<Rule>) -> Self {
        Self {
            code: QuotaCode::Limited,
            wait,
            info: reason::LIMITED,
            active_rule: Some(rule),
            guard: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.code == QuotaCode::Ok
    }
}

struct EngineInner {
    config: DynamicConfig<QuotaConfig>,
    rules: Arc<dyn RuleSource>,
    resolver: Option<Arc<dyn InstanceResolver>>,
    transport: Option<Arc<dyn AuthorityTransport>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    patterns: PatternCache,
    sets: DashMap<String, Arc<WindowSet>>,
    fallback_ring: HashRing,
    runtime: Option<tokio::runtime::Handle>,
    serialized: Option<Mutex<()>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    fn resolve_node(&self, rule: &Rule, hash_key: &str) -> Option<RemoteNode> {
        match &rule.remote_cluster {
            Some(cluster) => self.resolver.as_ref()?.resolve_one(cluster, hash_key),
            None => self.fallback_ring.select(hash_key).cloned(),
        }
    }
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("destinations", &self.sets.len())
            .field("remote", &self.transport.is_some())
            .finish()
    }
}

/// Client-side distributed quota engine.
#[derive(Debug, Clone)]
pub struct QuotaEngine {
    inner: Arc<EngineInner>,
}

impl QuotaEngine {
    pub fn builder(rules: Arc<dyn RuleSource>) -> QuotaEngineBuilder {
        QuotaEngineBuilder::new(rules)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Never blocks on network I/O. Matching rules are charged sequentially
    /// in matched order; if any window refuses, every window already charged
    /// in this call is refunded, so a rejected request consumes nothing.
    pub fn get_quota(&self, request: &QuotaRequest) -> Result<QuotaResult, QuotaError> {
        let inner = &self.inner;
        let config = inner.config.get();
        if !config.enabled {
            return Ok(QuotaResult::allowed(reason::DISABLED, Duration::ZERO, None));
        }
        let rules = inner
            .rules
            .lookup_rules(&request.destination)
            .ok_or_else(|| QuotaError::NoRuleSource { destination: request.destination.clone() })?;

        let mut matched: Vec<(Arc<Rule>, Arc<QuotaWindow>)> = Vec::new();
        for rule in rules {
            if !rule.usable() || !rule.matches(request, &inner.patterns) {
                continue;
            }
            if rule.behavior != BEHAVIOR_REJECT {
                warn!(
                    target: "tollgate::flow",
                    revision = %rule.revision,
                    behavior = %rule.behavior,
                    "no algorithm for declared behavior, rule skipped"
                );
                continue;
            }
            let label = rule.label_key(request);
            let window = self.window_for(&rule, &label, &request.destination);
            window.init(|w| self.spawn_sync(&request.destination, &w));
            matched.push((rule, window));
        }
        if matched.is_empty() {
            return Ok(QuotaResult::allowed(reason::NO_RULE, Duration::ZERO, None));
        }

        let _serialized = inner.serialized.as_ref().map(|m| m.lock().expect("allocation lock poisoned"));
        let tokens = request.count.max(1);
        let mut allocated: Vec<(Arc<QuotaWindow>, u32)> = Vec::new();
        let mut max_wait = Duration::ZERO;
        for (rule, window) in &matched {
            match window.allocate(tokens) {
                BucketDecision::Allowed { wait } => {
                    max_wait = max_wait.max(wait);
                    self.emit(window, OutcomeCode::Pass, request);
                    allocated.push((Arc::clone(window), tokens));
                }
                BucketDecision::Limited { wait } => {
                    self.emit(window, OutcomeCode::Limited, request);
                    // Roll back everything charged earlier in this call.
                    for (charged, count) in allocated.drain(..) {
                        charged.give_back(count);
                    }
                    return Ok(QuotaResult::limited(wait, Arc::clone(rule)));
                }
            }
        }

        let held: Vec<(Arc<QuotaWindow>, u32)> = allocated
            .into_iter()
            .filter(|(w, _)| w.rule().resource == crate::rule::ResourceKind::Concurrency)
            .collect();
        let guard = if held.is_empty() { None } else { Some(QuotaGuard { held }) };
        Ok(QuotaResult::allowed(reason::OK, max_wait, guard))
    }

    /// Drive rule-change notifications from the rule source: containers for
    /// removed revisions are torn down and their windows uninitialized.
    pub fn on_rules_changed(&self, destination: &str, removed_revisions: &[String]) {
        if removed_revisions.is_empty() {
            return;
        }
        if let Some(set) = self.inner.sets.get(destination).map(|s| s.clone()) {
            let removed: HashSet<String> = removed_revisions.iter().cloned().collect();
            let count = set.delete_revisions(&removed);
            debug!(
                target: "tollgate::flow",
                destination,
                removed = count,
                "rule revisions deleted"
            );
        }
    }

    /// Tear everything down: sweeper, windows, channels.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().expect("sweeper slot poisoned").take() {
            handle.abort();
        }
        for entry in self.inner.sets.iter() {
            entry.value().clear();
            if let Some(connector) = entry.value().connector() {
                connector.shutdown();
            }
        }
        self.inner.sets.clear();
    }

    /// Windows currently tracked across all destinations.
    pub fn window_count(&self) -> usize {
        self.inner.sets.iter().map(|e| e.value().window_count()).sum()
    }

    /// Live config handle, for the configuration collaborator.
    pub fn config(&self) -> DynamicConfig<QuotaConfig> {
        self.inner.config.clone()
    }

    fn window_for(&self, rule: &Arc<Rule>, label: &str, destination: &str) -> Arc<QuotaWindow> {
        let inner = &self.inner;
        let set = inner
            .sets
            .entry(destination.to_string())
            .or_insert_with(|| {
                let connector = inner.transport.as_ref().map(|transport| {
                    Arc::new(Connector::new(
                        Arc::clone(transport),
                        inner.config.get(),
                        Arc::clone(&inner.clock),
                    ))
                });
                Arc::new(WindowSet::new(destination, connector))
            })
            .clone();
        let config = inner.config.get();
        set.get_or_create(rule, label, |key| {
            let reachable = self.authority_reachable(rule);
            let mode = QuotaWindow::mode_for(rule, reachable);
            Arc::new(QuotaWindow::new(
                key,
                Arc::clone(rule),
                mode,
                config.expire_slack,
                Arc::clone(&inner.clock),
            ))
        })
    }

    fn authority_reachable(&self, rule: &Rule) -> bool {
        let inner = &self.inner;
        if inner.transport.is_none() || inner.runtime.is_none() {
            return false;
        }
        match &rule.remote_cluster {
            Some(_) => inner.resolver.is_some(),
            None => !inner.fallback_ring.is_empty(),
        }
    }

    fn spawn_sync(&self, destination: &str, window: &Arc<QuotaWindow>) -> Option<JoinHandle<()>> {
        let inner = &self.inner;
        let runtime = inner.runtime.clone()?;
        let set = inner.sets.get(destination).map(|s| s.clone())?;
        let connector = Arc::clone(set.connector()?);
        // Weak so an abandoned engine does not live on in its sync tasks.
        let weak = Arc::downgrade(inner);
        let window = Arc::clone(window);
        Some(runtime.spawn(async move {
            let interval = match weak.upgrade() {
                Some(inner) => inner.config.get().sync_interval,
                None => return,
            };
            // Stagger fleet start so sync cycles do not align.
            let jitter_ms = rand::random_range(0..interval.as_millis().max(1) as u64);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            loop {
                if window.state() == WindowState::Deleted {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };
                let hash_key = window.key().to_string();
                match inner.resolve_node(window.rule(), &hash_key) {
                    Some(node) => match connector.acquire(&window, node).await {
                        Ok(channel) => channel.sync(&window).await,
                        Err(err) => {
                            debug!(
                                target: "tollgate::flow",
                                key = %window.key(),
                                %err,
                                "authority unreachable, window serves local-only"
                            );
                        }
                    },
                    None => {
                        debug!(
                            target: "tollgate::flow",
                            key = %window.key(),
                            "no authority instance resolvable"
                        );
                    }
                }
                drop(inner);
                tokio::time::sleep(interval).await;
            }
        }))
    }

    fn emit(&self, window: &Arc<QuotaWindow>, code: OutcomeCode, request: &QuotaRequest) {
        if let Some(previous) = window.swap_code(code) {
            self.inner.sink.emit(QuotaEvent::transition(
                window.key(),
                previous,
                code,
                request.caller_service.clone(),
            ));
        }
    }
}

/// Builder for [`QuotaEngine`].
#[derive(Debug)]
pub struct QuotaEngineBuilder {
    config: QuotaConfig,
    rules: Arc<dyn RuleSource>,
    resolver: Option<Arc<dyn InstanceResolver>>,
    transport: Option<Arc<dyn AuthorityTransport>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    serialized: bool,
}

impl QuotaEngineBuilder {
    pub fn new(rules: Arc<dyn RuleSource>) -> Self {
        Self {
            config: QuotaConfig::default(),
            rules,
            resolver: None,
            transport: None,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            serialized: false,
        }
    }

    pub fn config(mut self, config: QuotaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn InstanceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn AuthorityTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opt-in: serialize the whole multi-window allocation sequence behind
    /// one lock, for coordinators that require globally ordered consumption.
    pub fn serialized_allocation(mut self, serialized: bool) -> Self {
        self.serialized = serialized;
        self
    }

    /// Build the engine. Must run inside a tokio runtime for background
    /// sync and sweeping; without one the engine still works, local-only.
    pub fn build(self) -> Result<QuotaEngine, QuotaError> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().ok();
        if runtime.is_none() {
            warn!(
                target: "tollgate::flow",
                "no tokio runtime, remote sync and sweeping disabled"
            );
        }
        let fallback_ring = HashRing::new(&self.config.fallback_addresses);
        let inner = Arc::new(EngineInner {
            config: DynamicConfig::new(self.config),
            rules: self.rules,
            resolver: self.resolver,
            transport: self.transport,
            sink: self.sink,
            clock: self.clock,
            patterns: PatternCache::new(),
            sets: DashMap::new(),
            fallback_ring,
            runtime: runtime.clone(),
            serialized: self.serialized.then(|| Mutex::new(())),
            sweeper: Mutex::new(None),
        });
        let engine = QuotaEngine { inner };
        if let Some(runtime) = runtime {
            // Weak so the sweeper never keeps a dropped engine alive.
            let weak = Arc::downgrade(&engine.inner);
            let handle = runtime.spawn(async move {
                loop {
                    let interval = match weak.upgrade() {
                        Some(inner) => inner.config.get().sweep_interval,
                        None => break,
                    };
                    tokio::time::sleep(interval).await;
                    let Some(inner) = weak.upgrade() else { break };
                    let now = inner.clock.now_millis();
                    for entry in inner.sets.iter() {
                        entry.value().sweep(now);
                    }
                }
            });
            *engine.inner.sweeper.lock().expect("sweeper slot poisoned") = Some(handle);
        }
        Ok(engine)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
        // Sync tasks exit on their own once their weak handle fails to
        // upgrade, but each channel's writer, reader, and probe tasks hold
        // the channel alive and must be stopped explicitly.
        for entry in self.sets.iter() {
            if let Some(connector) = entry.value().connector() {
                connector.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::events::MemorySink;
    use crate::rule::{Amount, InMemoryRuleSource, MatchSource, Matcher, ResourceKind, RuleScope};

    fn local_rule(revision: &str, max: u64) -> Rule {
        let mut rule = Rule::rejecting(
            "orders",
            revision,
            vec![Amount { max, validity: Duration::from_secs(1) }],
        );
        rule.scope = RuleScope::Local;
        rule
    }

    fn engine_with(
        rules: Vec<Rule>,
        clock: ManualClock,
        sink: Arc<dyn EventSink>,
    ) -> QuotaEngine {
        let source = Arc::new(InMemoryRuleSource::new());
        source.put("orders", rules);
        QuotaEngine::builder(source)
            .clock(Arc::new(clock))
            .event_sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_feature_allows_without_state() {
        let source = Arc::new(InMemoryRuleSource::new());
        source.put("orders", vec![local_rule("v1", 1)]);
        let engine = QuotaEngine::builder(source)
            .config(QuotaConfig { enabled: false, ..Default::default() })
            .build()
            .unwrap();
        for _ in 0..5 {
            let result = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap();
            assert!(result.is_allowed());
            assert_eq!(result.info, reason::DISABLED);
        }
        assert_eq!(engine.window_count(), 0);
    }

    #[tokio::test]
    async fn unknown_destination_is_a_wiring_error() {
        let engine =
            QuotaEngine::builder(Arc::new(InMemoryRuleSource::new())).build().unwrap();
        let err = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap_err();
        assert_eq!(err, QuotaError::NoRuleSource { destination: "orders".into() });
    }

    #[tokio::test]
    async fn no_matching_rule_is_an_allow() {
        let engine =
            engine_with(vec![], ManualClock::at(0), Arc::new(NullSink));
        let result = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.info, reason::NO_RULE);
    }

    #[tokio::test]
    async fn local_rule_limits_at_amount_and_recovers_after_validity() {
        let clock = ManualClock::at(0);
        let engine = engine_with(vec![local_rule("v1", 10)], clock.clone(), Arc::new(NullSink));
        let request = QuotaRequest::new("orders", "GET");

        for _ in 0..10 {
            assert!(engine.get_quota(&request).unwrap().is_allowed());
        }
        let limited = engine.get_quota(&request).unwrap();
        assert_eq!(limited.code, QuotaCode::Limited);
        let active = limited.active_rule.expect("limiting rule attached");
        assert_eq!(active.revision, "v1");
        assert!(limited.wait > Duration::ZERO);

        clock.set(1_000);
        assert!(engine.get_quota(&request).unwrap().is_allowed());
    }

    #[tokio::test]
    async fn second_rule_denial_rolls_back_the_first() {
        let clock = ManualClock::at(0);
        let mut generous = local_rule("vA", 100);
        generous.amounts = vec![Amount { max: 100, validity: Duration::from_secs(60) }];
        let strict = local_rule("vB", 1);
        let engine =
            engine_with(vec![generous, strict], clock.clone(), Arc::new(NullSink));
        let request = QuotaRequest::new("orders", "GET");

        assert!(engine.get_quota(&request).unwrap().is_allowed());
        let limited = engine.get_quota(&request).unwrap();
        assert_eq!(limited.code, QuotaCode::Limited);
        assert_eq!(limited.active_rule.unwrap().revision, "vB");

        // The denied call must not have consumed from vA. After the strict
        // window rolls, two allowed calls in total have been charged to vA.
        clock.set(1_000);
        assert!(engine.get_quota(&request).unwrap().is_allowed());
        let set = engine.inner.sets.get("orders").unwrap().clone();
        let window_a = set.get("vA", "").unwrap();
        assert_eq!(window_a.remaining(), vec![98]);
    }

    #[tokio::test]
    async fn events_fire_only_on_code_transitions() {
        let clock = ManualClock::at(0);
        let sink = MemorySink::with_capacity(16);
        let engine = engine_with(
            vec![local_rule("v1", 2)],
            clock.clone(),
            Arc::new(sink.clone()),
        );
        let request = QuotaRequest::new("orders", "GET").with_caller("checkout");

        let _ = engine.get_quota(&request).unwrap(); // none -> pass
        let _ = engine.get_quota(&request).unwrap(); // pass (no event)
        let _ = engine.get_quota(&request).unwrap(); // pass -> limited
        let _ = engine.get_quota(&request).unwrap(); // limited (no event)
        clock.set(1_000);
        let _ = engine.get_quota(&request).unwrap(); // limited -> pass

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].previous, None);
        assert_eq!(events[0].current, OutcomeCode::Pass);
        assert_eq!(events[1].previous, Some(OutcomeCode::Pass));
        assert_eq!(events[1].current, OutcomeCode::Limited);
        assert_eq!(events[2].previous, Some(OutcomeCode::Limited));
        assert_eq!(events[2].current, OutcomeCode::Pass);
        assert_eq!(events[0].caller.as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn disabled_and_empty_rules_are_skipped() {
        let mut disabled = local_rule("v1", 1);
        disabled.disabled = true;
        let empty = Rule::rejecting("orders", "v2", vec![]);
        let engine = engine_with(vec![disabled, empty], ManualClock::at(0), Arc::new(NullSink));
        let result = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.info, reason::NO_RULE);
        assert_eq!(engine.window_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_behavior_skips_that_rule_only() {
        let mut exotic = local_rule("v1", 1);
        exotic.behavior = "warmup".into();
        let normal = local_rule("v2", 5);
        let engine =
            engine_with(vec![exotic, normal], ManualClock::at(0), Arc::new(NullSink));
        let request = QuotaRequest::new("orders", "GET");
        for _ in 0..5 {
            assert!(engine.get_quota(&request).unwrap().is_allowed());
        }
        // The exotic rule (amount 1) never limited anything; the normal one does.
        assert_eq!(engine.get_quota(&request).unwrap().code, QuotaCode::Limited);
    }

    #[tokio::test]
    async fn spread_rule_tracks_labels_independently() {
        let clock = ManualClock::at(0);
        let mut spread = local_rule("v1", 1);
        spread.matchers =
            vec![Matcher::pattern(MatchSource::Header("tenant".into()), ".*")];
        let engine = engine_with(vec![spread], clock, Arc::new(NullSink));

        let acme = QuotaRequest::new("orders", "GET").with_header("tenant", "acme");
        let globex = QuotaRequest::new("orders", "GET").with_header("tenant", "globex");
        assert!(engine.get_quota(&acme).unwrap().is_allowed());
        assert!(engine.get_quota(&globex).unwrap().is_allowed());
        assert_eq!(engine.get_quota(&acme).unwrap().code, QuotaCode::Limited);
        assert_eq!(engine.window_count(), 2);
    }

    #[tokio::test]
    async fn concurrency_rule_returns_a_guard_that_releases() {
        let clock = ManualClock::at(0);
        let mut rule = local_rule("v1", 1);
        rule.resource = ResourceKind::Concurrency;
        let engine = engine_with(vec![rule], clock, Arc::new(NullSink));
        let request = QuotaRequest::new("orders", "GET");

        let first = engine.get_quota(&request).unwrap();
        assert!(first.is_allowed());
        let guard = first.guard.expect("concurrency rules hand out a guard");
        assert_eq!(engine.get_quota(&request).unwrap().code, QuotaCode::Limited);

        guard.release();
        assert!(engine.get_quota(&request).unwrap().is_allowed());
    }

    #[tokio::test]
    async fn rule_deletion_drops_windows() {
        let clock = ManualClock::at(0);
        let engine = engine_with(vec![local_rule("v1", 10)], clock, Arc::new(NullSink));
        let request = QuotaRequest::new("orders", "GET");
        assert!(engine.get_quota(&request).unwrap().is_allowed());
        assert_eq!(engine.window_count(), 1);
        engine.on_rules_changed("orders", &["v1".to_string()]);
        assert_eq!(engine.window_count(), 0);
    }

    #[tokio::test]
    async fn serialized_allocation_still_decides_correctly() {
        let source = Arc::new(InMemoryRuleSource::new());
        source.put("orders", vec![local_rule("v1", 3)]);
        let engine = QuotaEngine::builder(source)
            .clock(Arc::new(ManualClock::at(0)))
            .serialized_allocation(true)
            .build()
            .unwrap();
        let request = QuotaRequest::new("orders", "GET");
        for _ in 0..3 {
            assert!(engine.get_quota(&request).unwrap().is_allowed());
        }
        assert_eq!(engine.get_quota(&request).unwrap().code, QuotaCode::Limited);
    }

    #[tokio::test]
    async fn shutdown_clears_all_windows() {
        let engine =
            engine_with(vec![local_rule("v1", 10)], ManualClock::at(0), Arc::new(NullSink));
        let _ = engine.get_quota(&QuotaRequest::new("orders", "GET")).unwrap();
        assert_eq!(engine.window_count(), 1);
        engine.shutdown();
        assert_eq!(engine.window_count(), 0);
    }
}
