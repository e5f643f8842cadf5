//! Per-destination window bookkeeping.
//!
//! A [`WindowSet`] maps rule revisions to containers. Exact-match rules pin
//! a single window per revision; spread rules hold an inner label-to-window
//! map that grows with observed label combinations. The set also owns the
//! connector its windows sync through, so retiring windows can tear their
//! channels down.

use crate::connector::Connector;
use crate::rule::Rule;
use crate::transport::CounterKey;
use crate::window::QuotaWindow;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Windows of one rule revision.
#[derive(Debug)]
pub enum WindowContainer {
    /// Exact-match rule: a single window, no per-label fan-out.
    Pinned(Arc<QuotaWindow>),
    /// Spread rule: one window per observed label combination.
    Spread(DashMap<String, Arc<QuotaWindow>>),
}

impl WindowContainer {
    fn windows(&self) -> Vec<Arc<QuotaWindow>> {
        match self {
            WindowContainer::Pinned(w) => vec![Arc::clone(w)],
            WindowContainer::Spread(map) => map.iter().map(|e| Arc::clone(e.value())).collect(),
        }
    }

    fn all_expired(&self, now_ms: u64) -> bool {
        match self {
            WindowContainer::Pinned(w) => w.is_expired(now_ms),
            WindowContainer::Spread(map) => map.iter().all(|e| e.value().is_expired(now_ms)),
        }
    }
}

/// All quota windows for one destination service.
#[derive(Debug)]
pub struct WindowSet {
    service: String,
    containers: DashMap<String, Arc<WindowContainer>>,
    connector: Option<Arc<Connector>>,
}

impl WindowSet {
    pub fn new(service: impl Into<String>, connector: Option<Arc<Connector>>) -> Self {
        Self { service: service.into(), containers: DashMap::new(), connector }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn connector(&self) -> Option<&Arc<Connector>> {
        self.connector.as_ref()
    }

    /// Window for `(rule.revision, label)`, created exactly once per key.
    ///
    /// `make` builds the window on first sight; concurrent callers for the
    /// same key all receive the first writer's window.
    pub fn get_or_create<F>(&self, rule: &Arc<Rule>, label: &str, make: F) -> Arc<QuotaWindow>
    where
        F: Fn(CounterKey) -> Arc<QuotaWindow>,
    {
        let spread = rule.is_spread();
        let container = self
            .containers
            .entry(rule.revision.clone())
            .or_insert_with(|| {
                if spread {
                    Arc::new(WindowContainer::Spread(DashMap::new()))
                } else {
                    let key = CounterKey::new(&self.service, &rule.revision, "");
                    Arc::new(WindowContainer::Pinned(make(key)))
                }
            })
            .clone();
        match container.as_ref() {
            WindowContainer::Pinned(window) => Arc::clone(window),
            WindowContainer::Spread(map) => map
                .entry(label.to_string())
                .or_insert_with(|| {
                    let key = CounterKey::new(&self.service, &rule.revision, label);
                    make(key)
                })
                .clone(),
        }
    }

    /// Fetch without creating; used by tests and diagnostics.
    pub fn get(&self, revision: &str, label: &str) -> Option<Arc<QuotaWindow>> {
        let container = self.containers.get(revision)?.clone();
        match container.as_ref() {
            WindowContainer::Pinned(w) => Some(Arc::clone(w)),
            WindowContainer::Spread(map) => map.get(label).map(|e| Arc::clone(e.value())),
        }
    }

    /// Remove the containers of superseded or deleted revisions, uniniting
    /// every window inside and releasing their channel bindings.
    pub fn delete_revisions(&self, revisions: &HashSet<String>) -> usize {
        let mut removed = 0;
        for revision in revisions {
            if let Some((_, container)) = self.containers.remove(revision) {
                removed += 1;
                self.retire(&container);
            }
        }
        removed
    }

    /// Retire containers whose windows are all idle past their expiry
    /// threshold. A container with one live window is kept in full, which is
    /// the common case for spread rules. Returns reclaimed container count.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let candidates: Vec<String> = self
            .containers
            .iter()
            .filter(|e| e.value().all_expired(now_ms))
            .map(|e| e.key().clone())
            .collect();
        let mut reclaimed = 0;
        for revision in candidates {
            // Re-check under removal so a window touched in between survives.
            let removed = self
                .containers
                .remove_if(&revision, |_, container| container.all_expired(now_ms));
            if let Some((_, container)) = removed {
                reclaimed += 1;
                self.retire(&container);
            }
        }
        if reclaimed > 0 {
            info!(
                target: "tollgate::window_set",
                service = %self.service,
                reclaimed,
                "idle rule containers reclaimed"
            );
        }
        reclaimed
    }

    /// Total windows currently tracked.
    pub fn window_count(&self) -> usize {
        self.containers
            .iter()
            .map(|e| match e.value().as_ref() {
                WindowContainer::Pinned(_) => 1,
                WindowContainer::Spread(map) => map.len(),
            })
            .sum()
    }

    pub fn revision_count(&self) -> usize {
        self.containers.len()
    }

    /// Tear down everything (engine shutdown).
    pub fn clear(&self) {
        let containers: Vec<Arc<WindowContainer>> =
            self.containers.iter().map(|e| e.value().clone()).collect();
        self.containers.clear();
        for container in containers {
            self.retire(&container);
        }
    }

    fn retire(&self, container: &WindowContainer) {
        for window in container.windows() {
            window.uninit();
            if let Some(connector) = &self.connector {
                connector.release(window.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::rule::{Amount, MatchSource, Matcher};
    use crate::window::{WindowMode, WindowState};
    use std::time::Duration;

    fn rule(revision: &str, spread: bool) -> Arc<Rule> {
        let mut rule = Rule::rejecting(
            "orders",
            revision,
            vec![Amount { max: 10, validity: Duration::from_secs(1) }],
        );
        if spread {
            rule.matchers = vec![Matcher::pattern(MatchSource::Header("tenant".into()), ".*")];
        }
        Arc::new(rule)
    }

    fn maker(clock: ManualClock) -> impl Fn(CounterKey) -> Arc<QuotaWindow> {
        move |key| {
            let rule = rule(&key.revision, false);
            Arc::new(QuotaWindow::new(
                key,
                rule,
                WindowMode::LocalOnly,
                Duration::from_secs(1),
                Arc::new(clock.clone()),
            ))
        }
    }

    #[test]
    fn exact_rule_pins_one_window_for_all_labels() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let r = rule("v1", false);
        let a = set.get_or_create(&r, "", &maker(clock.clone()));
        let b = set.get_or_create(&r, "ignored", &maker(clock));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(set.window_count(), 1);
    }

    #[test]
    fn spread_rule_fans_out_per_label() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let r = rule("v1", true);
        let acme = set.get_or_create(&r, "header:tenant:acme", &maker(clock.clone()));
        let globex = set.get_or_create(&r, "header:tenant:globex", &maker(clock.clone()));
        let acme_again = set.get_or_create(&r, "header:tenant:acme", &maker(clock));
        assert!(!Arc::ptr_eq(&acme, &globex));
        assert!(Arc::ptr_eq(&acme, &acme_again));
        assert_eq!(set.window_count(), 2);
    }

    #[test]
    fn revisions_are_isolated() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let v1 = set.get_or_create(&rule("v1", false), "", &maker(clock.clone()));
        let v2 = set.get_or_create(&rule("v2", false), "", &maker(clock));
        assert!(!Arc::ptr_eq(&v1, &v2));
        assert_eq!(set.revision_count(), 2);
    }

    #[test]
    fn delete_revisions_uninits_windows() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let window = set.get_or_create(&rule("v1", false), "", &maker(clock));
        let removed = set.delete_revisions(&HashSet::from(["v1".to_string()]));
        assert_eq!(removed, 1);
        assert_eq!(window.state(), WindowState::Deleted);
        assert!(set.get("v1", "").is_none());
    }

    #[test]
    fn sweep_reclaims_only_fully_expired_containers() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let r = rule("v1", true);
        let stale = set.get_or_create(&r, "header:tenant:acme", &maker(clock.clone()));
        let _fresh = set.get_or_create(&r, "header:tenant:globex", &maker(clock.clone()));

        // Touch only one of the two windows late.
        clock.set(10_000);
        let fresh = set.get("v1", "header:tenant:globex").unwrap();
        let _ = fresh.allocate(1);

        // stale idle since 0, fresh accessed at 10_000; threshold is 2s.
        assert_eq!(set.sweep(10_500), 0, "container with a live window is kept in full");
        assert_eq!(set.window_count(), 2);
        assert_eq!(stale.state(), WindowState::Created);

        assert_eq!(set.sweep(13_000), 1);
        assert_eq!(set.window_count(), 0);
        assert_eq!(stale.state(), WindowState::Deleted);
        assert_eq!(fresh.state(), WindowState::Deleted);
    }

    #[test]
    fn concurrent_creation_is_exactly_once() {
        let set = Arc::new(WindowSet::new("orders", None));
        let clock = ManualClock::at(0);
        let r = rule("v1", true);
        let made = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = Arc::clone(&set);
            let r = Arc::clone(&r);
            let made = Arc::clone(&made);
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                set.get_or_create(&r, "header:tenant:acme", |key| {
                    made.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Arc::new(QuotaWindow::new(
                        key,
                        r.clone(),
                        WindowMode::LocalOnly,
                        Duration::from_secs(1),
                        Arc::new(clock.clone()),
                    ))
                })
            }));
        }
        let windows: Vec<Arc<QuotaWindow>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(made.load(std::sync::atomic::Ordering::SeqCst), 1);
        for w in &windows[1..] {
            assert!(Arc::ptr_eq(&windows[0], w));
        }
    }

    #[test]
    fn clear_retires_everything() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let w = set.get_or_create(&rule("v1", false), "", &maker(clock));
        set.clear();
        assert_eq!(set.window_count(), 0);
        assert_eq!(w.state(), WindowState::Deleted);
    }

    #[test]
    fn sweep_threshold_respects_last_access() {
        let set = WindowSet::new("orders", None);
        let clock = ManualClock::at(0);
        let w = set.get_or_create(&rule("v1", false), "", &maker(clock.clone()));
        clock.set(1_000);
        let _ = w.allocate(1);
        // 1s validity + 1s slack after the last access at t=1000.
        assert_eq!(set.sweep(3_000), 0);
        assert_eq!(set.sweep(3_100), 1);
    }
}
