//! Remote counter channel: one persistent stream to one authority node.
//!
//! A channel multiplexes every counter whose hash key lands on its node. All
//! outbound frames funnel through a single writer task fed by an mpsc queue,
//! so writes are never interleaved; all replies are decoded by a single
//! reader task, so bucket updates for a counter are applied strictly in
//! receipt order. A third task probes the node's clock on an adaptive
//! schedule and maintains the local-to-remote offset used to convert every
//! server timestamp before it touches a bucket.
//!
//! Transport errors mark the channel terminated; the connector recreates it
//! lazily on the next sync cycle, never on the caller's thread.

use crate::bucket::RemoteUpdate;
use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::TransportError;
use crate::resolver::RemoteNode;
use crate::timesync::{estimate_offset, to_local_ms, ProbeInterval};
use crate::transport::{
    AuthoritySink, AuthoritySource, AuthorityTransport, CounterKey, CounterReply, CounterRequest,
    DurationGrant, InitRequest, ReportRequest,
};
use crate::window::QuotaWindow;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const OUTBOUND_QUEUE: usize = 1024;

/// Per-(service, label) initialization bookkeeping.
#[derive(Debug, Default)]
struct InitRecord {
    /// An init was sent and no reply has arrived yet.
    pending: bool,
    /// The authority acknowledged this counter.
    initialized: bool,
    /// Remote counter identifiers per validity duration (millis).
    counter_ids: HashMap<u64, u64>,
    /// When the last init was sent, for timeout-driven re-issue.
    last_sent_ms: u64,
    /// Inits sent without any reply; answered inits reset this.
    attempts: u32,
}

/// One live stream to one authority node.
pub struct RemoteCounterChannel {
    node: RemoteNode,
    outbound: mpsc::Sender<CounterRequest>,
    records: DashMap<CounterKey, InitRecord>,
    windows: DashMap<CounterKey, Weak<QuotaWindow>>,
    offset_ms: AtomicI64,
    terminated: AtomicBool,
    shut: AtomicBool,
    refs: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config: Arc<QuotaConfig>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RemoteCounterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCounterChannel")
            .field("node", &self.node)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("counters", &self.records.len())
            .finish()
    }
}

impl RemoteCounterChannel {
    /// Connect and spawn the writer, reader, and time-probe tasks.
    pub async fn open(
        node: RemoteNode,
        transport: Arc<dyn AuthorityTransport>,
        config: Arc<QuotaConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, TransportError> {
        let (sink, source) = transport.connect(&node).await?;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let channel = Arc::new(Self {
            node,
            outbound: tx,
            records: DashMap::new(),
            windows: DashMap::new(),
            offset_ms: AtomicI64::new(0),
            terminated: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            config,
            clock,
        });
        let mut tasks = channel.tasks.lock().expect("channel task slot poisoned");
        tasks.push(tokio::spawn(writer_loop(Arc::clone(&channel), sink, rx)));
        tasks.push(tokio::spawn(reader_loop(Arc::clone(&channel), source)));
        tasks.push(tokio::spawn(probe_loop(Arc::clone(&channel), transport)));
        drop(tasks);
        Ok(channel)
    }

    pub fn node(&self) -> &RemoteNode {
        &self.node
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Current local-to-remote clock offset in millis.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Connector-side reference counting; one ref per bound counter key.
    pub fn acquire_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release_ref(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Track a window so replies can reach its bucket.
    pub fn register(&self, window: &Arc<QuotaWindow>) {
        let key = window.key().clone();
        self.windows.insert(key.clone(), Arc::downgrade(window));
        self.records.entry(key).or_default();
    }

    /// Drop this key's pending record so a rebound key does not leak here.
    pub fn remove_record(&self, key: &CounterKey) {
        self.records.remove(key);
        if let Some((_, weak)) = self.windows.remove(key) {
            if let Some(window) = weak.upgrade() {
                window.reset_remote_init();
            }
        }
    }

    /// Number of tracked initialization records (diagnostics and tests).
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// One sync cycle for a window: first an init handshake (re-issued after
    /// `sync_timeout`, duplicates suppressed, at most `max_retry` unanswered
    /// sends before the stream is presumed dead), then periodic usage
    /// reports.
    pub async fn sync(&self, window: &Arc<QuotaWindow>) {
        if self.is_terminated() {
            return;
        }
        let key = window.key().clone();
        let now = self.clock.now_millis();
        enum Action {
            SendInit,
            SendReport,
            GiveUp,
            Skip,
        }
        let action = {
            let mut record = self.records.entry(key.clone()).or_default();
            if record.initialized {
                Action::SendReport
            } else if record.pending
                && now.saturating_sub(record.last_sent_ms)
                    < self.config.sync_timeout.as_millis() as u64
            {
                Action::Skip
            } else if record.attempts >= self.config.max_retry {
                Action::GiveUp
            } else {
                record.pending = true;
                record.last_sent_ms = now;
                record.attempts += 1;
                Action::SendInit
            }
        };
        match action {
            Action::Skip => {}
            Action::GiveUp => {
                warn!(
                    target: "tollgate::channel",
                    node = %self.node,
                    key = %key,
                    retries = self.config.max_retry,
                    "init handshake exhausted retries, stream presumed dead"
                );
                self.terminated.store(true, Ordering::Release);
            }
            Action::SendInit => {
                let request = CounterRequest::Init(InitRequest {
                    key,
                    amounts: window.rule().amounts.clone(),
                });
                self.enqueue(request);
            }
            Action::SendReport => {
                let used = window
                    .take_report()
                    .into_iter()
                    .map(|u| (u.duration, u.used))
                    .collect();
                let request =
                    CounterRequest::Report(ReportRequest { key, used, timestamp_ms: now });
                self.enqueue(request);
            }
        }
    }

    /// Idempotent teardown: stop the tasks, flush the records, and force any
    /// surviving window to re-init cleanly if it gets rebound later.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminated.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("channel task slot poisoned"));
        for task in tasks {
            task.abort();
        }
        for entry in self.windows.iter() {
            if let Some(window) = entry.value().upgrade() {
                window.reset_remote_init();
            }
        }
        self.records.clear();
        self.windows.clear();
        debug!(target: "tollgate::channel", node = %self.node, "channel shut down");
    }

    fn enqueue(&self, request: CounterRequest) {
        match self.outbound.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                debug!(
                    target: "tollgate::channel",
                    node = %self.node,
                    key = %request.key(),
                    "outbound queue full, frame dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.terminated.store(true, Ordering::Release);
            }
        }
    }

    fn grants_to_updates(&self, grants: &[DurationGrant], server_time_ms: u64, clients: u32) -> Vec<RemoteUpdate> {
        let as_of_local_ms = to_local_ms(server_time_ms, self.offset_ms());
        grants
            .iter()
            .map(|g| RemoteUpdate {
                remaining: g.remaining,
                client_count: clients,
                as_of_local_ms,
                duration: g.duration,
            })
            .collect()
    }

    fn handle_reply(&self, reply: CounterReply) {
        match reply {
            CounterReply::Init(reply) => {
                if !reply.code.is_success() {
                    warn!(
                        target: "tollgate::channel",
                        node = %self.node,
                        key = %reply.key,
                        code = ?reply.code,
                        "init rejected by authority"
                    );
                    if let Some(mut record) = self.records.get_mut(&reply.key) {
                        // The authority is alive; let the next sync cycle
                        // re-issue the handshake with a fresh retry budget.
                        record.pending = false;
                        record.attempts = 0;
                    }
                    return;
                }
                if let Some(mut record) = self.records.get_mut(&reply.key) {
                    record.pending = false;
                    record.attempts = 0;
                    record.initialized = true;
                    record.counter_ids = reply
                        .grants
                        .iter()
                        .map(|g| (g.duration.as_millis().max(1) as u64, g.counter_id))
                        .collect();
                }
                let updates =
                    self.grants_to_updates(&reply.grants, reply.server_time_ms, reply.client_count);
                if let Some(window) = self.upgrade_window(&reply.key) {
                    window.apply_remote_init(&updates);
                }
            }
            CounterReply::Report(reply) => {
                if !reply.code.is_success() {
                    warn!(
                        target: "tollgate::channel",
                        node = %self.node,
                        key = %reply.key,
                        code = ?reply.code,
                        "report rejected by authority"
                    );
                    return;
                }
                let updates =
                    self.grants_to_updates(&reply.grants, reply.server_time_ms, reply.client_count);
                if let Some(window) = self.upgrade_window(&reply.key) {
                    window.apply_remote_update(&updates);
                }
            }
        }
    }

    fn upgrade_window(&self, key: &CounterKey) -> Option<Arc<QuotaWindow>> {
        let weak = self.windows.get(key)?.clone();
        match weak.upgrade() {
            Some(window) => Some(window),
            None => {
                // The window is gone; stop tracking it.
                self.windows.remove(key);
                self.records.remove(key);
                None
            }
        }
    }
}

async fn writer_loop(
    channel: Arc<RemoteCounterChannel>,
    mut sink: Box<dyn AuthoritySink>,
    mut rx: mpsc::Receiver<CounterRequest>,
) {
    while let Some(request) = rx.recv().await {
        if let Err(err) = sink.send(request).await {
            warn!(target: "tollgate::channel", node = %channel.node, %err, "stream write failed");
            channel.terminated.store(true, Ordering::Release);
            break;
        }
    }
}

async fn reader_loop(channel: Arc<RemoteCounterChannel>, mut source: Box<dyn AuthoritySource>) {
    loop {
        match source.recv().await {
            Ok(Some(reply)) => channel.handle_reply(reply),
            Ok(None) => {
                debug!(target: "tollgate::channel", node = %channel.node, "stream closed by remote");
                channel.terminated.store(true, Ordering::Release);
                break;
            }
            Err(err) => {
                warn!(target: "tollgate::channel", node = %channel.node, %err, "stream read failed");
                channel.terminated.store(true, Ordering::Release);
                break;
            }
        }
    }
}

async fn probe_loop(channel: Arc<RemoteCounterChannel>, transport: Arc<dyn AuthorityTransport>) {
    let mut interval = ProbeInterval::new(
        channel.config.probe_interval_min,
        channel.config.probe_interval_max,
    );
    loop {
        tokio::time::sleep(interval.current()).await;
        if channel.is_terminated() {
            break;
        }
        let sent = channel.clock.now_millis();
        match transport.time_probe(&channel.node).await {
            Ok(reply) => {
                let received = channel.clock.now_millis();
                let offset = estimate_offset(
                    sent,
                    received,
                    reply.server_time_ms,
                    channel.config.rtt_apportionment,
                );
                channel.offset_ms.store(offset, Ordering::Release);
                interval.observe(offset);
            }
            Err(err) => {
                debug!(target: "tollgate::channel", node = %channel.node, %err, "time probe failed");
                interval.reset();
            }
        }
    }
}
