use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::transport::{
    CounterReply, CounterRequest, DurationGrant, InitReply, ReplyCode, ReportReply,
    TimeProbeReply,
};
use tollgate::{
    AuthoritySink, AuthoritySource, AuthorityTransport, Clock, RemoteNode, SystemClock,
    TransportError,
};

/// Scripted counting authority: answers every init and report in-process.
#[derive(Debug)]
pub struct MockAuthority {
    /// Fleet-wide remaining tokens granted in every successful reply.
    pub remaining: u64,
    /// When set, init handshakes are rejected.
    pub fail_init: AtomicBool,
    /// Every frame any connection ever carried.
    pub requests: Arc<Mutex<Vec<CounterRequest>>>,
    /// Time probes answered.
    pub probes: AtomicUsize,
}

impl MockAuthority {
    pub fn granting(remaining: u64) -> Arc<Self> {
        Arc::new(Self {
            remaining,
            fail_init: AtomicBool::new(false),
            requests: Arc::new(Mutex::new(Vec::new())),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn rejecting_inits() -> Arc<Self> {
        let authority = Self::granting(0);
        authority.fail_init.store(true, Ordering::SeqCst);
        authority
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &CounterRequest) -> CounterReply {
        let now = SystemClock.now_millis();
        match request {
            CounterRequest::Init(init) => {
                if self.fail_init.load(Ordering::SeqCst) {
                    return CounterReply::Init(InitReply {
                        code: ReplyCode::Failure("counter store unavailable".into()),
                        key: init.key.clone(),
                        grants: vec![],
                        client_count: 0,
                        server_time_ms: now,
                    });
                }
                CounterReply::Init(InitReply {
                    code: ReplyCode::Success,
                    key: init.key.clone(),
                    grants: init
                        .amounts
                        .iter()
                        .enumerate()
                        .map(|(i, a)| DurationGrant {
                            duration: a.validity,
                            counter_id: i as u64 + 1,
                            remaining: self.remaining,
                        })
                        .collect(),
                    client_count: 1,
                    server_time_ms: now,
                })
            }
            CounterRequest::Report(report) => CounterReply::Report(ReportReply {
                code: ReplyCode::Success,
                key: report.key.clone(),
                grants: report
                    .used
                    .iter()
                    .enumerate()
                    .map(|(i, (duration, _))| DurationGrant {
                        duration: *duration,
                        counter_id: i as u64 + 1,
                        remaining: self.remaining,
                    })
                    .collect(),
                client_count: 1,
                server_time_ms: now,
            }),
        }
    }
}

struct MockSink {
    authority: Arc<MockAuthority>,
    pending: Arc<Mutex<VecDeque<CounterRequest>>>,
}

#[async_trait]
impl AuthoritySink for MockSink {
    async fn send(&mut self, request: CounterRequest) -> Result<(), TransportError> {
        self.authority.requests.lock().unwrap().push(request.clone());
        self.pending.lock().unwrap().push_back(request);
        Ok(())
    }
}

struct MockSource {
    authority: Arc<MockAuthority>,
    pending: Arc<Mutex<VecDeque<CounterRequest>>>,
}

#[async_trait]
impl AuthoritySource for MockSource {
    async fn recv(&mut self) -> Result<Option<CounterReply>, TransportError> {
        loop {
            let request = self.pending.lock().unwrap().pop_front();
            if let Some(request) = request {
                return Ok(Some(self.authority.reply_for(&request)));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[derive(Debug)]
pub struct MockTransport {
    authority: Arc<MockAuthority>,
}

impl MockTransport {
    pub fn new(authority: Arc<MockAuthority>) -> Arc<Self> {
        Arc::new(Self { authority })
    }
}

#[async_trait]
impl AuthorityTransport for MockTransport {
    async fn connect(
        &self,
        _node: &RemoteNode,
    ) -> Result<(Box<dyn AuthoritySink>, Box<dyn AuthoritySource>), TransportError> {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        Ok((
            Box::new(MockSink { authority: self.authority.clone(), pending: pending.clone() }),
            Box::new(MockSource { authority: self.authority.clone(), pending }),
        ))
    }

    async fn time_probe(&self, _node: &RemoteNode) -> Result<TimeProbeReply, TransportError> {
        self.authority.probes.fetch_add(1, Ordering::SeqCst);
        Ok(TimeProbeReply { server_time_ms: SystemClock.now_millis() })
    }
}
