//! Tower middleware enforcing quota decisions around a wrapped service.

use crate::error::GateError;
use crate::flow::QuotaEngine;
use crate::rule::QuotaRequest;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests through a [`QuotaEngine`].
///
/// The extractor turns each inbound request into the [`QuotaRequest`] view
/// the engine matches rules against.
#[derive(Clone, Debug)]
pub struct QuotaLayer<F> {
    engine: QuotaEngine,
    describe: Arc<F>,
}

impl<F> QuotaLayer<F> {
    pub fn new(engine: QuotaEngine, describe: F) -> Self {
        Self { engine, describe: Arc::new(describe) }
    }
}

impl<S, F> Layer<S> for QuotaLayer<F> {
    type Service = QuotaService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        QuotaService {
            inner: service,
            engine: self.engine.clone(),
            describe: self.describe.clone(),
        }
    }
}

/// Middleware service that asks the engine before every call.
#[derive(Clone, Debug)]
pub struct QuotaService<S, F> {
    inner: S,
    engine: QuotaEngine,
    describe: Arc<F>,
}

impl<S, F, Req> Service<Req> for QuotaService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    F: Fn(&Req) -> QuotaRequest + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let quota = (self.describe)(&req);
        let engine = self.engine.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match engine.get_quota(&quota) {
                Ok(result) if result.is_allowed() => {
                    // Concurrency permits stay held for the inner call.
                    let _guard = result.guard;
                    inner.call(req).await.map_err(GateError::Inner)
                }
                Ok(result) => Err(GateError::Limited {
                    wait: result.wait,
                    rule: result.active_rule.map(|r| r.revision.clone()),
                }),
                Err(err) => Err(GateError::Quota(err)),
            }
        })
    }
}
