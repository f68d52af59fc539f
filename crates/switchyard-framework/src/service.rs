//! Tower integration.
//!
//! [`RouterService`] exposes a [`Router`] as a `tower::Service<Envelope>` so
//! adapters built on tower (hyper, tonic, axum, ...) can stack their own
//! layers in front of the dispatch boundary. The service never fails: like
//! [`Router::dispatch`], it turns errors into `error` envelopes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tower::{ServiceBuilder, ServiceExt};
//!
//! let svc = ServiceBuilder::new()
//!     .concurrency_limit(64)
//!     .service(RouterService::new(router));
//! let outcome = svc.oneshot(envelope).await?;
//! ```

use std::convert::Infallible;
use std::task::{Context, Poll};

use switchyard_core::{BoxFuture, Envelope, Outcome, Router};
use tower::Service;
use tower::util::BoxCloneSyncService;

/// A type-erased, `Clone + Send + Sync` dispatch service.
pub type BoxedRouterService = BoxCloneSyncService<Envelope, Outcome, Infallible>;

/// A tower [`Service`] dispatching envelopes through a router.
#[derive(Debug, Clone)]
pub struct RouterService {
    router: Router,
}

impl RouterService {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Erases the service type.
    pub fn boxed(self) -> BoxedRouterService {
        BoxCloneSyncService::new(self)
    }
}

impl From<Router> for RouterService {
    fn from(router: Router) -> Self {
        Self::new(router)
    }
}

impl Service<Envelope> for RouterService {
    type Response = Outcome;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Outcome, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let router = self.router.clone();
        Box::pin(async move { Ok(router.dispatch(envelope).await) })
    }
}
