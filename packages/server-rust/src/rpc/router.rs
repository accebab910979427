//! Route table: dispatches RPC requests to handlers by routing key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::{CorrelationId, RemoteErrorKind};
use tower::Service;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Error returned by a handler. The message reaches the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability invoked for one routing key: payload in, payload or error out.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, payload: Bytes) -> Result<Bytes, HandlerError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wraps `f` so it can be registered on a [`Router`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn call(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        (self.0)(payload).await
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Errors raised while building the route table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("route `{key}` is already registered")]
    DuplicateRoute { key: String },
}

/// Maps routing keys to handlers.
///
/// Built once at startup; duplicate keys are rejected so the table is
/// deterministic. Share it behind an `Arc` once built.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Register a handler for the given routing key.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::DuplicateRoute` if `key` is already taken.
    pub fn register<H: Handler>(
        &mut self,
        key: impl Into<String>,
        handler: H,
    ) -> Result<&mut Self, RouterError> {
        let key = key.into();
        if self.routes.contains_key(&key) {
            return Err(RouterError::DuplicateRoute { key });
        }
        self.routes.insert(key, Arc::new(handler));
        Ok(self)
    }

    /// Looks up the handler for `key`.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.routes.get(key).cloned()
    }

    /// Registered routing keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("routes", &self.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A decoded request on its way to a handler.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub routing_key: String,
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

/// Why a dispatch produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown route: {key}")]
    UnknownRoute { key: String },
    #[error("{0}")]
    Handler(#[from] HandlerError),
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DispatchError {
    /// The error indicator kind reported to the caller.
    #[must_use]
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::UnknownRoute { .. } => RemoteErrorKind::UnknownRoute,
            Self::Handler(_) => RemoteErrorKind::Handler,
            Self::Timeout { .. } => RemoteErrorKind::Timeout,
        }
    }

    /// The message reported to the caller. Handler messages pass through
    /// untouched.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Handler(e) => e.message.clone(),
            other => other.to_string(),
        }
    }
}

type DispatchFuture = Pin<Box<dyn Future<Output = Result<Bytes, DispatchError>> + Send>>;

/// Tower service resolving each [`Dispatch`] through a shared [`Router`].
#[derive(Debug, Clone)]
pub struct RouteService {
    router: Arc<Router>,
}

impl RouteService {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

impl Service<Dispatch> for RouteService {
    type Response = Bytes;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The route table is immutable; handlers carry no readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Dispatch) -> Self::Future {
        match self.router.resolve(&req.routing_key) {
            Some(handler) => Box::pin(async move { Ok(handler.call(req.payload).await?) }),
            None => Box::pin(async move {
                Err(DispatchError::UnknownRoute {
                    key: req.routing_key,
                })
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
