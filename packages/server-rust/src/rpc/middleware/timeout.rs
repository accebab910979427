//! Timeout middleware for dispatched requests.
//!
//! Fails requests whose handler exceeds the responder's deadline with
//! `DispatchError::Timeout`, so the caller gets an error response instead of
//! waiting out its own timeout.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tower::{Layer, Service};

use crate::rpc::router::{Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with a fixed handler deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the handler deadline.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Dispatch> for TimeoutService<S>
where
    S: Service<Dispatch, Response = Bytes, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Bytes;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Bytes, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Dispatch) -> Self::Future {
        let timeout = self.timeout;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
