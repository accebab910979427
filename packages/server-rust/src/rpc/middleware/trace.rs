//! Tracing middleware for dispatched requests.
//!
//! Wraps each dispatch in a span carrying the routing key and correlation id
//! and records duration and outcome when the handler finishes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::rpc::router::{Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// TraceLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments dispatches with `tracing` spans.
#[derive(Debug, Clone, Copy)]
pub struct TraceLayer;

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService { inner }
    }
}

// ---------------------------------------------------------------------------
// TraceService
// ---------------------------------------------------------------------------

/// Service wrapper that records dispatch duration and outcome.
#[derive(Debug, Clone)]
pub struct TraceService<S> {
    inner: S,
}

impl<S> Service<Dispatch> for TraceService<S>
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
        let span = info_span!(
            "rpc_dispatch",
            routing_key = %req.routing_key,
            correlation_id = %req.correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.kind().as_str(),
                };

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                match &result {
                    Err(DispatchError::UnknownRoute { key }) => {
                        tracing::warn!(routing_key = %key, "unknown route");
                    }
                    Err(e) => tracing::info!(duration_ms, outcome, error = %e, "dispatch failed"),
                    Ok(_) => tracing::debug!(duration_ms, outcome, "dispatch complete"),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
