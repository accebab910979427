//! Pipeline composition: wraps the route table with the dispatch middleware.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::timeout::{TimeoutLayer, TimeoutService};
use super::trace::{TraceLayer, TraceService};
use crate::rpc::router::{RouteService, Router};

/// The composed dispatch service. Cheap to clone; one clone per request.
pub type DispatchPipeline = TraceService<TimeoutService<RouteService>>;

/// Build the dispatch pipeline around a shared route table.
///
/// Layer order (outermost to innermost):
/// 1. `TraceLayer` -- span per request, records the final outcome including timeouts
/// 2. `TimeoutLayer` -- enforces the handler deadline
#[must_use]
pub fn build_dispatch_pipeline(router: Arc<Router>, handler_timeout: Duration) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(TraceLayer)
        .layer(TimeoutLayer::new(handler_timeout))
        .service(RouteService::new(router))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parley_core::{CorrelationId, RemoteErrorKind};
    use tower::ServiceExt;

    use super::*;
    use crate::rpc::router::{handler_fn, Dispatch};

    fn dispatch(key: &str) -> Dispatch {
        Dispatch {
            routing_key: key.to_string(),
            correlation_id: CorrelationId::from("c-7"),
            payload: Bytes::from_static(b"hi"),
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let mut router = Router::new();
        router
            .register("v1.echo", handler_fn(|p: Bytes| async move { Ok(p) }))
            .unwrap();
        let svc = build_dispatch_pipeline(Arc::new(router), Duration::from_secs(1));

        let resp = svc.oneshot(dispatch("v1.echo")).await.unwrap();
        assert_eq!(&resp[..], b"hi");
    }

    #[tokio::test]
    async fn slow_handler_times_out_inside_pipeline() {
        let mut router = Router::new();
        router
            .register(
                "v1.slow",
                handler_fn(|p: Bytes| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(p)
                }),
            )
            .unwrap();
        let svc = build_dispatch_pipeline(Arc::new(router), Duration::from_millis(20));

        let err = svc.oneshot(dispatch("v1.slow")).await.unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Timeout);
    }
}
