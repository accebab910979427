//! HTTP middleware stack for the translation façade.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

const REQUEST_ID: &str = "x-request-id";

type HttpTrace = TraceLayer<SharedClassifier<ServerErrorsAsFailures>>;

/// Layers produced by [`build_http_layers`], innermost last.
type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<CompressionLayer, Stack<HttpTrace, Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>>>,
        >,
    >,
>;

/// Builds the transport-level middleware applied to every HTTP route.
///
/// Order (outermost to innermost): request id, trace, gzip, CORS,
/// timeout (408), request id propagation.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(REQUEST_ID);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
