//! HTTP module with deferred startup lifecycle.
//!
//! `new()` captures shared state, `start()` binds the listener and
//! `serve()` accepts requests until the shutdown future fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    do_translate_handler, health_handler, history_handler, liveness_handler, readiness_handler,
    AppState,
};
use super::middleware::build_http_layers;
use crate::shutdown::ShutdownController;
use crate::usecase::TranslationUseCase;

/// The HTTP façade over the translation use case.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    ///
    /// `shutdown` is the RPC responder's controller; readiness mirrors it.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        usecase: TranslationUseCase,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            listener: None,
            state: AppState {
                shutdown,
                usecase,
                start_time: Instant::now(),
            },
        }
    }

    /// Assembles the axum router.
    ///
    /// Routes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready`
    /// - `GET /v1/translation/history`
    /// - `POST /v1/translation/do-translate`
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/v1/translation/history", get(history_handler))
            .route("/v1/translation/do-translate", post(do_translate_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves requests until `shutdown` resolves, then lets in-flight
    /// requests finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed")?;
        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use parley_core::{HistoryResponse, Translation};
    use tower::ServiceExt;

    use super::*;
    use crate::usecase::tests::usecase;

    fn module() -> NetworkModule {
        NetworkModule::new(
            NetworkConfig::default(),
            usecase(),
            Arc::new(ShutdownController::new()),
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn translate_then_fetch_history() {
        let router = module().build_router();

        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/translation/do-translate",
                r#"{"source":"en","destination":"it","original":"dog"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let translation: Translation = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(translation.translation, "DOG");

        let response = router
            .oneshot(Request::get("/v1/translation/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history: HistoryResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(history.history, vec![translation]);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let response = module()
            .build_router()
            .oneshot(post_json("/v1/translation/do-translate", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn empty_field_is_bad_request() {
        let response = module()
            .build_router()
            .oneshot(post_json(
                "/v1/translation/do-translate",
                r#"{"source":"en","destination":"","original":"x"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let response = module()
            .build_router()
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            usecase(),
            Arc::new(ShutdownController::new()),
        );
        let port = module.start().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module().serve(std::future::ready(())).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }
}
