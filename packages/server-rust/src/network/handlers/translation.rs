//! `/v1/translation` routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_core::{DoTranslateRequest, HistoryResponse, Translation};
use serde_json::json;
use tracing::error;

use super::AppState;
use crate::usecase::UseCaseError;

/// Error body `{"error": "..."}` with the matching status code.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid request body: {0}")]
    BadRequest(String),
    #[error("translation service problems")]
    Internal,
}

impl From<UseCaseError> for HttpError {
    fn from(err: UseCaseError) -> Self {
        match err {
            UseCaseError::InvalidRequest { .. } => Self::BadRequest(err.to_string()),
            other => {
                error!(error = %other, "translation use case failed");
                Self::Internal
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// `GET /v1/translation/history`
pub async fn history_handler(
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, HttpError> {
    let history = state.usecase.history().await?;
    Ok(Json(HistoryResponse { history }))
}

/// `POST /v1/translation/do-translate`
pub async fn do_translate_handler(
    State(state): State<AppState>,
    body: Result<Json<DoTranslateRequest>, JsonRejection>,
) -> Result<Json<Translation>, HttpError> {
    let Json(request) = body.map_err(|e| HttpError::BadRequest(e.body_text()))?;
    let translation = state.usecase.translate(request).await?;
    Ok(Json(translation))
}
