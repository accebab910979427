//! HTTP handlers and the state they share.

pub mod health;
pub mod translation;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use translation::{do_translate_handler, history_handler, HttpError};

use std::sync::Arc;
use std::time::Instant;

use crate::shutdown::ShutdownController;
use crate::usecase::TranslationUseCase;

/// State carried through axum extractors. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Health and in-flight state of the RPC responder.
    pub shutdown: Arc<ShutdownController>,
    pub usecase: TranslationUseCase,
    /// Used for the uptime figure in `/health`.
    pub start_time: Instant,
}
