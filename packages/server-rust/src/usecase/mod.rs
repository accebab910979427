//! Translation use case and the ports it depends on.
//!
//! The use case is transport-agnostic: the HTTP handlers and the RPC
//! handlers both call into the same [`TranslationUseCase`].

pub mod webapi;

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{DoTranslateRequest, Translation};
use tracing::debug;

pub use webapi::{GoogleTranslateApi, WebApiError};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Persistence for translation history.
/// Implementations: `PostgreSQL` (feature `postgres`), memory.
#[async_trait]
pub trait TranslationRepo: Send + Sync {
    /// One-time initialization (e.g., create tables).
    async fn initialize(&self) -> anyhow::Result<()>;

    /// All stored translations, oldest first.
    async fn get_history(&self) -> anyhow::Result<Vec<Translation>>;

    /// Appends one translation to the history.
    async fn store(&self, translation: &Translation) -> anyhow::Result<()>;

    /// Release resources and close connections.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Remote machine-translation service.
#[async_trait]
pub trait TranslationWebApi: Send + Sync {
    async fn translate(&self, request: &DoTranslateRequest) -> Result<Translation, WebApiError>;
}

// ---------------------------------------------------------------------------
// Use case
// ---------------------------------------------------------------------------

/// Failures surfaced by [`TranslationUseCase`].
#[derive(Debug, thiserror::Error)]
pub enum UseCaseError {
    #[error("missing field `{field}`")]
    InvalidRequest { field: &'static str },
    #[error("translation history unavailable: {0:#}")]
    Repository(anyhow::Error),
    #[error(transparent)]
    WebApi(#[from] WebApiError),
}

/// Translates text and keeps a history of every translation performed.
#[derive(Clone)]
pub struct TranslationUseCase {
    repo: Arc<dyn TranslationRepo>,
    webapi: Arc<dyn TranslationWebApi>,
}

impl TranslationUseCase {
    #[must_use]
    pub fn new(repo: Arc<dyn TranslationRepo>, webapi: Arc<dyn TranslationWebApi>) -> Self {
        Self { repo, webapi }
    }

    /// Every translation performed so far.
    ///
    /// # Errors
    ///
    /// Returns `UseCaseError::Repository` if the history cannot be read.
    pub async fn history(&self) -> Result<Vec<Translation>, UseCaseError> {
        self.repo.get_history().await.map_err(UseCaseError::Repository)
    }

    /// Translates `request` through the web API and records the result.
    ///
    /// # Errors
    ///
    /// - `UseCaseError::InvalidRequest` when a field is empty
    /// - `UseCaseError::WebApi` when the translation service fails
    /// - `UseCaseError::Repository` when the result cannot be stored
    pub async fn translate(&self, request: DoTranslateRequest) -> Result<Translation, UseCaseError> {
        if let Some(field) = request.missing_field() {
            return Err(UseCaseError::InvalidRequest { field });
        }

        let translation = self.webapi.translate(&request).await?;
        self.repo
            .store(&translation)
            .await
            .map_err(UseCaseError::Repository)?;

        debug!(
            source = %translation.source,
            destination = %translation.destination,
            "translation stored"
        );
        Ok(translation)
    }
}

impl std::fmt::Debug for TranslationUseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationUseCase").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryTranslationRepo;

    /// Web API double that "translates" by upper-casing the original text.
    pub(crate) struct UppercaseApi;

    #[async_trait]
    impl TranslationWebApi for UppercaseApi {
        async fn translate(
            &self,
            request: &DoTranslateRequest,
        ) -> Result<Translation, WebApiError> {
            Ok(Translation {
                source: request.source.clone(),
                destination: request.destination.clone(),
                original: request.original.clone(),
                translation: request.original.to_uppercase(),
            })
        }
    }

    struct FailingApi;

    #[async_trait]
    impl TranslationWebApi for FailingApi {
        async fn translate(&self, _: &DoTranslateRequest) -> Result<Translation, WebApiError> {
            Err(WebApiError::Malformed("no segments".to_string()))
        }
    }

    pub(crate) fn usecase() -> TranslationUseCase {
        TranslationUseCase::new(
            Arc::new(MemoryTranslationRepo::new()),
            Arc::new(UppercaseApi),
        )
    }

    fn request(original: &str) -> DoTranslateRequest {
        DoTranslateRequest {
            source: "en".to_string(),
            destination: "de".to_string(),
            original: original.to_string(),
        }
    }

    #[tokio::test]
    async fn translate_stores_result_in_history() {
        let uc = usecase();
        let t = uc.translate(request("hello")).await.unwrap();
        assert_eq!(t.translation, "HELLO");

        let history = uc.history().await.unwrap();
        assert_eq!(history, vec![t]);
    }

    #[tokio::test]
    async fn empty_field_is_rejected_before_calling_api() {
        let uc = TranslationUseCase::new(Arc::new(MemoryTranslationRepo::new()), Arc::new(FailingApi));
        let err = uc.translate(request("")).await.unwrap_err();
        assert!(matches!(err, UseCaseError::InvalidRequest { field: "original" }));
    }

    #[tokio::test]
    async fn api_failure_is_not_stored() {
        let repo = Arc::new(MemoryTranslationRepo::new());
        let uc = TranslationUseCase::new(repo.clone(), Arc::new(FailingApi));

        let err = uc.translate(request("hi")).await.unwrap_err();
        assert!(matches!(err, UseCaseError::WebApi(_)));
        assert!(repo.get_history().await.unwrap().is_empty());
    }
}
