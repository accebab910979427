//! Translation routes served over the broker.

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::translation::{from_payload, to_payload};
use parley_core::{routes, DoTranslateRequest, HistoryResponse};

use crate::rpc::router::{Handler, HandlerError, Router, RouterError};
use crate::usecase::TranslationUseCase;

struct GetHistory {
    usecase: TranslationUseCase,
}

#[async_trait]
impl Handler for GetHistory {
    async fn call(&self, _payload: Bytes) -> Result<Bytes, HandlerError> {
        let history = self
            .usecase
            .history()
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;
        to_payload(&HistoryResponse { history }).map_err(|e| HandlerError::new(e.to_string()))
    }
}

struct DoTranslate {
    usecase: TranslationUseCase,
}

#[async_trait]
impl Handler for DoTranslate {
    async fn call(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        let request: DoTranslateRequest = from_payload(&payload)
            .map_err(|e| HandlerError::new(format!("invalid request: {e}")))?;
        let translation = self
            .usecase
            .translate(request)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;
        to_payload(&translation).map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// Builds the route table for the translation responder.
///
/// # Errors
///
/// Returns `RouterError::DuplicateRoute` if two routes share a key.
pub fn translation_router(usecase: &TranslationUseCase) -> Result<Router, RouterError> {
    let mut router = Router::new();
    router
        .register(
            routes::GET_HISTORY,
            GetHistory {
                usecase: usecase.clone(),
            },
        )?
        .register(
            routes::DO_TRANSLATE,
            DoTranslate {
                usecase: usecase.clone(),
            },
        )?;
    Ok(router)
}

#[cfg(test)]
mod tests {
    use parley_core::Translation;

    use super::*;
    use crate::usecase::tests::usecase;

    #[test]
    fn registers_both_routes() {
        let router = translation_router(&usecase()).unwrap();
        assert_eq!(router.keys(), vec![routes::DO_TRANSLATE, routes::GET_HISTORY]);
    }

    #[tokio::test]
    async fn translate_then_history() {
        let router = translation_router(&usecase()).unwrap();

        let request = DoTranslateRequest {
            source: "en".to_string(),
            destination: "es".to_string(),
            original: "cat".to_string(),
        };
        let body = router
            .resolve(routes::DO_TRANSLATE)
            .unwrap()
            .call(to_payload(&request).unwrap())
            .await
            .unwrap();
        let translation: Translation = from_payload(&body).unwrap();
        assert_eq!(translation.translation, "CAT");

        let body = router
            .resolve(routes::GET_HISTORY)
            .unwrap()
            .call(Bytes::new())
            .await
            .unwrap();
        let history: HistoryResponse = from_payload(&body).unwrap();
        assert_eq!(history.history, vec![translation]);
    }

    #[tokio::test]
    async fn garbage_payload_is_a_handler_error() {
        let router = translation_router(&usecase()).unwrap();
        let err = router
            .resolve(routes::DO_TRANSLATE)
            .unwrap()
            .call(Bytes::from_static(b"{"))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("invalid request"));
    }

    #[tokio::test]
    async fn validation_failure_is_reported_verbatim() {
        let router = translation_router(&usecase()).unwrap();
        let request = DoTranslateRequest {
            source: String::new(),
            destination: "es".to_string(),
            original: "cat".to_string(),
        };
        let err = router
            .resolve(routes::DO_TRANSLATE)
            .unwrap()
            .call(to_payload(&request).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.message, "missing field `source`");
    }
}
