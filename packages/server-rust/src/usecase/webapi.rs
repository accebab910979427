//! Google Translate client over the public `translate_a/single` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use parley_core::{DoTranslateRequest, Translation};
use serde_json::Value;

use super::TranslationWebApi;

/// Failures talking to the translation service.
#[derive(Debug, thiserror::Error)]
pub enum WebApiError {
    #[error("translation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("translation service answered {status}")]
    UnexpectedStatus { status: u16 },
    #[error("unexpected translation response: {0}")]
    Malformed(String),
}

/// [`TranslationWebApi`] backed by Google's public translate endpoint.
#[derive(Debug, Clone)]
pub struct GoogleTranslateApi {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleTranslateApi {
    /// Builds a client for `base_url` (e.g. `https://translate.googleapis.com`).
    ///
    /// # Errors
    ///
    /// Returns `WebApiError::Http` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, WebApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TranslationWebApi for GoogleTranslateApi {
    async fn translate(&self, request: &DoTranslateRequest) -> Result<Translation, WebApiError> {
        let url = format!("{}/translate_a/single", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("client", "gtx"),
                ("sl", request.source.as_str()),
                ("tl", request.destination.as_str()),
                ("dt", "t"),
                ("q", request.original.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebApiError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await?;
        Ok(Translation {
            source: request.source.clone(),
            destination: request.destination.clone(),
            original: request.original.clone(),
            translation: parse_segments(&body)?,
        })
    }
}

/// Joins the translated segments of a response.
///
/// The body is a nested array; `body[0]` holds one entry per sentence whose
/// first element is the translated text.
fn parse_segments(body: &Value) -> Result<String, WebApiError> {
    let segments = body
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| WebApiError::Malformed("missing segment list".to_string()))?;

    let text: String = segments
        .iter()
        .filter_map(|segment| segment.get(0).and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        return Err(WebApiError::Malformed("no translated text".to_string()));
    }
    Ok(text)
}
