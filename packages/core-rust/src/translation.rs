//! Translation payloads shared by the HTTP façade and the RPC routes.
//!
//! Bodies are JSON on both transports so a history entry fetched over HTTP
//! is byte-for-byte comparable with one fetched over the broker.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::CodecError;

/// Routing keys understood by the translation responder.
pub mod routes {
    /// Returns the full translation history.
    pub const GET_HISTORY: &str = "v1.getHistory";
    /// Translates a text and records it in the history.
    pub const DO_TRANSLATE: &str = "v1.doTranslate";
}

/// A completed translation as stored in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub source: String,
    pub destination: String,
    pub original: String,
    pub translation: String,
}

/// Input for a translation: language pair and text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoTranslateRequest {
    pub source: String,
    pub destination: String,
    pub original: String,
}

impl DoTranslateRequest {
    /// Returns the name of the first empty field, if any.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.source.trim().is_empty() {
            Some("source")
        } else if self.destination.trim().is_empty() {
            Some("destination")
        } else if self.original.trim().is_empty() {
            Some("original")
        } else {
            None
        }
    }
}

/// Response body of the history route.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<Translation>,
}

/// Encodes a value as a JSON payload.
///
/// # Errors
///
/// Returns `CodecError::Json` if the value cannot be serialized.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decodes a JSON payload.
///
/// # Errors
///
/// Returns `CodecError::Json` if the bytes are not valid JSON for `T`.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}
