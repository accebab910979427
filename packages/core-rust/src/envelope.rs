//! Request and response envelopes exchanged over the broker.
//!
//! Both envelopes are encoded as named-field `MsgPack` via
//! `rmp_serde::to_vec_named()`, so every field travels as a discrete,
//! self-describing entry. Payloads are opaque bytes; the envelope never
//! interprets them.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CorrelationId
// ---------------------------------------------------------------------------

/// Opaque token linking a request to its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps an existing token.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding envelopes and payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("envelope is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// A request published by an RPC client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Selects the handler on the responder side.
    pub routing_key: String,
    /// Unique among the issuing client's outstanding requests.
    pub correlation_id: CorrelationId,
    /// Queue the responder must publish the response to.
    pub reply_to: String,
    pub payload: Bytes,
}

impl RequestEnvelope {
    #[must_use]
    pub fn new(
        routing_key: impl Into<String>,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            correlation_id,
            reply_to: reply_to.into(),
            payload,
        }
    }

    /// Serializes the envelope to named-field `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes and validates a request envelope.
    ///
    /// A request without a correlation id or reply-to address can never be
    /// answered, so it is rejected here rather than dispatched.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` for undecodable bytes and
    /// `CodecError::MissingField` for envelopes that cannot be replied to.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        if envelope.correlation_id.is_empty() {
            return Err(CodecError::MissingField {
                field: "correlationId",
            });
        }
        if envelope.reply_to.is_empty() {
            return Err(CodecError::MissingField { field: "replyTo" });
        }
        Ok(envelope)
    }
}

// ---------------------------------------------------------------------------
// ResponseEnvelope
// ---------------------------------------------------------------------------

/// Classifies a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// No handler is registered for the request's routing key.
    UnknownRoute,
    /// The handler ran and returned an error.
    Handler,
    /// The handler did not finish within the responder's deadline.
    Timeout,
    /// The responder failed outside of the handler.
    Internal,
}

impl RemoteErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownRoute => "unknown_route",
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error indicator carried by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResponseStatus {
    Success,
    Failure {
        kind: RemoteErrorKind,
        message: String,
    },
}

/// A response published by the responder to the request's reply-to queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Copied from the originating request.
    pub correlation_id: CorrelationId,
    /// Empty for failed responses.
    pub payload: Bytes,
    pub status: ResponseStatus,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn success(correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            correlation_id,
            payload,
            status: ResponseStatus::Success,
        }
    }

    #[must_use]
    pub fn failure(
        correlation_id: CorrelationId,
        kind: RemoteErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            payload: Bytes::new(),
            status: ResponseStatus::Failure {
                kind,
                message: message.into(),
            },
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ResponseStatus::Success)
    }

    /// Serializes the envelope to named-field `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes a response envelope.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` for undecodable bytes and
    /// `CodecError::MissingField` when the correlation id is empty.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        if envelope.correlation_id.is_empty() {
            return Err(CodecError::MissingField {
                field: "correlationId",
            });
        }
        Ok(envelope)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
