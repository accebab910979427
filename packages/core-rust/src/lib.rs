//! Parley core: RPC envelopes, correlation ids, wire codec and translation payloads.

pub mod envelope;
pub mod translation;

pub use envelope::{
    CodecError, CorrelationId, RemoteErrorKind, RequestEnvelope, ResponseEnvelope, ResponseStatus,
};
pub use translation::{routes, DoTranslateRequest, HistoryResponse, Translation};
