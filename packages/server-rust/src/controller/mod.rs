//! Transport adapters exposing the translation use case.

pub mod amqp_rpc;

pub use amqp_rpc::translation_router;
