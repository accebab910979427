//! Parley server: translation service answering over HTTP and over RPC on a
//! message broker.
//!
//! - [`rpc`]: transport bindings, correlation registry, client, responder
//! - [`usecase`] and [`storage`]: translation logic and history persistence
//! - [`controller`]: translation routes for the responder
//! - [`network`]: axum HTTP façade
//! - [`app`]: process wiring and shutdown

pub mod app;
pub mod config;
pub mod controller;
pub mod logging;
pub mod network;
pub mod rpc;
pub mod shutdown;
pub mod storage;
pub mod usecase;

pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
