//! HTTP façade: configuration, middleware, handlers and server lifecycle.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;

pub use config::NetworkConfig;
pub use handlers::{AppState, HttpError};
pub use module::NetworkModule;
