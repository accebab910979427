//! HTTP listener configuration.

use std::time::Duration;

/// Settings for the HTTP façade.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}
