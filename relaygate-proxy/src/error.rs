//! Startup and serving errors of the proxy binary.
//!
//! Per-exchange failures never surface here; they become
//! [`GatewayError`](relaygate_core::error::GatewayError) responses.

use relaygate_core::config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The configuration could not be loaded, validated or built.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid process defaults from the environment.
    #[error("invalid defaults: {0}")]
    Defaults(String),

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
