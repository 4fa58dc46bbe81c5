//! Error types for the keymux crate.

use thiserror::Error;

/// Errors that can occur in the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate authority error: {0}")]
    Ca(String),

    #[error("API key pool cannot be empty")]
    EmptyKeyPool,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("request headers too large")]
    HeadersTooLarge,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
