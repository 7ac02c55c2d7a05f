//! Error types for the relay core.

use thiserror::Error;

/// Errors surfaced when constructing or running relay components.
///
/// Per-connection I/O failures are not represented here: a read or
/// write that discovers a closed transport is handled as a close
/// notification inside the session state machine, not as an error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Underlying socket operation failed (bind, accept setup).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material could not be loaded or assembled.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// rustls rejected the supplied configuration.
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Listener or target configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}
