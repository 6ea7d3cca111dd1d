//! Startup errors. All of them are fatal to the process.

use std::net::SocketAddr;

use thiserror::Error;

/// Failures bringing the listeners up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address, as configured.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The TLS certificate/key pair could not be loaded.
    #[error("invalid TLS certificate pair: {0}")]
    CertInvalid(#[source] std::io::Error),
    /// A bound listener could not be handed to the TLS server.
    #[error("listener setup failed on {addr}: {source}")]
    Listener {
        /// Bound address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
