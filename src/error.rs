use std::net::SocketAddr;

use thiserror::Error;

use crate::server::config::ConfigError;

/// Errors that stop the proximity server.
///
/// Per-connection failures are never surfaced here; they end only the affected session.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The bound socket could not report its address.
    #[error("failed to read the listening address")]
    LocalAddr(#[source] std::io::Error),

    /// The configuration could not be loaded.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
}
