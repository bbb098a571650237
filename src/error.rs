use std::io;

use thiserror::Error;

/// Errors are grouped by the layer that produces them. Routing failures
/// (`EndpointNotConnected`, `NoPrincipalFound`) are deliberately *not* here:
/// they travel inside a kernel's exit code and are delivered downstream,
/// never raised.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, unknown type id, truncated body. Scoped to one
    /// packet; the connection survives.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or pipe failure. The connection is stopped and its retained
    /// kernels are recovered.
    #[error("transport error: {0}")]
    Transport(#[from] nix::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Conflicting kernel type registration.
    #[error("kernel type error: {0}")]
    TypeRegistry(String),

    /// Bad application records, unknown kernel types at spawn time and
    /// similar refusals.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Error {
        Error::Protocol(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::Config(msg.into())
    }
}
