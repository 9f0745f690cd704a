//! Error taxonomy for the tool/daemon protocol.
//!
//! Four classes with different blast radii:
//! - [`TransportError`]: the byte channel is dead; discard the connection.
//! - [`ProtocolError`]: framing corruption or version skew; also fatal to the
//!   connection, but indicates a bug rather than a peer failure.
//! - [`OperationError`]: a well-formed request the daemon could not satisfy
//!   (fork failed, unknown handle, breakpoint never reached). Recoverable —
//!   carried inline as `success = false` on the wire.
//! - [`ValidationError`]: malformed argv/env caught before transmission.

use thiserror::Error;

/// Channel-level failure. The connection must be discarded, not retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the channel")]
    Closed,

    #[error("this transport cannot carry file descriptors")]
    FdPassingUnsupported,

    #[error("expected {expected} ancillary descriptors, peer sent {actual}")]
    FdCountMismatch { expected: usize, actual: usize },
}

/// Framing corruption: tag mismatch, bad sentinel, truncated trailing data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown request tag {0}")]
    UnknownRequestTag(i64),

    #[error("unknown response tag {0}")]
    UnknownResponseTag(i64),

    #[error("expected {expected} response, got tag {actual}")]
    UnexpectedResponse { expected: &'static str, actual: i64 },

    #[error("missing end-of-{section} sentinel")]
    MissingSentinel { section: &'static str },

    #[error("string payload is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("malformed trailing data: {0}")]
    Malformed(&'static str),
}

/// Request was understood but could not be satisfied. Returned inline; the
/// daemon stays up and the caller decides recovery.
#[derive(Debug, Error)]
#[error("operation failed: {0}")]
pub struct OperationError(pub String);

impl OperationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Malformed launch parameters, raised locally before anything hits the wire.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("environment string {0:?} has no '=' separating name from value")]
    EnvMissingSeparator(String),

    #[error("environment string {0:?} has an empty name")]
    EnvEmptyName(String),

    #[error("launch request carries descriptors but the transport cannot pass them")]
    FdsOnNonPassingTransport,
}

/// Umbrella error for library callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
