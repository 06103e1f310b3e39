//! Error types shared by the service and client sides of the transport.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the local RPC transport.
///
/// Transient (interrupt-class) I/O errors are retried internally and only
/// surface as [`RpcError::TransientIo`] once the retry budget is spent.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Rejected before any I/O was attempted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The service socket could not be bound. Fatal for `start_service`.
    #[error("Failed to bind {}: {source}", path.display())]
    Bind {
        /// Socket path that failed to bind
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Could not connect to the service socket (missing or refusing).
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// A receive or admission wait exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error not classified as transient.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Interrupt-class errors kept recurring until retries ran out.
    #[error("Transient I/O error persisted after {attempts} attempts: {source}")]
    TransientIo {
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: io::Error,
    },

    /// The exchange on this client handle has already completed.
    #[error("Exchange already completed")]
    Closed,
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                RpcError::ConnectionFailed(err)
            }
            _ => RpcError::Io(err),
        }
    }
}

/// Interrupt-class errors that are retried locally.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Errors a socket with a read timeout reports when the deadline passes.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
