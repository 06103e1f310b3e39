//! Byte transport between one caller and one service connection.
//!
//! A channel is a connected Unix domain stream socket. The address of a
//! service is derived from its name alone (`<socket dir>/<name>`), so any
//! process on the host can reach it without a naming service.
//!
//! # Message Boundaries
//!
//! There is no framing: one `send` is expected to arrive as one `recv` on the
//! peer. That holds for small payloads on a local stream socket, which is all
//! this transport targets. Callers size their receive buffers for the largest
//! message they expect.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::ipc::error::{is_timeout, is_transient, RpcError};

/// Directory service sockets are created in unless configured otherwise.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Longest accepted service name, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Attempts made on interrupt-class errors before giving up.
pub(crate) const TRANSIENT_RETRIES: u32 = 5;

/// Pause between attempts on interrupt-class errors.
pub(crate) const TRANSIENT_BACKOFF: Duration = Duration::from_millis(20);

/// Check that `name` can be used as a service address.
///
/// Names must be non-empty, at most [`MAX_NAME_LEN`] bytes, and must not
/// contain `/` or NUL (the name becomes a single path component).
pub fn validate_name(name: &str) -> Result<(), RpcError> {
    if name.is_empty() {
        return Err(RpcError::InvalidArgument(
            "service name is empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RpcError::InvalidArgument(format!(
            "service name is {} bytes, maximum is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(RpcError::InvalidArgument(format!(
            "service name {:?} contains '/' or NUL",
            name
        )));
    }
    Ok(())
}

/// Socket path for service `name` under `dir`.
pub fn socket_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// A connected, unframed byte channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Connect to the service socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionFailed` if the socket does not exist,
    /// refuses the connection, or cannot be opened.
    pub fn connect(path: &Path) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path).map_err(RpcError::ConnectionFailed)?;
        Ok(Self { stream })
    }

    pub(crate) fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Write `bytes` with a single blocking write.
    ///
    /// A short write is reported as an error rather than continued, since
    /// the peer reads each message with exactly one `recv`.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, RpcError> {
        let written = self.stream.write(bytes).map_err(RpcError::Io)?;
        if written != bytes.len() {
            return Err(RpcError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, bytes.len()),
            )));
        }
        Ok(written)
    }

    /// Read once into a buffer of `max_len` bytes.
    ///
    /// `timeout` of `None` (or zero) blocks until data arrives. Interrupted
    /// reads are retried up to [`TRANSIENT_RETRIES`] times. The returned
    /// bytes may be fewer than `max_len`; deciding whether that is a complete
    /// message is up to the caller.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidArgument` if `max_len` is zero
    /// - `RpcError::Timeout` if nothing arrived before the deadline
    /// - `RpcError::Io` with `UnexpectedEof` if the peer closed without sending
    /// - `RpcError::TransientIo` if interrupts persisted past the retry budget
    pub fn recv(&mut self, max_len: usize, timeout: Option<Duration>) -> Result<Vec<u8>, RpcError> {
        if max_len == 0 {
            return Err(RpcError::InvalidArgument(
                "receive buffer capacity is zero".to_string(),
            ));
        }

        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream
            .set_read_timeout(timeout)
            .map_err(RpcError::Io)?;

        let mut buf = vec![0u8; max_len];
        let n = read_message(&mut self.stream, &mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Shut down both directions and release the socket.
    pub fn close(self) {
        // The peer may already be gone; nothing useful to do on failure.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One logical read from `reader`, retrying interrupt-class errors.
///
/// `timeout` is only used to label a timeout error; the reader is expected
/// to enforce it.
fn read_message<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, RpcError> {
    let mut attempts = 0;

    loop {
        match reader.read(buf) {
            Ok(0) => {
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the channel without sending data",
                )));
            }
            Ok(n) => return Ok(n),
            Err(e) if is_timeout(&e) => {
                return Err(RpcError::Timeout(timeout.unwrap_or_default()));
            }
            Err(e) if is_transient(&e) => {
                attempts += 1;
                if attempts >= TRANSIENT_RETRIES {
                    return Err(RpcError::TransientIo {
                        attempts,
                        source: e,
                    });
                }
                tracing::warn!("Interrupted read (attempt {}), retrying", attempts);
                thread::sleep(TRANSIENT_BACKOFF);
            }
            Err(e) => return Err(RpcError::Io(e)),
        }
    }
}
