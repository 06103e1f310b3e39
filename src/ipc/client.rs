//! Client side of the transport: one synchronous call per connection.
//!
//! A call connects to the service socket, writes the request once, reads the
//! response once into a caller-sized buffer and closes the connection on
//! every exit path.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::ipc::channel::{socket_path, validate_name, Channel, DEFAULT_SOCKET_DIR};
use crate::ipc::error::RpcError;

/// Call service `name` under the default socket directory.
///
/// A `timeout` of `None` waits for the response indefinitely.
///
/// # Errors
///
/// - `RpcError::InvalidArgument` for an empty request, a zero
///   `response_cap` or a bad name, before any connection is attempted
/// - `RpcError::ConnectionFailed` if the service is not running
/// - `RpcError::Timeout` if no response arrived within `timeout`
/// - `RpcError::Io` for send failures or a connection closed without a response
///
/// # Example
///
/// ```ignore
/// let response = send_request("echo", &[1, 2, 3, 4], 32, Some(Duration::from_secs(20)))?;
/// ```
pub fn send_request(
    name: &str,
    request: &[u8],
    response_cap: usize,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, RpcError> {
    RpcClient::new().call(name, request, response_cap, timeout)
}

/// Caller for services under one socket directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClient {
    socket_dir: PathBuf,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::with_socket_dir(DEFAULT_SOCKET_DIR)
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: dir.into(),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Perform one blocking call. See [`send_request`].
    pub fn call(
        &self,
        name: &str,
        request: &[u8],
        response_cap: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        if request.is_empty() {
            return Err(RpcError::InvalidArgument("request is empty".to_string()));
        }
        if response_cap == 0 {
            return Err(RpcError::InvalidArgument(
                "response capacity is zero".to_string(),
            ));
        }
        validate_name(name)?;

        let mut channel = Channel::connect(&socket_path(&self.socket_dir, name))?;
        let result = exchange(&mut channel, request, response_cap, timeout);
        channel.close();

        if let Err(e) = &result {
            tracing::debug!("Call to {} failed: {}", name, e);
        }
        result
    }

    /// Call, retrying only while the service cannot be reached.
    ///
    /// Useful right after spawning a daemon that may not have bound its
    /// socket yet. Retries with delays of 100ms, 200ms, 400ms, etc. Nothing
    /// is retried once the request has been sent.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all attempts fail.
    pub fn call_with_retry(
        &self,
        name: &str,
        request: &[u8],
        response_cap: usize,
        timeout: Option<Duration>,
        max_attempts: u32,
    ) -> Result<Vec<u8>, RpcError> {
        if max_attempts == 0 {
            return Err(RpcError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let mut attempt = 1;
        loop {
            match self.call(name, request, response_cap, timeout) {
                Err(RpcError::ConnectionFailed(e)) if attempt < max_attempts => {
                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(6)));
                    tracing::debug!(
                        "{} unreachable ({}), retrying in {:?} ({}/{})",
                        name,
                        e,
                        delay,
                        attempt,
                        max_attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Run [`call`](Self::call) on tokio's blocking pool.
    pub async fn call_async(
        &self,
        name: &str,
        request: Vec<u8>,
        response_cap: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        let client = self.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || client.call(&name, &request, response_cap, timeout))
            .await
            .map_err(|e| RpcError::Io(io::Error::other(e)))?
    }
}

fn exchange(
    channel: &mut Channel,
    request: &[u8],
    response_cap: usize,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, RpcError> {
    channel.send(request)?;
    channel.recv(response_cap, timeout)
}
