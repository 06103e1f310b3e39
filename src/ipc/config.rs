//! Service tunables.
//!
//! By default the listener waits 16s per admission attempt, fail-stops after
//! five consecutive admission timeouts or accept failures, and creates its
//! socket under `/tmp`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ipc::channel::DEFAULT_SOCKET_DIR;
use crate::ipc::error::RpcError;

/// How long the listener waits for a free slot before counting a timeout.
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 16_000;

const DEFAULT_MAX_ADMISSION_TIMEOUTS: u32 = 5;
const DEFAULT_MAX_ACCEPT_RETRIES: u32 = 5;
const DEFAULT_ACCEPT_RETRY_DELAY_MS: u64 = 20;

/// Options for [`start_service_with`](crate::ipc::start_service_with).
///
/// Deserializable from JSON with every field optional:
///
/// ```ignore
/// let options: ServiceOptions = serde_json::from_str(r#"{"max_concurrent": 4}"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Admission ceiling: connections allowed in flight at once.
    pub max_concurrent: usize,
    /// Directory holding the service socket.
    pub socket_dir: PathBuf,
    /// Admission wait per attempt, in milliseconds.
    pub admission_timeout_ms: u64,
    /// Consecutive admission timeouts tolerated before fail-stop.
    pub max_admission_timeouts: u32,
    /// Consecutive accept failures tolerated before fail-stop.
    pub max_accept_retries: u32,
    /// Pause between accept attempts, in milliseconds.
    pub accept_retry_delay_ms: u64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            admission_timeout_ms: DEFAULT_ADMISSION_TIMEOUT_MS,
            max_admission_timeouts: DEFAULT_MAX_ADMISSION_TIMEOUTS,
            max_accept_retries: DEFAULT_MAX_ACCEPT_RETRIES,
            accept_retry_delay_ms: DEFAULT_ACCEPT_RETRY_DELAY_MS,
        }
    }
}

impl ServiceOptions {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout_ms = millis(timeout);
        self
    }

    pub fn with_max_admission_timeouts(mut self, count: u32) -> Self {
        self.max_admission_timeouts = count;
        self
    }

    pub fn with_max_accept_retries(mut self, count: u32) -> Self {
        self.max_accept_retries = count;
        self
    }

    pub fn with_accept_retry_delay(mut self, delay: Duration) -> Self {
        self.accept_retry_delay_ms = millis(delay);
        self
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    /// Reject option sets the listener cannot run with.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_concurrent == 0 {
            return Err(RpcError::InvalidArgument(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.admission_timeout_ms == 0 {
            return Err(RpcError::InvalidArgument(
                "admission_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.max_admission_timeouts == 0 || self.max_accept_retries == 0 {
            return Err(RpcError::InvalidArgument(
                "retry bounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
