//! Local request/response transport over Unix domain sockets.
//!
//! Daemons expose a named service with bounded concurrency; any process on
//! the host calls it synchronously by name.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐        /tmp/<name>         ┌──────────────────────────┐
//! │ caller           │                            │ service process          │
//! │  send_request()  │ ── one write ─────────────►│  listener ─► admission   │
//! │                  │ ◄──────────── one write ── │      │                   │
//! └──────────────────┘                            │      ▼                   │
//!                                                 │  worker: handler(client) │
//!                                                 └──────────────────────────┘
//! ```
//!
//! Every call uses a fresh connection carrying exactly one request and one
//! response. There is no framing or header: each side reads once into a
//! buffer sized for the largest message it expects, which is reliable for
//! the small control messages this transport is meant for.
//!
//! # Usage
//!
//! ```ignore
//! use localrpc::ipc::{send_request, start_service};
//! use std::time::Duration;
//!
//! let service = start_service("echo", |client| {
//!     let request = client.recv_request(64, Some(Duration::from_secs(5)))?;
//!     client.send_response(&request)?;
//!     Ok(())
//! }, 1, "cookie")?;
//!
//! let response = send_request("echo", &[1, 2, 3, 4], 32, Some(Duration::from_secs(20)))?;
//! assert_eq!(response, [1, 2, 3, 4]);
//! ```

mod admission;
mod channel;
mod client;
mod config;
mod dispatch;
mod error;
mod handle;
mod service;

pub use admission::{Admission, Slot};
pub use channel::{socket_path, validate_name, Channel, DEFAULT_SOCKET_DIR, MAX_NAME_LEN};
pub use client::{send_request, RpcClient};
pub use config::{ServiceOptions, DEFAULT_ADMISSION_TIMEOUT_MS};
pub use dispatch::Handler;
pub use error::RpcError;
pub use handle::ClientHandle;
pub use service::{start_service, start_service_with, ServiceHandle};
