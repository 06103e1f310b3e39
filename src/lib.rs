//! localrpc library
//!
//! A single-host RPC transport for daemons:
//!
//! - `ipc` - services, admission control and the client-side call
//! - `models` - serializable service status types
//!
//! # Quick start
//!
//! ```ignore
//! use localrpc::ipc::{send_request, start_service};
//!
//! let service = start_service("sensord", handler, 4, config)?;
//! let reply = send_request("sensord", b"read temp0", 256, Some(Duration::from_secs(2)))?;
//! ```

pub mod ipc;
pub mod models;
