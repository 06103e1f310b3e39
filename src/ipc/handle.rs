//! Server-side view of one accepted connection.

use std::fmt;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use crate::ipc::admission::Slot;
use crate::ipc::channel::Channel;
use crate::ipc::error::RpcError;

/// One connection handed to a service handler.
///
/// A handle serves exactly one exchange: the handler reads the request with
/// [`recv_request`](Self::recv_request) and answers with
/// [`send_response`](Self::send_response). Sending (successfully or not)
/// completes the exchange, closing the channel and releasing the admission
/// slot. If the handler returns without responding, dropping the handle does
/// the same and the caller observes EOF.
pub struct ClientHandle<C> {
    name: Arc<str>,
    cookie: Arc<C>,
    channel: Option<Channel>,
    slot: Option<Slot>,
}

impl<C> ClientHandle<C> {
    /// Created by the listener as soon as a slot is granted, before the
    /// connection exists.
    pub(crate) fn new(name: Arc<str>, cookie: Arc<C>, slot: Slot) -> Self {
        Self {
            name,
            cookie,
            channel: None,
            slot: Some(slot),
        }
    }

    pub(crate) fn attach(&mut self, stream: UnixStream) {
        self.channel = Some(Channel::from_stream(stream));
    }

    /// Name of the owning service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque value supplied to `start_service`, shared by every handle.
    pub fn cookie(&self) -> &C {
        &self.cookie
    }

    /// Whether the exchange has completed and the slot been released.
    pub fn is_complete(&self) -> bool {
        self.slot.is_none()
    }

    /// Read the request, waiting at most `timeout` (`None` blocks).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Closed` once the exchange has completed, otherwise
    /// whatever [`Channel::recv`] reports. A failed receive does not end the
    /// exchange; the handler decides whether to respond or give up.
    pub fn recv_request(
        &mut self,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        let channel = self.channel.as_mut().ok_or(RpcError::Closed)?;
        channel.recv(max_len, timeout)
    }

    /// Write the response and complete the exchange.
    ///
    /// The slot is released whether or not the write succeeds; a failed
    /// write is returned to the handler.
    pub fn send_response(&mut self, response: &[u8]) -> Result<(), RpcError> {
        let channel = self.channel.as_mut().ok_or(RpcError::Closed)?;

        let result = if response.is_empty() {
            Err(RpcError::InvalidArgument("response is empty".to_string()))
        } else {
            channel.send(response).map(|_| ())
        };

        self.finish();
        result
    }

    /// Close the channel and release the slot. Idempotent.
    pub(crate) fn finish(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.slot.take();
    }
}

impl<C> Drop for ClientHandle<C> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<C> fmt::Debug for ClientHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("name", &self.name)
            .field("connected", &self.channel.is_some())
            .field("complete", &self.is_complete())
            .finish()
    }
}
