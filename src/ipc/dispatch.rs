//! Per-connection workers.
//!
//! Each accepted connection runs on its own detached thread so the listener
//! never blocks on request processing. Whatever the handler does, the worker
//! finishes the client handle afterwards: the channel is closed and the
//! admission slot released exactly once.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::ipc::handle::ClientHandle;

/// User-supplied request handler shared by every worker of a service.
pub type Handler<C> = Arc<dyn Fn(&mut ClientHandle<C>) -> anyhow::Result<()> + Send + Sync>;

/// Spawn a worker thread running one exchange.
///
/// If the thread cannot be spawned the client handle is dropped, which
/// releases its slot; the error is returned for the listener to log.
pub(crate) fn dispatch<C>(handler: Handler<C>, client: ClientHandle<C>) -> io::Result<()>
where
    C: Send + Sync + 'static,
{
    let thread_name = format!("{}-worker", client.name());
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_exchange(&handler, client))
        .map(|_| ())
}

/// Run the handler against `client` and finish the exchange.
///
/// Panics are caught so a misbehaving handler cannot leak its slot.
pub(crate) fn run_exchange<C>(handler: &Handler<C>, mut client: ClientHandle<C>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut client)));

    match result {
        Ok(Ok(())) => {
            if !client.is_complete() {
                tracing::debug!(
                    "Handler for {} returned without responding; closing connection",
                    client.name()
                );
            }
        }
        Ok(Err(e)) => {
            tracing::warn!("Handler for {} failed: {:#}", client.name(), e);
        }
        Err(panic_info) => {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic in handler".to_string()
            };
            tracing::error!("Handler for {} panicked: {}", client.name(), panic_msg);
        }
    }

    client.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::admission::Admission;
    use crate::ipc::channel::Channel;
    use crate::ipc::error::RpcError;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn client_for(admission: &Arc<Admission>) -> (ClientHandle<()>, Channel) {
        let slot = admission.acquire(WAIT).expect("slot");
        let mut client = ClientHandle::new(Arc::from("svc"), Arc::new(()), slot);
        let (server, peer) = UnixStream::pair().unwrap();
        client.attach(server);
        (client, Channel::from_stream(peer))
    }

    #[test]
    fn test_handler_error_releases_slot() {
        let admission = Admission::new(1);
        let (client, mut peer) = client_for(&admission);
        let handler: Handler<()> = Arc::new(|_client: &mut ClientHandle<()>| -> anyhow::Result<()> {
            anyhow::bail!("refusing request")
        });

        run_exchange(&handler, client);

        assert_eq!(admission.active(), 0);
        assert!(matches!(peer.recv(8, Some(WAIT)), Err(RpcError::Io(_))));
    }

    #[test]
    fn test_handler_panic_releases_slot() {
        let admission = Admission::new(1);
        let (client, _peer) = client_for(&admission);
        let handler: Handler<()> = Arc::new(|_client: &mut ClientHandle<()>| -> anyhow::Result<()> {
            panic!("handler blew up")
        });

        run_exchange(&handler, client);

        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn test_dispatch_runs_exchange_on_worker_thread() {
        let admission = Admission::new(1);
        let (client, mut peer) = client_for(&admission);
        let handler: Handler<()> = Arc::new(|client: &mut ClientHandle<()>| -> anyhow::Result<()> {
            let name = thread::current().name().unwrap_or_default().to_string();
            client.send_response(name.as_bytes())?;
            Ok(())
        });

        dispatch(handler, client).unwrap();

        let response = peer.recv(64, Some(WAIT)).unwrap();
        assert_eq!(response, b"svc-worker");
        assert!(admission.wait_idle(WAIT));
    }
}
