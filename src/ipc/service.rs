//! Named services and their listener loop.
//!
//! `start_service` binds `<socket dir>/<name>` and starts a listener thread
//! that cycles through three steps:
//!
//! ```text
//!      ┌───────────┐  slot   ┌──────────┐  connection  ┌──────────┐
//! ───► │ AwaitSlot │ ──────► │  Accept  │ ───────────► │ Dispatch │
//!      └───────────┘         └──────────┘              └──────────┘
//!         ▲   │ timeouts          │ failures                │
//!         │   │ exhausted         │ exhausted               │ worker spawned
//!         │   ▼                   ▼                         │
//!         │  ┌─────────────────────────┐                    │
//!         │  │ Degraded (fail-stop)    │                    │
//!         │  └─────────────────────────┘                    │
//!         └─────────────────────────────────────────────────┘
//! ```
//!
//! Persistent admission timeouts or accept failures are treated as
//! unrecoverable for that service: the listener logs at error level and
//! exits instead of retrying forever.

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ipc::admission::Admission;
use crate::ipc::channel::{socket_path, validate_name};
use crate::ipc::config::ServiceOptions;
use crate::ipc::dispatch::{dispatch, Handler};
use crate::ipc::error::RpcError;
use crate::ipc::handle::ClientHandle;
use crate::models::{ServiceState, ServiceStats};

/// Source of incoming connections for a listener.
pub(crate) trait Acceptor: Send + 'static {
    /// Block until a connection arrives.
    fn accept_stream(&self) -> io::Result<UnixStream>;
}

impl Acceptor for UnixListener {
    fn accept_stream(&self) -> io::Result<UnixStream> {
        self.accept().map(|(stream, _addr)| stream)
    }
}

/// State shared between a service's listener and its handle.
#[derive(Debug)]
struct Shared {
    admission: Arc<Admission>,
    state: AtomicU8,
    stopping: AtomicBool,
}

impl Shared {
    fn new(limit: usize) -> Self {
        Self {
            admission: Admission::new(limit),
            state: AtomicU8::new(ServiceState::Running.as_u8()),
            stopping: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Start a service with default options and the given admission ceiling.
///
/// `handler` runs once per accepted connection on its own thread. It is
/// expected to call [`ClientHandle::recv_request`] and then
/// [`ClientHandle::send_response`]; returning an error (or returning without
/// responding) closes the connection and the caller sees EOF.
///
/// # Errors
///
/// - `RpcError::InvalidArgument` for a bad name or a zero ceiling
/// - `RpcError::Bind` if the socket cannot be bound or a live service
///   already owns the name
///
/// # Example
///
/// ```ignore
/// let service = start_service("echo", |client| {
///     let request = client.recv_request(64, Some(Duration::from_secs(5)))?;
///     client.send_response(&request)?;
///     Ok(())
/// }, 4, ())?;
/// ```
pub fn start_service<C, F>(
    name: &str,
    handler: F,
    max_concurrent: usize,
    cookie: C,
) -> Result<ServiceHandle, RpcError>
where
    C: Send + Sync + 'static,
    F: Fn(&mut ClientHandle<C>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let options = ServiceOptions::default().with_max_concurrent(max_concurrent);
    start_service_with(name, handler, cookie, options)
}

/// Start a service with explicit options.
pub fn start_service_with<C, F>(
    name: &str,
    handler: F,
    cookie: C,
    options: ServiceOptions,
) -> Result<ServiceHandle, RpcError>
where
    C: Send + Sync + 'static,
    F: Fn(&mut ClientHandle<C>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    validate_name(name)?;
    options.validate()?;

    let path = socket_path(&options.socket_dir, name);
    let acceptor = bind(&path)?;

    let name: Arc<str> = Arc::from(name);
    let shared = Arc::new(Shared::new(options.max_concurrent));
    let handler: Handler<C> = Arc::new(handler);

    let listener = Listener {
        name: Arc::clone(&name),
        shared: Arc::clone(&shared),
        acceptor,
        handler,
        cookie: Arc::new(cookie),
        options: options.clone(),
    };

    let thread = thread::Builder::new()
        .name(format!("{}-listener", name))
        .spawn(move || listener.run());

    let thread = match thread {
        Ok(thread) => thread,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(RpcError::Io(e));
        }
    };

    tracing::info!(
        "Service {} listening on {} (max_concurrent={})",
        name,
        path.display(),
        options.max_concurrent
    );

    Ok(ServiceHandle {
        name,
        socket_path: path,
        shared,
        listener: Some(thread),
        started_at: Utc::now(),
    })
}

/// Bind the service socket, clearing a stale socket file first.
///
/// A file that still answers connections belongs to a live service and is
/// left alone.
fn bind(path: &Path) -> Result<UnixListener, RpcError> {
    let bind_err = |source: io::Error| RpcError::Bind {
        path: path.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(path) {
        Ok(_) => {
            if UnixStream::connect(path).is_ok() {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "a service is already listening on this socket",
                )));
            }
            tracing::debug!("Removing stale socket {}", path.display());
            fs::remove_file(path).map_err(bind_err)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_err(e)),
    }

    UnixListener::bind(path).map_err(bind_err)
}

/// Accept loop for one service. Owned by the listener thread.
struct Listener<A, C> {
    name: Arc<str>,
    shared: Arc<Shared>,
    acceptor: A,
    handler: Handler<C>,
    cookie: Arc<C>,
    options: ServiceOptions,
}

impl<A, C> Listener<A, C>
where
    A: Acceptor,
    C: Send + Sync + 'static,
{
    fn run(self) {
        let admission = &self.shared.admission;
        let mut admission_timeouts = 0;

        loop {
            let slot = match admission.acquire(self.options.admission_timeout()) {
                Some(slot) => {
                    admission_timeouts = 0;
                    slot
                }
                None if self.shared.is_stopping() => break,
                None => {
                    admission_timeouts += 1;
                    tracing::warn!(
                        "{}: no admission slot after {:?} ({}/{} timeouts, {} active)",
                        self.name,
                        self.options.admission_timeout(),
                        admission_timeouts,
                        self.options.max_admission_timeouts,
                        admission.active()
                    );
                    if admission_timeouts >= self.options.max_admission_timeouts {
                        self.degrade("admission wait kept timing out");
                        return;
                    }
                    continue;
                }
            };

            // The handle exists before the connection so that its memory is
            // bounded by the admission ceiling, not by the accept rate.
            let mut client = ClientHandle::new(Arc::clone(&self.name), Arc::clone(&self.cookie), slot);

            let stream = match self.accept() {
                Ok(stream) => stream,
                Err(_) if self.shared.is_stopping() => break,
                Err(e) => {
                    drop(client);
                    self.degrade(&format!("accept kept failing: {}", e));
                    return;
                }
            };

            if self.shared.is_stopping() {
                break;
            }

            client.attach(stream);
            tracing::debug!(
                "{}: accepted connection ({} of {} slots in use)",
                self.name,
                admission.active(),
                admission.limit()
            );

            if let Err(e) = dispatch(Arc::clone(&self.handler), client) {
                tracing::error!("{}: failed to spawn worker: {}", self.name, e);
            }
        }

        tracing::debug!("{}: listener exiting", self.name);
    }

    /// Accept with a bounded number of attempts.
    fn accept(&self) -> io::Result<UnixStream> {
        let mut failures = 0;
        loop {
            match self.acceptor.accept_stream() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    failures += 1;
                    if failures >= self.options.max_accept_retries || self.shared.is_stopping() {
                        return Err(e);
                    }
                    tracing::warn!(
                        "{}: accept failed ({}/{}): {}",
                        self.name,
                        failures,
                        self.options.max_accept_retries,
                        e
                    );
                    thread::sleep(self.options.accept_retry_delay());
                }
            }
        }
    }

    fn degrade(&self, reason: &str) {
        tracing::error!(
            "{}: listener stopped, service no longer accepting: {}",
            self.name,
            reason
        );
        self.shared.set_state(ServiceState::Degraded);
    }
}

/// Handle to a running service.
///
/// Dropping the handle detaches the service: it keeps serving until the
/// process exits. Call [`shutdown`](Self::shutdown) to stop it.
#[must_use = "dropping the handle detaches the service; call shutdown() to stop it"]
#[derive(Debug)]
pub struct ServiceHandle {
    name: Arc<str>,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    listener: Option<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Slots held by in-flight exchanges.
    pub fn active(&self) -> usize {
        self.shared.admission.active()
    }

    /// Admission ceiling.
    pub fn limit(&self) -> usize {
        self.shared.admission.limit()
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            name: self.name.to_string(),
            socket_path: self.socket_path.clone(),
            state: self.state(),
            active: self.active(),
            limit: self.limit(),
            started_at: self.started_at,
        }
    }

    /// Stop accepting, remove the socket and wait for in-flight exchanges.
    ///
    /// Exchanges already dispatched keep running; this waits up to `drain`
    /// for them to release their slots.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Timeout` if exchanges are still in flight after
    /// `drain`. The service is stopped either way.
    pub fn shutdown(mut self, drain: Duration) -> Result<(), RpcError> {
        tracing::info!("Shutting down service {}", self.name);

        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.admission.close();

        // Wake a listener parked in accept(); it may already be gone.
        let _ = UnixStream::connect(&self.socket_path);

        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                tracing::warn!("Listener thread for {} panicked", self.name);
            }
        }

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.socket_path.display(), e);
            }
        }

        self.shared.set_state(ServiceState::Stopped);

        if self.shared.admission.wait_idle(drain) {
            tracing::info!("Service {} stopped", self.name);
            Ok(())
        } else {
            tracing::warn!(
                "Service {} stopped with {} exchanges still in flight",
                self.name,
                self.active()
            );
            Err(RpcError::Timeout(drain))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::Channel;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn echo_handler() -> Handler<()> {
        Arc::new(|client: &mut ClientHandle<()>| -> anyhow::Result<()> {
            let request = client.recv_request(64, Some(WAIT))?;
            client.send_response(&request)?;
            Ok(())
        })
    }

    fn listener_with<A: Acceptor>(acceptor: A, options: ServiceOptions) -> Listener<A, ()> {
        Listener {
            name: Arc::from("test"),
            shared: Arc::new(Shared::new(options.max_concurrent)),
            acceptor,
            handler: echo_handler(),
            cookie: Arc::new(()),
            options,
        }
    }

    /// Fails every accept.
    struct FailingAcceptor {
        calls: Arc<AtomicUsize>,
    }

    impl Acceptor for FailingAcceptor {
        fn accept_stream(&self) -> io::Result<UnixStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    /// Fails a few times, hands out one connection, then asks the listener to stop.
    struct FlakyAcceptor {
        calls: AtomicUsize,
        failures: usize,
        stream: std::sync::Mutex<Option<UnixStream>>,
        shared: Arc<Shared>,
    }

    impl Acceptor for FlakyAcceptor {
        fn accept_stream(&self) -> io::Result<UnixStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(io::Error::new(io::ErrorKind::Other, "transient accept failure"));
            }
            match self.stream.lock().unwrap().take() {
                Some(stream) => Ok(stream),
                None => {
                    self.shared.stopping.store(true, Ordering::SeqCst);
                    Err(io::Error::new(io::ErrorKind::Other, "listener closed"))
                }
            }
        }
    }

    #[test]
    fn test_accept_exhaustion_degrades_and_releases_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let options = ServiceOptions::default()
            .with_max_accept_retries(3)
            .with_accept_retry_delay(Duration::from_millis(1));
        let listener = listener_with(
            FailingAcceptor {
                calls: Arc::clone(&calls),
            },
            options,
        );
        let shared = Arc::clone(&listener.shared);

        listener.run();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(shared.state(), ServiceState::Degraded);
        assert_eq!(shared.admission.active(), 0);
    }

    #[test]
    fn test_admission_timeouts_degrade_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let options = ServiceOptions::default()
            .with_admission_timeout(Duration::from_millis(20))
            .with_max_admission_timeouts(3);
        let listener = listener_with(
            FailingAcceptor {
                calls: Arc::clone(&calls),
            },
            options,
        );
        let shared = Arc::clone(&listener.shared);
        let _held = shared.admission.acquire(WAIT).unwrap();

        let start = Instant::now();
        listener.run();

        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "must not accept without a slot");
        assert_eq!(shared.state(), ServiceState::Degraded);
        assert_eq!(shared.admission.active(), 1);
    }

    #[test]
    fn test_transient_accept_failures_are_retried() {
        let (server, client) = UnixStream::pair().unwrap();
        let mut peer = Channel::from_stream(client);
        peer.send(b"hello").unwrap();

        let options = ServiceOptions::default().with_accept_retry_delay(Duration::from_millis(1));
        let shared = Arc::new(Shared::new(1));
        let acceptor = FlakyAcceptor {
            calls: AtomicUsize::new(0),
            failures: 2,
            stream: std::sync::Mutex::new(Some(server)),
            shared: Arc::clone(&shared),
        };
        let listener = Listener {
            name: Arc::from("flaky"),
            shared: Arc::clone(&shared),
            acceptor,
            handler: echo_handler(),
            cookie: Arc::new(()),
            options,
        };

        listener.run();

        assert_eq!(peer.recv(64, Some(WAIT)).unwrap(), b"hello");
        assert_eq!(shared.state(), ServiceState::Running);
        assert!(shared.admission.wait_idle(WAIT));
    }

    #[test]
    fn test_admission_timeout_count_resets_after_grant() {
        let (server, client) = UnixStream::pair().unwrap();
        let mut peer = Channel::from_stream(client);
        peer.send(b"slow").unwrap();

        // Each saturated stretch lasts about 2.5 timeouts; together they
        // would exceed the bound of 4 if the count carried over.
        let options = ServiceOptions::default()
            .with_admission_timeout(Duration::from_millis(100))
            .with_max_admission_timeouts(4);
        let shared = Arc::new(Shared::new(1));
        let acceptor = FlakyAcceptor {
            calls: AtomicUsize::new(0),
            failures: 0,
            stream: std::sync::Mutex::new(Some(server)),
            shared: Arc::clone(&shared),
        };
        let slow_echo: Handler<()> = Arc::new(|client: &mut ClientHandle<()>| -> anyhow::Result<()> {
            let request = client.recv_request(64, Some(WAIT))?;
            thread::sleep(Duration::from_millis(250));
            client.send_response(&request)?;
            Ok(())
        });
        let listener = Listener {
            name: Arc::from("reset"),
            shared: Arc::clone(&shared),
            acceptor,
            handler: slow_echo,
            cookie: Arc::new(()),
            options,
        };

        let held = shared.admission.acquire(WAIT).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            drop(held);
        });

        listener.run();
        releaser.join().unwrap();

        assert_eq!(shared.state(), ServiceState::Running);
        assert_eq!(peer.recv(64, Some(WAIT)).unwrap(), b"slow");
        assert!(shared.admission.wait_idle(WAIT));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "stale");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists(), "stale socket file should remain after drop");

        let listener = bind(&path).expect("stale socket should be replaced");
        drop(listener);
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "live");
        let _live = UnixListener::bind(&path).unwrap();

        match bind(&path) {
            Err(RpcError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("Expected bind failure, got {:?}", other.map(|_| ())),
        }
    }
}
