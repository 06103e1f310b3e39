//! localrpc - run or call local RPC services from the command line.
//!
//! `localrpc serve <name>` runs an echo service until Ctrl-C, which is handy
//! for checking that a socket directory is usable and for load-testing
//! admission limits. `localrpc call <name> <payload>` performs one call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localrpc::ipc::{start_service_with, ClientHandle, RpcClient, ServiceOptions, DEFAULT_SOCKET_DIR};

/// How long the echo handler waits for the request after accepting.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for in-flight exchanges.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between stats log lines while serving.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "localrpc", version, about = "Run or call local RPC services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an echo service until interrupted
    Serve {
        /// Service name (socket file name)
        name: String,
        /// Connections allowed in flight at once
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Directory for the service socket
        #[arg(long)]
        socket_dir: Option<PathBuf>,
        /// JSON file with service options; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Delay before each response, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Largest request read, in bytes
        #[arg(long, default_value_t = 4096)]
        max_request: usize,
    },
    /// Send one request and print the response
    Call {
        /// Service name
        name: String,
        /// Request payload (UTF-8, or hex with --hex)
        payload: String,
        /// Treat the payload as hex and print the response as hex
        #[arg(long)]
        hex: bool,
        /// Response buffer size, in bytes
        #[arg(long, default_value_t = 4096)]
        capacity: usize,
        /// Response timeout in milliseconds; 0 waits forever
        #[arg(long, default_value_t = 20_000)]
        timeout_ms: u64,
        /// Directory holding service sockets
        #[arg(long, default_value = DEFAULT_SOCKET_DIR)]
        socket_dir: PathBuf,
        /// Connection attempts while the service is unreachable
        #[arg(long, default_value_t = 1)]
        attempts: u32,
    },
}

/// Cookie shared by every echo exchange.
#[derive(Debug)]
struct EchoConfig {
    delay: Duration,
    max_request: usize,
}

fn echo(client: &mut ClientHandle<EchoConfig>) -> Result<()> {
    let config = client.cookie();
    let (delay, max_request) = (config.delay, config.max_request);

    let request = client.recv_request(max_request, Some(REQUEST_TIMEOUT))?;
    tracing::debug!("{}: echoing {} bytes", client.name(), request.len());

    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    client.send_response(&request)?;
    Ok(())
}

fn load_options(path: &Path) -> Result<ServiceOptions> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid service options in {}", path.display()))
}

async fn serve(
    name: String,
    max_concurrent: Option<usize>,
    socket_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    delay_ms: u64,
    max_request: usize,
) -> Result<()> {
    let mut options = match config {
        Some(path) => load_options(&path)?,
        None => ServiceOptions::default(),
    };
    if let Some(max_concurrent) = max_concurrent {
        options.max_concurrent = max_concurrent;
    }
    if let Some(dir) = socket_dir {
        options.socket_dir = dir;
    }

    let cookie = EchoConfig {
        delay: Duration::from_millis(delay_ms),
        max_request,
    };
    let service = start_service_with(&name, echo, cookie, options)
        .with_context(|| format!("Failed to start service {}", name))?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                tracing::info!("{}", serde_json::to_string(&service.stats())?);
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&service.stats())?);

    tokio::task::spawn_blocking(move || service.shutdown(DRAIN_TIMEOUT))
        .await
        .context("Shutdown task failed")?
        .context("Service did not drain cleanly")?;

    Ok(())
}

async fn call(
    name: String,
    payload: String,
    as_hex: bool,
    capacity: usize,
    timeout_ms: u64,
    socket_dir: PathBuf,
    attempts: u32,
) -> Result<()> {
    let request = if as_hex {
        hex::decode(payload.trim()).context("Payload is not valid hex")?
    } else {
        payload.into_bytes()
    };
    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    let client = RpcClient::with_socket_dir(socket_dir);

    let result = if attempts > 1 {
        let name = name.clone();
        tokio::task::spawn_blocking(move || {
            client.call_with_retry(&name, &request, capacity, timeout, attempts)
        })
        .await
        .context("Call task failed")?
    } else {
        client.call_async(&name, request, capacity, timeout).await
    };
    let response = result.with_context(|| format!("Call to {} failed", name))?;

    if as_hex {
        println!("{}", hex::encode(&response));
    } else {
        println!("{}", String::from_utf8_lossy(&response));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only responses and stats.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "localrpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            name,
            max_concurrent,
            socket_dir,
            config,
            delay_ms,
            max_request,
        } => serve(name, max_concurrent, socket_dir, config, delay_ms, max_request).await,
        Command::Call {
            name,
            payload,
            hex,
            capacity,
            timeout_ms,
            socket_dir,
            attempts,
        } => call(name, payload, hex, capacity, timeout_ms, socket_dir, attempts).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_defaults() {
        let cli = Cli::parse_from(["localrpc", "call", "echo", "hi"]);
        match cli.command {
            Command::Call {
                capacity,
                timeout_ms,
                socket_dir,
                attempts,
                hex,
                ..
            } => {
                assert_eq!(capacity, 4096);
                assert_eq!(timeout_ms, 20_000);
                assert_eq!(socket_dir, PathBuf::from("/tmp"));
                assert_eq!(attempts, 1);
                assert!(!hex);
            }
            other => panic!("Expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_load_options_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.json");
        std::fs::write(&path, r#"{"max_concurrent": 8, "admission_timeout_ms": 500}"#).unwrap();

        let options = load_options(&path).unwrap();

        assert_eq!(options.max_concurrent, 8);
        assert_eq!(options.admission_timeout(), Duration::from_millis(500));
        assert_eq!(options.socket_dir, PathBuf::from("/tmp"));
    }
}
