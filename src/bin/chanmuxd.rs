//! chanmux demo server
//!
//! Serves the chanmux protocol over WebSocket with two illustrative
//! services: an `echo` request handler and a `clock` topic that publishes a
//! tick every `--clock-interval` seconds.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (127.0.0.1:8080)
//! chanmuxd
//!
//! # Listen elsewhere, with settings from a file
//! chanmuxd --listen 0.0.0.0:9000 --config chanmux.toml
//! ```
//!
//! A client identifies itself with its first frame, then e.g.:
//!
//! ```text
//! {"channel":"c1","type":"subscribe","body":"clock"}
//! {"channel":"c2","type":"echo","body":{"text":"hi"}}
//! {"channel":"c2","type":"clock.get"}
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use chanmuxd::{Server, ServerConfig};

/// Topic the clock publishes on
const CLOCK_TOPIC: &str = "clock";

/// chanmux demo server - channel multiplexing over WebSocket
#[derive(Parser, Debug)]
#[command(name = "chanmuxd", version, about)]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "CHANMUX_LISTEN")]
    listen: Option<SocketAddr>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-connection limit on concurrently running handlers
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Seconds between clock ticks (0 disables the clock)
    #[arg(long, default_value_t = 1)]
    clock_interval: u64,
}

impl Args {
    /// Builds the server config: defaults, then file, then flags/env.
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(max_in_flight) = self.max_in_flight {
            config.max_in_flight = max_in_flight;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// State shared by the clock task and the `clock.get` handler.
#[derive(Default)]
struct Clock {
    ticks: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Tick {
    tick: u64,
    at: DateTime<Utc>,
}

impl Clock {
    fn advance(&self) -> Tick {
        Tick {
            tick: self.ticks.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
        }
    }

    fn current(&self) -> Tick {
        Tick {
            tick: self.ticks.load(Ordering::Relaxed),
            at: Utc::now(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("chanmuxd=info".parse()?)
                .add_directive("chanmux_core=info".parse()?)
                .add_directive("chanmux_protocol=info".parse()?),
        )
        .init();

    let config = args.server_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.listen_addr,
        "chanmux server starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = Server::new(config, cancel_token.clone());
    let clock = Arc::new(Clock::default());
    register_handlers(&server, Arc::clone(&clock))
        .await
        .context("Failed to register handlers")?;

    let clock_handle = (args.clock_interval > 0).then(|| {
        spawn_clock(
            server.clone(),
            clock,
            Duration::from_secs(args.clock_interval),
            cancel_token.clone(),
        )
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        cancel_token.cancel();
        return Err(e.into());
    }

    if let Some(handle) = clock_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Clock task failed");
        }
    }

    info!("chanmux server stopped");
    Ok(())
}

async fn register_handlers(server: &Server, clock: Arc<Clock>) -> Result<()> {
    server
        .handle_fn("echo", |req, rw| async move {
            let body: Value = req.unpack().await?;
            rw.write("echo", &body).await;
            Ok(())
        })
        .await?;

    server
        .handle_fn("clock.get", move |_req, rw| {
            let clock = Arc::clone(&clock);
            async move {
                rw.write("clock.tick", &clock.current()).await;
                Ok(())
            }
        })
        .await?;

    Ok(())
}

/// Publishes a tick on the `clock` topic every `interval` until cancelled.
fn spawn_clock(
    server: Server,
    clock: Arc<Clock>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let tick = clock.advance();
                    let delivered = server.publish(CLOCK_TOPIC, "clock.tick", &tick).await;
                    debug!(tick = tick.tick, delivered, "Clock tick");
                }
            }
        }
    })
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
