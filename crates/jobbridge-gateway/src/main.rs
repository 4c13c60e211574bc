//! # jobbridge
//!
//! Gateway binary: loads settings, wires the queue and pub/sub backends and
//! serves the WebSocket endpoint until Ctrl-C / SIGTERM.

#![deny(unsafe_code)]

mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use jobbridge_server::auth::{TokenValidator, issue_token};
use jobbridge_server::backend::{MemoryBroker, MemoryQueue};
use jobbridge_server::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, wait_for_signal};
use jobbridge_server::{Backends, EventPublisher, GatewayServer, ServerConfig, method_registry};
use jobbridge_settings::{BackendKind, GatewaySettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Job-notification WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "jobbridge", about = "Job-notification WebSocket gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway.
    Serve(ServeArgs),
    /// Mint a development token signed with the configured secret.
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Settings file (defaults to `~/.jobbridge/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Backend: `memory` or `redis`.
    #[arg(long)]
    backend: Option<String>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Answer jobs in-process (memory backend only).
    #[arg(long)]
    loopback_worker: bool,
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// Settings file (defaults to `~/.jobbridge/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// `sub` claim.
    #[arg(long)]
    subject: String,

    /// Lifetime in seconds.
    #[arg(long, default_value = "3600")]
    ttl_secs: u64,
}

fn load_settings(path: Option<PathBuf>) -> Result<GatewaySettings> {
    let path = path.unwrap_or_else(jobbridge_settings::settings_path);
    jobbridge_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// Apply CLI flags over the loaded settings.
fn apply_cli_overrides(settings: &mut GatewaySettings, args: &ServeArgs) -> Result<()> {
    if let Some(host) = &args.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(backend) = &args.backend {
        settings.backend.kind = BackendKind::parse(backend)
            .with_context(|| format!("Unknown backend '{backend}' (expected memory or redis)"))?;
    }
    if let Some(level) = &args.log_level {
        settings.logging.level.clone_from(level);
    }
    if args.loopback_worker && settings.backend.kind != BackendKind::Memory {
        bail!("--loopback-worker requires the memory backend");
    }
    Ok(())
}

#[cfg(feature = "redis")]
async fn redis_backends(settings: &GatewaySettings) -> Result<Backends> {
    use jobbridge_server::backend::redis::{RedisPubSub, RedisQueue};

    let queue = RedisQueue::connect(&settings.backend.address, &settings.backend.queue_key)
        .await
        .context("Failed to connect redis queue")?;
    let pubsub = RedisPubSub::connect(&settings.backend.address, &settings.backend.channel_prefix)
        .await
        .context("Failed to connect redis pub/sub")?;
    Ok(Backends {
        submitter: Arc::new(queue),
        pubsub: Arc::new(pubsub),
    })
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn redis_backends(_settings: &GatewaySettings) -> Result<Backends> {
    bail!("this binary was built without the `redis` feature")
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load_settings(args.config.clone())?;
    apply_cli_overrides(&mut settings, &args)?;
    jobbridge_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    settings.validate().context("Invalid settings")?;

    let metrics = jobbridge_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let worker_cancel = CancellationToken::new();
    // Held for the server's lifetime so in-memory submissions keep succeeding.
    let mut idle_queue = None;
    let backends = match settings.backend.kind {
        BackendKind::Memory => {
            let (queue, jobs) = MemoryQueue::new();
            let broker = MemoryBroker::new();
            if args.loopback_worker {
                let publisher = EventPublisher::new(
                    Arc::new(broker.client()),
                    settings.backend.channel_prefix.clone(),
                );
                let _worker = tokio::spawn(worker::run(jobs, publisher, worker_cancel.clone()));
            } else {
                warn!("memory backend without --loopback-worker: jobs will wait until they time out");
                idle_queue = Some(jobs);
            }
            Backends {
                submitter: Arc::new(queue),
                pubsub: Arc::new(broker.client()),
            }
        }
        BackendKind::Redis => redis_backends(&settings).await?,
    };

    let server = GatewayServer::new(
        ServerConfig::from_settings(&settings),
        method_registry(&settings),
        TokenValidator::from_settings(&settings.auth),
        backends,
    )
    .with_metrics(metrics);

    info!(
        backend = %settings.backend.kind,
        methods = ?server_methods(&settings),
        "starting jobbridge"
    );
    let handle = server.listen().await.context("Failed to start server")?;
    info!(addr = %handle.local_addr(), "jobbridge ready");

    wait_for_signal().await;
    worker_cancel.cancel();
    let closed = handle.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    drop(idle_queue);
    info!(connections = closed, "jobbridge stopped");
    Ok(())
}

fn server_methods(settings: &GatewaySettings) -> Vec<&str> {
    settings.methods.0.keys().map(String::as_str).collect()
}

fn token(args: &TokenArgs) -> Result<()> {
    let settings = load_settings(args.config.clone())?;
    if settings.auth.jwt_secret.is_empty() {
        bail!("auth.jwtSecret is not configured");
    }
    let token = issue_token(
        &settings.auth,
        &args.subject,
        Duration::from_secs(args.ttl_secs),
    )
    .context("Failed to sign token")?;
    println!("{token}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Token(args) => token(&args),
    }
}
