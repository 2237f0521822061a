use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::events::{BroadcastObserver, Observer};
use turnstile::session::SessionId;
use turnstile::store::{MemoryStore, StoreError};
use turnstile::{AdmissionLayer, RequestContext};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Request admission over a shared store")]
struct Cli {
    /// Configuration file (YAML or TOML). `TURNSTILE__*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-process store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration, then print it
    Validate,
    /// Connect to the store and print its health
    Health,
    /// Run admission decisions for a request and print them
    Admit {
        /// Request path
        #[arg(long)]
        path: String,
        /// Authenticated caller
        #[arg(long)]
        identity: Option<String>,
        /// Caller network address
        #[arg(long)]
        addr: Option<IpAddr>,
        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Inspect or modify sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Connect and print lifecycle events until interrupted
    Monitor,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Print a session
    Get { id: String },
    /// Store a session payload
    Set {
        id: String,
        payload: String,
        /// Lifetime in seconds; defaults to the configured TTL
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Remove a session
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The store client builds its TLS config from the process-wide provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = TurnstileConfig::load(cli.config.as_deref()).context("Invalid configuration")?;
    init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let observer = Arc::new(BroadcastObserver::new(256));
    let memory = cli.memory;

    match cli.command {
        Command::Validate => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Health => {
            let layer = build_layer(&config, memory, observer)?;
            let _ = layer.connect().await;
            let health = layer.health();
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.is_healthy() {
                bail!("store is not healthy");
            }
        }
        Command::Admit {
            path,
            identity,
            addr,
            count,
        } => {
            let layer = build_layer(&config, memory, observer)?;
            connect(&layer).await?;
            let mut ctx = RequestContext::new(path);
            if let Some(identity) = identity {
                ctx = ctx.with_identity(identity);
            }
            if let Some(addr) = addr {
                ctx = ctx.with_remote_addr(addr);
            }
            for _ in 0..count {
                let decision = layer.admit(&ctx).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Session(command) => {
            let layer = build_layer(&config, memory, observer)?;
            connect(&layer).await?;
            run_session_command(&layer, command).await?;
        }
        Command::Monitor => {
            let mut events = observer.subscribe();
            let layer = build_layer(&config, memory, observer)?;
            connect(&layer).await?;
            info!("Monitoring store events");

            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                        Some(Err(e)) => warn!(error = %e, "Event stream lagged"),
                        None => break,
                    },
                }
            }
            info!("Monitor stopped");
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn build_layer(
    config: &TurnstileConfig,
    memory: bool,
    observer: Arc<dyn Observer>,
) -> anyhow::Result<AdmissionLayer> {
    let layer = if memory {
        let clock = Arc::new(SystemClock);
        let store = MemoryStore::new(clock.clone());
        AdmissionLayer::with_connector(config, Arc::new(store.connector()), clock, observer)?
    } else {
        AdmissionLayer::from_config(config, observer)?
    };
    Ok(layer)
}

/// Connect, tolerating a store that is down but still being retried.
async fn connect(layer: &AdmissionLayer) -> anyhow::Result<()> {
    match layer.connect().await {
        Ok(()) => Ok(()),
        Err(e @ StoreError::PermanentFailure { .. }) => {
            Err(e).context("Store connection abandoned")
        }
        Err(e) => {
            warn!(error = %e, "Continuing while the store reconnects");
            Ok(())
        }
    }
}

async fn run_session_command(layer: &AdmissionLayer, command: SessionCommand) -> anyhow::Result<()> {
    let sessions = layer.sessions();
    match command {
        SessionCommand::Get { id } => {
            let id = SessionId::new(id);
            match sessions.get(&id).await.context("Failed to read session")? {
                Some(record) => println!(
                    "{}",
                    serde_json::json!({
                        "id": record.id,
                        "payload": String::from_utf8_lossy(&record.payload),
                        "expires_at": record.expires_at,
                    })
                ),
                None => bail!("session {} not found", id),
            }
        }
        SessionCommand::Set { id, payload, ttl } => {
            let id = SessionId::new(id);
            sessions
                .set(&id, payload.as_bytes(), ttl.map(Duration::from_secs))
                .await
                .context("Failed to store session")?;
            info!(session = %id, "Session stored");
        }
        SessionCommand::Delete { id } => {
            let id = SessionId::new(id);
            let existed = sessions.delete(&id).await.context("Failed to delete session")?;
            println!("{}", serde_json::json!({ "id": id, "deleted": existed }));
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
