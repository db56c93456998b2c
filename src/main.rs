use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_data::{DataRegistry, TokenService};
use weft_engine::{ExecutionEngine, ServerFleet};
use weft_gateway::GatewayServer;
use weft_protocol::HttpTransport;
use weft_wal::{spawn_mirror, EventLog, HttpMirror};

#[derive(Parser)]
#[command(name = "weft", version, about = "Client-side orchestrator for distributed workflow execution")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Bind address override, e.g. 0.0.0.0:7540
    #[arg(long, env = "WEFT_BIND")]
    bind: Option<String>,

    /// Event log path override
    #[arg(long, env = "WEFT_WAL")]
    wal_path: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Signing key for access tokens
    #[arg(long, env = "WEFT_TOKEN_KEY", default_value = "weft-dev-key")]
    token_key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level.clone()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,weft=debug")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::load_or_default(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(path) = cli.wal_path {
        config.wal.path = path.display().to_string();
    }

    info!(
        bind = %config.gateway.bind,
        wal = %config.wal.path,
        "Starting weft orchestrator"
    );

    // Singleton services, constructed once and passed by handle.
    let wal = Arc::new(EventLog::open(std::path::Path::new(&config.wal.path))?);
    let registry = Arc::new(DataRegistry::new());
    let tokens = Arc::new(TokenService::new(
        &config.tokens.issuer,
        cli.token_key.into_bytes(),
    ));
    let fleet = Arc::new(ServerFleet::new());
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(30))?);

    let engine = ExecutionEngine::new(
        wal.clone(),
        registry,
        tokens,
        transport,
        fleet,
        &config.gateway.public_url,
        config.tokens.clone(),
    );

    // Replay-then-serve: nothing is scheduled before the log is folded
    // back in and outstanding tasks are reconciled.
    let report = engine.recover().await?;
    if !report.quarantined.is_empty() {
        warn!(
            workflows = ?report.quarantined,
            "Some workflows are quarantined and will not resume"
        );
    }

    let shutdown = CancellationToken::new();

    let mirror_task = config.wal.mirror_url.as_deref().map(|url| {
        info!(url, "Mirroring event log");
        spawn_mirror(&wal, Arc::new(HttpMirror::new(url)), shutdown.clone())
    });

    let gateway = GatewayServer::new(config.gateway.clone(), engine);
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    server.await??;
    if let Some(task) = mirror_task {
        let _ = task.await;
    }
    wal.checkpoint()?;
    Ok(())
}
