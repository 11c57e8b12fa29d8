use anyhow::{anyhow, Result};
#[cfg(feature = "metrics")]
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

#[cfg(feature = "metrics")]
use fusion_server::{metrics::MetricsContext, serve_metrics};
use fusion_server::{
    build_app,
    config::{CliOverrides, LogFormat, ServerConfig},
    signaling::SignalMailbox,
    telemetry::init_tracing,
    AppState, StorageState,
};
use fusion_storage::{
    connect, run_migrations, InMemoryKeyValueStore, KeyValueStore, PostgresKeyValueStore,
    StoragePool,
};

#[derive(Parser, Debug, Default)]
#[command(
    name = "fusion-server",
    version,
    about = "Fusion Connect call signaling gateway"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    mailbox_warn_depth: Option<usize>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            database_url: self.database_url,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            mailbox_warn_depth: self.mailbox_warn_depth,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Apply pending SQL migrations to the configured database.
    Migrate,
    /// Print the signals waiting for a user without delivering them.
    InspectMailbox(MailboxCommand),
    /// Discard every signal waiting for a user.
    PurgeMailbox(MailboxCommand),
}

#[derive(Args, Debug)]
struct MailboxCommand {
    /// Recipient whose mailbox is inspected or purged.
    #[arg(long)]
    username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    run(Arc::new(config)).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Migrate => {
            let pool = connect_database(config).await?;
            let count = run_migrations(&pool).await?;
            println!("Database schema up to date ({count} migration(s) known)");
            Ok(())
        }
        CliCommand::InspectMailbox(cmd) => {
            let mailbox = command_mailbox(config, &cmd).await?;
            let signals = mailbox.get_signals(cmd.username.trim()).await?;
            if signals.is_empty() {
                println!("No pending signals for '{}'", cmd.username.trim());
            }
            for signal in signals {
                println!("{}", serde_json::to_string(&signal)?);
            }
            Ok(())
        }
        CliCommand::PurgeMailbox(cmd) => {
            let mailbox = command_mailbox(config, &cmd).await?;
            let username = cmd.username.trim();
            let pending = mailbox.get_signals(username).await?.len();
            mailbox.clear_signals(username).await?;
            println!("Discarded {pending} pending signal(s) for '{username}'");
            Ok(())
        }
    }
}

async fn connect_database(config: &ServerConfig) -> Result<StoragePool> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured for this command"))?;
    connect(database_url).await
}

async fn command_mailbox(config: &ServerConfig, cmd: &MailboxCommand) -> Result<SignalMailbox> {
    if cmd.username.trim().is_empty() {
        anyhow::bail!("username must be provided");
    }
    let pool = connect_database(config).await?;
    let store: Arc<dyn KeyValueStore> = Arc::new(PostgresKeyValueStore::new(pool));
    Ok(SignalMailbox::new(
        store,
        config.signaling.mailbox_warn_depth,
    ))
}

async fn open_storage(config: &ServerConfig) -> (Arc<dyn KeyValueStore>, StorageState) {
    let Some(url) = config.database_url.as_deref() else {
        info!("database_url not configured; signals and call history live in process memory");
        return (
            Arc::new(InMemoryKeyValueStore::new()),
            StorageState::InMemory,
        );
    };

    let connected = async {
        let pool = connect(url).await?;
        run_migrations(&pool).await?;
        Ok::<_, anyhow::Error>(pool)
    }
    .await;

    match connected {
        Ok(pool) => {
            info!("database connection established");
            (
                Arc::new(PostgresKeyValueStore::new(pool)),
                StorageState::Connected,
            )
        }
        Err(err) => {
            error!(?err, "failed to prepare database; falling back to in-memory storage");
            (
                Arc::new(InMemoryKeyValueStore::new()),
                StorageState::Error(err.to_string()),
            )
        }
    }
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no FUSION_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected FUSION_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        database_url_configured = config.database_url.is_some(),
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        mailbox_warn_depth = config.signaling.mailbox_warn_depth,
        "resolved server configuration"
    );

    let (store, storage) = open_storage(&config).await;

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    #[cfg(feature = "metrics")]
    let state = AppState::new(config.clone(), storage, store).with_metrics(metrics_ctx);
    #[cfg(not(feature = "metrics"))]
    let state = AppState::new(config.clone(), storage, store);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let metrics_state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, metrics_state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}
