use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use beacon_client::{BackoffPolicy, ClientConfig, ConnectionEvent, ConnectionManager, StateStore};
use beacon_core::EventBus;
use beacon_engine::{Collaborators, EngineConfig};
use beacon_settings::BeaconSettings;
use beacon_store::Database;
use beacon_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "beacon", version, about = "Development companion server and watcher")]
struct Cli {
    /// Settings file (defaults to ~/.beacon/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Connect to a server and log state changes as they arrive.
    Watch {
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => beacon_settings::load_settings_from_path(path),
        None => beacon_settings::load_settings(),
    }
    .context("loading settings")?;

    let telemetry = TelemetryConfig {
        json: settings.logging.json,
        ..TelemetryConfig::default()
    }
    .with_level_name(&settings.logging.level);
    let _ = beacon_telemetry::init_telemetry(&telemetry);

    match cli.command {
        Command::Serve { host, port, db } => serve(settings, host, port, db).await,
        Command::Watch { url } => watch(settings, url).await,
    }
}

async fn serve(
    settings: BeaconSettings,
    host: Option<String>,
    port: Option<u16>,
    db: Option<PathBuf>,
) -> anyhow::Result<()> {
    let db_path = db.unwrap_or(settings.storage.db_path);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let bus = EventBus::default();
    let collaborators = Collaborators::build(
        db,
        Arc::new(bus.clone()),
        EngineConfig {
            token_budget: settings.context.token_budget,
            stale_after_hours: settings.docs.stale_after_hours,
            default_project_path: std::env::current_dir().ok(),
        },
    );

    let config = beacon_server::ServerConfig {
        host: host.unwrap_or(settings.server.host),
        port: port.unwrap_or(settings.server.port),
        max_send_queue: settings.server.max_send_queue,
        heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs),
        heartbeat_timeout: Duration::from_secs(settings.server.heartbeat_timeout_secs),
        secret: SecretString::from(settings.auth.secret),
        legacy_secrets: settings
            .auth
            .legacy_secrets
            .into_iter()
            .map(SecretString::from)
            .collect(),
    };
    let handle = beacon_server::start(config, collaborators, bus)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "beacon server ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

async fn watch(settings: BeaconSettings, url: Option<String>) -> anyhow::Result<()> {
    let client = settings.client;
    let config = ClientConfig::new(url.unwrap_or(client.url), SecretString::from(settings.auth.secret))
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(client.base_delay_ms),
            max: Duration::from_millis(client.max_delay_ms),
            max_attempts: client.max_attempts,
            ..BackoffPolicy::default()
        })
        .with_request_timeout(Duration::from_millis(client.request_timeout_ms));

    let manager = ConnectionManager::new(config);
    let store = Arc::new(StateStore::new());
    let _feeds = store.attach(&manager);
    let _changes = store.on_change(|state| {
        tracing::info!(
            session = state.session.as_ref().map(|s| s.name.as_str()).unwrap_or("-"),
            context_pct = state.context.as_ref().map(|c| c.percent_used).unwrap_or(0.0),
            discrepancies = state.discrepancies.len(),
            checkpoints = state.checkpoints.len(),
            executions = state.executions.len(),
            "state updated"
        );
    });

    let (gave_up_tx, mut gave_up) = tokio::sync::mpsc::unbounded_channel();
    let _fatal = manager.on_connection_change(move |event| match event {
        ConnectionEvent::StateChanged(state) => tracing::info!(?state, "connection"),
        ConnectionEvent::MaxAttemptsReached { attempts } => {
            let _ = gave_up_tx.send(*attempts);
        }
    });

    manager.connect();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        Some(attempts) = gave_up.recv() => {
            anyhow::bail!("gave up after {attempts} reconnect attempts");
        }
    }
    manager.disconnect().await;
    Ok(())
}
