//! Opta daemon
//!
//! Long-lived local process that lets many clients drive AI turns against
//! shared sessions, gate tool calls behind human approval, and supervise
//! background commands. Speaks JSON envelopes over WebSocket with a parallel
//! one-shot HTTP surface.

mod auth;
mod background;
mod clock;
mod cmd_install_service;
mod cmd_status;
mod config;
mod crypto;
mod envelope;
mod http_api;
mod logging;
mod migration_runner;
mod operations;
mod paths;
mod permission;
mod persistence;
mod replay;
mod session;
mod session_actor;
mod session_command;
mod state;
mod store;
mod transition;
mod turn_runner;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use clap::{Parser, Subcommand};
use tokio::sync::{oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use opta_connector_core::{ScriptedBackend, TurnBackend};
use opta_connector_lmx::{LmxBackend, LmxConfig, LmxHttpClient};
use opta_protocol::{new_prefixed_id, ContractDescriptor};

use crate::background::{EventSink, Supervisor};
use crate::clock::now_ms;
use crate::config::{BackendConfig, BackendKind, ConfigOverrides, DaemonConfig};
use crate::crypto::SecretCipher;
use crate::operations::{OpContext, OperationExecutor};
use crate::paths::DataPaths;
use crate::persistence::{
    create_persistence_channel, load_process_records, open_db, PersistCommand, PersistenceWriter,
};
use crate::session_actor::ActorContext;
use crate::state::{AppState, SessionRegistry};
use crate::store::Store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "optad", version = VERSION, about = "Opta daemon")]
struct Cli {
    /// Data directory (default: ~/.opta/daemon)
    #[arg(long, global = true, env = "OPTAD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/config.toml)
    #[arg(long, global = true, env = "OPTAD_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    start: StartArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default)
    Start,
    /// Check whether a daemon is running and compatible
    Status,
    /// Install a launchd/systemd user service that starts the daemon at login
    InstallService {
        /// Load the service immediately
        #[arg(long)]
        enable: bool,
    },
    /// Remove the user service
    UninstallService,
}

#[derive(clap::Args)]
struct StartArgs {
    #[arg(long, global = true, env = "OPTAD_BIND")]
    bind: Option<SocketAddr>,

    /// Require `Authorization: Bearer <token>` on every route but /health
    #[arg(long, global = true, env = "OPTAD_AUTH_TOKEN")]
    auth_token: Option<String>,

    #[arg(long, global = true, value_enum, env = "OPTAD_BACKEND")]
    backend: Option<BackendKind>,

    #[arg(long, global = true, env = "OPTAD_LMX_WS_URL")]
    lmx_ws_url: Option<String>,

    #[arg(long, global = true, env = "OPTAD_LMX_HTTP_URL")]
    lmx_http_url: Option<String>,

    #[arg(long, global = true, env = "OPTAD_LMX_API_KEY")]
    lmx_api_key: Option<String>,

    /// Model used when a session does not name one
    #[arg(long, global = true, env = "OPTAD_MODEL")]
    model: Option<String>,

    /// Mirror logs to stderr
    #[arg(long, global = true)]
    foreground_logs: bool,
}

impl StartArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind,
            auth_token: self.auth_token.clone(),
            backend: self.backend,
            lmx_ws_url: self.lmx_ws_url.clone(),
            lmx_http_url: self.lmx_http_url.clone(),
            lmx_api_key: self.lmx_api_key.clone(),
            model: self.model.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = DaemonConfig::load(&config_path)?.apply(cli.start.overrides());

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_daemon(paths, config, cli.start.foreground_logs).await,
        Command::Status => {
            cmd_status::run(&paths, config.bind, config.auth_token.as_deref()).await
        }
        Command::InstallService { enable } => {
            cmd_install_service::run(paths.root(), config.bind, enable)
        }
        Command::UninstallService => cmd_install_service::run_uninstall(),
    }
}

fn build_backend(config: &BackendConfig) -> Arc<dyn TurnBackend> {
    match config.kind {
        BackendKind::Scripted => Arc::new(ScriptedBackend::echo()),
        BackendKind::Lmx => Arc::new(LmxBackend::new(LmxConfig {
            ws_url: config.lmx_ws_url.clone(),
            http_url: config.lmx_http_url.clone(),
            api_key: config.lmx_api_key.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            auto_approve_tools: config.auto_approve_tools.clone(),
            max_tool_rounds: config.max_tool_rounds as usize,
            ..Default::default()
        })),
    }
}

async fn run_daemon(paths: DataPaths, config: DaemonConfig, mirror_stderr: bool) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let logging = logging::init_logging(&paths.log_dir(), mirror_stderr)?;
    let daemon_id = new_prefixed_id("d");
    let started_at = Instant::now();

    info!(
        component = "daemon",
        event = "daemon.starting",
        daemon_id = %daemon_id,
        run_id = %logging.run_id,
        version = VERSION,
        data_dir = %paths.root().display(),
        bind = %config.bind,
        backend = ?config.backend.kind,
        "Starting Opta daemon"
    );

    // Schema first; everything below reads or writes the database.
    let db_path = paths.db_path();
    {
        let mut conn = open_db(&db_path)?;
        let applied = migration_runner::run_migrations(&mut conn)?;
        info!(
            component = "daemon",
            event = "daemon.migrations_applied",
            applied = applied,
        );
    }

    let cipher = SecretCipher::load_or_create(&paths.encryption_key())?;
    let store = Arc::new(Store::new(db_path.clone(), cipher));

    let (persist_tx, persist_rx) = create_persistence_channel();
    let persistence = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let backend = build_backend(&config.backend);
    let registry = Arc::new(SessionRegistry::new(
        daemon_id.clone(),
        config.backend.default_model.clone(),
        config.sessions.clone(),
        ActorContext {
            backend,
            persist_tx: persist_tx.clone(),
            cancel_grace: config.sessions.cancel_grace(),
            progress_interval: config.sessions.progress_interval(),
        },
    ));

    let sink: Arc<dyn EventSink> = registry.clone();
    let supervisor = Supervisor::new(config.background.clone(), sink, persist_tx.clone());
    let records = {
        let db_path = db_path.clone();
        tokio::task::spawn_blocking(move || load_process_records(&db_path)).await??
    };
    let report = supervisor.recover(records).await;
    info!(
        component = "daemon",
        event = "daemon.background_recovered",
        loaded = report.loaded,
        reconciled = report.reconciled,
        adopted = report.adopted,
    );

    let lmx = match config.backend.kind {
        BackendKind::Lmx => match LmxHttpClient::new(
            &config.backend.lmx_http_url,
            config.backend.lmx_api_key.clone(),
            Duration::from_millis(config.backend.http_timeout_ms),
        ) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(
                    component = "daemon",
                    event = "daemon.lmx_http_unavailable",
                    error = %e,
                );
                None
            }
        },
        BackendKind::Scripted => None,
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let operations = Arc::new(OperationExecutor::new(OpContext {
        store,
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        paths: paths.clone(),
        config: config.clone(),
        lmx,
        shutdown: shutdown_tx,
        persist_tx: persist_tx.clone(),
        started_at,
    }));

    let state = Arc::new(AppState {
        registry: registry.clone(),
        supervisor,
        operations,
        started_at,
    });

    let mut app = http_api::routes();
    if let Some(token) = config.auth_token.clone() {
        app = app.layer(middleware::from_fn_with_state(token, auth::auth_middleware));
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let bound = listener.local_addr()?;
    write_run_files(&paths, &daemon_id, bound)?;
    info!(
        component = "daemon",
        event = "daemon.listening",
        addr = %bound,
        auth = config.auth_token.is_some(),
        "Listening on {}",
        bound
    );

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(component = "daemon", event = "daemon.signal", "Received Ctrl-C");
                }
                _ = async {
                    while shutdown_rx.changed().await.is_ok() {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                } => {
                    info!(component = "daemon", event = "daemon.stop_requested");
                }
            }
        })
        .await;

    registry.shutdown_all().await;
    let (reply, flushed) = oneshot::channel();
    if persist_tx.send(PersistCommand::Flush { reply }).await.is_ok() {
        let _ = flushed.await;
    }
    drop(persist_tx);
    drop(registry);
    persistence.abort();
    remove_run_files(&paths);

    match &serve_result {
        Ok(()) => info!(component = "daemon", event = "daemon.stopped"),
        Err(e) => error!(component = "daemon", event = "daemon.serve_failed", error = %e),
    }
    serve_result?;
    Ok(())
}

/// `optad.pid` plus `daemon.json` so local tools can find this instance.
fn write_run_files(paths: &DataPaths, daemon_id: &str, bound: SocketAddr) -> anyhow::Result<()> {
    std::fs::write(paths.pid_file(), std::process::id().to_string())?;
    let descriptor = serde_json::json!({
        "daemonId": daemon_id,
        "pid": std::process::id(),
        "bind": bound.to_string(),
        "version": VERSION,
        "contract": ContractDescriptor::current(),
        "startedAt": now_ms(),
    });
    std::fs::write(paths.state_file(), serde_json::to_vec_pretty(&descriptor)?)?;
    Ok(())
}

fn remove_run_files(paths: &DataPaths) {
    for path in [paths.pid_file(), paths.state_file()] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    component = "daemon",
                    event = "daemon.run_file_cleanup_failed",
                    path = %path.display(),
                    error = %e,
                );
            }
        }
    }
}
