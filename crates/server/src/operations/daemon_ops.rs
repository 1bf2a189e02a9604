//! `daemon.*` and `service.*`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use opta_protocol::{ContractDescriptor, Safety};

use super::{op, NoInput, OpContext, OperationError, OperationSpec};
use crate::cmd_install_service::{self, ServiceUnit};
use crate::VERSION;

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "daemon.status",
            "Daemon status",
            "Identity, uptime, and load of the running daemon.",
            Safety::Read,
            daemon_status,
        ),
        op(
            "daemon.stop",
            "Stop daemon",
            "Shut the daemon down after in-flight requests finish.",
            Safety::Dangerous,
            daemon_stop,
        ),
        op(
            "service.install",
            "Install service",
            "Write a launchd/systemd user unit that starts the daemon at login.",
            Safety::Write,
            service_install,
        ),
        op(
            "service.uninstall",
            "Uninstall service",
            "Stop and remove the user service unit.",
            Safety::Dangerous,
            service_uninstall,
        ),
    ]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DaemonStatus {
    daemon_id: String,
    version: &'static str,
    contract: ContractDescriptor,
    pid: u32,
    bind: SocketAddr,
    data_dir: PathBuf,
    uptime_ms: u64,
    sessions: usize,
    background_running: usize,
    backend: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stopping {
    stopping: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ServiceInstall {
    /// Render the unit without writing it.
    #[serde(default)]
    dry_run: bool,
    /// Load the unit after writing it.
    #[serde(default)]
    enable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceInstalled {
    #[serde(flatten)]
    unit: ServiceUnit,
    written: bool,
    enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceRemoved {
    removed: Option<PathBuf>,
}

async fn daemon_status(ctx: Arc<OpContext>, _: NoInput) -> Result<DaemonStatus, OperationError> {
    Ok(DaemonStatus {
        daemon_id: ctx.registry.daemon_id().to_string(),
        version: VERSION,
        contract: ContractDescriptor::current(),
        pid: std::process::id(),
        bind: ctx.config.bind,
        data_dir: ctx.paths.root().to_path_buf(),
        uptime_ms: ctx.started_at.elapsed().as_millis() as u64,
        sessions: ctx.registry.len(),
        background_running: ctx.supervisor.running_count(),
        backend: ctx.registry.backend_name(),
    })
}

async fn daemon_stop(ctx: Arc<OpContext>, _: NoInput) -> Result<Stopping, OperationError> {
    ctx.shutdown.send_replace(true);
    Ok(Stopping { stopping: true })
}

async fn service_install(
    ctx: Arc<OpContext>,
    input: ServiceInstall,
) -> Result<ServiceInstalled, OperationError> {
    let bind = ctx.config.bind;
    let data_dir = ctx.paths.root().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let unit = cmd_install_service::render(bind, &data_dir)
            .map_err(|e| OperationError::Unavailable(e.to_string()))?;
        if input.dry_run {
            return Ok(ServiceInstalled {
                unit,
                written: false,
                enabled: false,
            });
        }
        let enabled = cmd_install_service::install(&unit, input.enable)
            .map_err(|e| OperationError::Internal(e.to_string()))?;
        Ok(ServiceInstalled {
            unit,
            written: true,
            enabled,
        })
    })
    .await
    .map_err(|e| OperationError::Internal(e.to_string()))?
}

async fn service_uninstall(_: Arc<OpContext>, _: NoInput) -> Result<ServiceRemoved, OperationError> {
    let removed = tokio::task::spawn_blocking(cmd_install_service::uninstall)
        .await
        .map_err(|e| OperationError::Internal(e.to_string()))?
        .map_err(|e| OperationError::Internal(e.to_string()))?;
    Ok(ServiceRemoved { removed })
}
