use anyhow::{Context, Result};
use harbor_core::Runtime;
use std::path::Path;
use tracing::{error, info, warn};

use crate::{config, logging};

pub async fn run(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path).await?;
    let _log_guard = logging::init(&config.logging)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting Harbor runtime"
    );
    info!(
        event = "server_configuration",
        max_connections = config.connections.max_connections,
        max_connections_per_user = config.connections.max_connections_per_user,
        idle_timeout_secs = config.connections.idle_timeout_secs,
        transfer_timeout_secs = config.transfers.timeout_secs,
        defender_enabled = config.defender.enabled,
        key_pairs = config.tls.certificates.len(),
        revocation_lists = config.tls.revocation_lists.len(),
        log_format = ?config.logging.format,
        audit_enabled = config.logging.audit_enabled,
        "Runtime configuration"
    );

    let runtime = Runtime::new(config).context("Failed to initialize runtime")?;
    runtime.start();

    wait_for_shutdown(&runtime).await?;

    let drained = runtime.shutdown().await;
    let metrics = serde_json::to_string(&runtime.metrics().snapshot())?;
    info!(
        event = "server_stopped",
        drained,
        metrics = %metrics,
        "Harbor runtime stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(runtime: &Runtime) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!(event = "shutdown_requested", signal = "SIGINT", "Shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!(event = "shutdown_requested", signal = "SIGTERM", "Shutting down");
                return Ok(());
            }
            _ = hangup.recv() => reload(runtime),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runtime: &Runtime) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!(event = "shutdown_requested", signal = "ctrl-c", "Shutting down");
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload(runtime: &Runtime) {
    if let Err(e) = runtime.reload_certificates() {
        error!(
            event = "reload_failed",
            error = %e,
            "Keeping the current certificates"
        );
    }

    if let Some(path) = &runtime.config().defender.overrides_file {
        if let Err(e) = runtime.defender().load_overrides(path) {
            warn!(event = "reload_failed", error = %e, "Defender overrides not applied");
        }
    }
}
