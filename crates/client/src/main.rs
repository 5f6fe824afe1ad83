//! Devchat Client - session runner
//!
//! Wires the synchronization layer for one session: reads configuration from
//! the environment, restores cached state, connects the sockets when a token is
//! stored and keeps the caches in sync until interrupted.
//!
//! Usage: `devchat-client [workspace-id]` (or `DEVCHAT_WORKSPACE`).

use std::sync::Arc;

use anyhow::Context;
use devchat_client::{ClientConfig, FileStore, KeyValueStore, SyncCoordinator, SyncNotice};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("devchat_client=debug")),
        )
        .init();

    let config = ClientConfig::from_env();
    let storage: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::in_config_dir().context("failed to open client storage")?);

    let coordinator = SyncCoordinator::start(&config, storage);
    let _mounted = coordinator.mount();

    let workspace = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DEVCHAT_WORKSPACE").ok());

    if let Some(workspace) = &workspace {
        match coordinator.fetch_workspace_channels(workspace, false).await {
            Ok(channels) => tracing::info!(workspace, count = channels.len(), "channels loaded"),
            Err(e) => tracing::warn!(workspace, error = %e, "failed to load channels"),
        }
    }

    let mut notices = coordinator.subscribe_notices();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(SyncNotice::Invalidated { family, scope }) => {
                    tracing::info!(family, %scope, "cache invalidated");
                    // Re-read what this session is showing.
                    if family == devchat_client::stores::channels::FAMILY
                        && workspace.as_deref() == Some(scope.as_str())
                    {
                        if let Err(e) = coordinator.fetch_workspace_channels(&scope, false).await {
                            tracing::warn!(workspace = %scope, error = %e, "failed to refresh channels");
                        }
                    }
                }
                Ok(SyncNotice::Connection { name }) => {
                    if let Some(handle) = coordinator.sockets().handle(name) {
                        tracing::debug!(connection = %name, status = ?handle.status, "connection state");
                    }
                }
                Ok(notice) => tracing::debug!(?notice, "sync notice"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "missed sync notices"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("shutting down");
    Ok(())
}
