//! One-shot subsystem initialization.
//!
//! The host awaits [`initialize`] once before constructing a session. It
//! either hands back a complete collaborator bundle or fails; there is no
//! per-frame readiness polling.

use std::time::Duration;

use anchorsync_core::{AnchorSession, AnchorSyncConfig, Collaborators, SessionError, SubsystemLoader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("subsystems not ready after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub async fn initialize(
    loader: &dyn SubsystemLoader,
    timeout: Duration,
) -> Result<Collaborators, InitError> {
    let collaborators = tokio::time::timeout(timeout, loader.load())
        .await
        .map_err(|_| InitError::Timeout(timeout))??;
    collaborators.require()?;
    tracing::info!(?collaborators, "anchor subsystems ready");
    Ok(collaborators)
}

/// Initialize the subsystems and build a session on top of them.
pub async fn start_session(
    loader: &dyn SubsystemLoader,
    config: AnchorSyncConfig,
) -> Result<AnchorSession, InitError> {
    let collaborators = match initialize(loader, config.init_timeout()).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("anchor subsystem disabled: {e}");
            return Err(e);
        }
    };
    let session = AnchorSession::builder()
        .collaborators(collaborators)
        .config(config)
        .build()?;
    Ok(session)
}
