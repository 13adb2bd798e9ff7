//! `anchorsync-service` entry point.
//!
//! Runs an anchor session against the simulated platform: localizes, restores
//! the anchors stored near the origin, then plays a short script of host
//! actions (create, publish, query, delete) until it finishes or Ctrl+C.
//!
//! Configuration comes from `ANCHORSYNC_CONFIG` or
//! `~/.config/anchorsync/anchorsync.toml`; log filtering from `RUST_LOG`.

use std::time::Duration;

use anchorsync_core::{AnchorNotification, AnchorSyncConfig, HostInput, Pose, Vec3};
use anchorsync_service::runtime::{ControlHandle, ControlLoop};
use anchorsync_service::sim::SimulatedPlatform;
use anchorsync_service::{CompletionBus, start_session};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Pause between scripted actions.
const STEP_DELAY: Duration = Duration::from_millis(400);

/// Anchors already in the store when the demo starts.
const SEEDED_ANCHORS: [Vec3; 2] = [Vec3::new(1.0, 0.0, 2.0), Vec3::new(-2.0, 0.0, 3.5)];

async fn run_script(handle: ControlHandle, radius_m: f32, cancel: CancellationToken) {
    let steps = [
        HostInput::CreateAnchor {
            pose: Pose::at(Vec3::new(0.5, 1.2, 1.0)),
        },
        HostInput::CreateAnchor {
            pose: Pose::at(Vec3::new(-0.5, 1.2, 1.5)),
        },
        HostInput::PublishAnchors,
        HostInput::QueryAnchors {
            center: Vec3::ZERO,
            radius_m,
        },
        HostInput::DeleteMostRecent,
    ];

    for step in steps {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(STEP_DELAY) => {}
        }
        tracing::info!(?step, "host input");
        handle.input(step);
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(STEP_DELAY) => handle.shutdown(),
    }
}

async fn log_notifications(mut rx: broadcast::Receiver<AnchorNotification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(json) => tracing::info!(notification = %json, "anchor"),
                Err(e) => tracing::warn!("failed to encode notification: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "notification log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("anchorsync-service v{} starting", anchorsync_core::VERSION);

    let config = AnchorSyncConfig::load()?;
    let radius_m = config.query_radius_m;

    let (bus, events) = CompletionBus::new();
    let platform = SimulatedPlatform::new(&bus);
    for position in SEEDED_ANCHORS {
        let id = platform.storage.seed(Pose::at(position));
        tracing::info!(map_position_id = %id, "seeded stored anchor");
    }

    let session = start_session(&platform, config).await?;
    let (control, handle) = ControlLoop::new(session, bus, events);
    let notifications = tokio::spawn(log_notifications(control.subscribe()));

    let cancel = CancellationToken::new();
    let signal_handle = handle.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("signal received, shutting down");
        signal_cancel.cancel();
        signal_handle.shutdown();
    });

    let script = tokio::spawn(run_script(handle, radius_m, cancel.clone()));
    let snapshot = control.run().await;
    cancel.cancel();
    let _ = script.await;
    let _ = notifications.await;

    tracing::info!(
        snapshot = %serde_json::to_string(&snapshot)?,
        tracked = platform.tracking.live_count(),
        stored = platform.storage.stored_ids().len(),
        "anchorsync-service exiting cleanly"
    );
    Ok(())
}
