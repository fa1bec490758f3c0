//! Periodic sweep: requeue due replays, launch ready sessions, purge old ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SweepConfig;
use crate::persistence::block_repo::BlockRepo;
use crate::persistence::retention;
use crate::Result;

use super::fork_manager::{ForkManager, LaunchOutcome};

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Failed blocks moved back to `standby`.
    pub requeued: u64,
    /// Sessions handed to a worker or the loopback endpoint.
    pub launched: usize,
    /// Sessions nothing could launch.
    pub deferred: usize,
    /// Block rows deleted by retention.
    pub purged: u64,
}

/// Run one sweep.
///
/// A launch failure for one session is logged and does not stop the sweep.
///
/// # Errors
///
/// Returns `AppError::Db` if a query fails.
pub async fn sweep_once(
    fork: &ForkManager,
    repo: &BlockRepo,
    config: &SweepConfig,
) -> Result<SweepReport> {
    let now = Utc::now().timestamp();
    let mut report = SweepReport {
        requeued: repo.requeue_due_replays(now).await?,
        ..SweepReport::default()
    };

    for session in repo.list_ready_sessions(now).await? {
        let mut metadata = Map::new();
        metadata.insert("trigger".into(), json!("sweep"));
        match fork.fork_session(&session, metadata).await {
            Ok(LaunchOutcome::Deferred) => report.deferred += 1,
            Ok(_) => report.launched += 1,
            Err(err) => {
                warn!(session = %session, %err, "sweep launch failed");
                report.deferred += 1;
            }
        }
    }

    report.purged = retention::purge_expired(repo, config.retention_days).await?;

    info!(
        requeued = report.requeued,
        launched = report.launched,
        deferred = report.deferred,
        purged = report.purged,
        "sweep completed"
    );
    Ok(report)
}

/// Spawn the sweep background task, ticking every `interval_seconds`.
#[must_use]
pub fn spawn_sweeper(
    fork: Arc<ForkManager>,
    repo: BlockRepo,
    config: SweepConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.interval_seconds));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = sweep_once(&fork, &repo, &config).await {
                        error!(?err, "sweep failed");
                    }
                }
            }
        }
    })
}
