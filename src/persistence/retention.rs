//! Retention purge for finished sessions.

use chrono::Utc;
use tracing::info;

use super::block_repo::BlockRepo;
use crate::Result;

/// Delete sessions that finished and were recorded more than
/// `retention_days` ago. Sessions with pending or replay-scheduled blocks
/// are kept regardless of age.
///
/// Returns the number of block rows deleted.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge_expired(repo: &BlockRepo, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let deleted = repo.purge_finished(cutoff).await?;

    info!(retention_days, deleted, "retention purge completed");
    Ok(deleted)
}
