//! Block repository for `SQLite` persistence.
//!
//! The conditional updates in this module (`claim`, `update_status`,
//! `mark_session_standby`) are single statements whose `WHERE` clause
//! carries the expected state. They are the only admission control between
//! concurrent workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::block::{
    Block, BlockCode, BlockFailure, BlockParams, BlockResult, BlockStatus, BlockType,
};
use crate::{AppError, Result};

use super::db::Database;

const SELECT_COLUMNS: &str = "SELECT token, session_token, block_type, status, code, params, \
     block_id, name, require, delay, blocker, replayable, replay_count, lock_token, next_run, \
     result, error, metadata, created_at FROM async_block";

/// Repository wrapper around `SQLite` for block rows.
#[derive(Clone)]
pub struct BlockRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct BlockRow {
    token: String,
    session_token: String,
    block_type: String,
    status: String,
    code: String,
    params: String,
    block_id: Option<String>,
    name: Option<String>,
    require: String,
    delay: i64,
    blocker: i64,
    replayable: i64,
    replay_count: i64,
    lock_token: Option<String>,
    next_run: i64,
    result: Option<String>,
    error: Option<String>,
    metadata: String,
    created_at: String,
}

impl BlockRow {
    fn into_block(self) -> Result<Block> {
        let status = parse_status(&self.status)?;
        let block_type = parse_block_type(&self.block_type)?;
        let code: BlockCode = serde_json::from_str(&self.code)
            .map_err(|e| AppError::Db(format!("invalid code: {e}")))?;
        if code.block_type() != block_type {
            return Err(AppError::Db(format!(
                "block {} has type {} but carries {:?} code",
                self.token,
                self.block_type,
                code.block_type()
            )));
        }
        let params: BlockParams = serde_json::from_str(&self.params)
            .map_err(|e| AppError::Db(format!("invalid params: {e}")))?;
        let require: Vec<String> = serde_json::from_str(&self.require)
            .map_err(|e| AppError::Db(format!("invalid require: {e}")))?;
        let result: Option<BlockResult> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid result: {e}")))?;
        let error: Option<BlockFailure> = self
            .error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid error: {e}")))?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| AppError::Db(format!("invalid metadata: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Block {
            token: self.token,
            session_token: self.session_token,
            status,
            code,
            params,
            id: self.block_id,
            name: self.name,
            require,
            delay: u64::try_from(self.delay).unwrap_or(0),
            blocker: self.blocker != 0,
            replayable: self.replayable != 0,
            replay_count: u32::try_from(self.replay_count).unwrap_or(0),
            lock_token: self.lock_token,
            next_run: self.next_run,
            result,
            error,
            metadata,
            created_at,
        })
    }
}

/// Columns that change after recording, encoded for binding.
struct MutableColumns {
    status: &'static str,
    params: String,
    require: String,
    result: Option<String>,
    error: Option<String>,
    metadata: String,
}

impl MutableColumns {
    fn of(block: &Block) -> Result<Self> {
        Ok(Self {
            status: status_str(block.status),
            params: serde_json::to_string(&block.params)?,
            require: serde_json::to_string(&block.require)?,
            result: block.result.as_ref().map(serde_json::to_string).transpose()?,
            error: block.error.as_ref().map(serde_json::to_string).transpose()?,
            metadata: serde_json::to_string(&block.metadata)?,
        })
    }
}

fn parse_status(s: &str) -> Result<BlockStatus> {
    match s {
        "prep" => Ok(BlockStatus::Prep),
        "standby" => Ok(BlockStatus::Standby),
        "running" => Ok(BlockStatus::Running),
        "success" => Ok(BlockStatus::Success),
        "error" => Ok(BlockStatus::Error),
        "blocker" => Ok(BlockStatus::Blocker),
        other => Err(AppError::Db(format!("invalid block status: {other}"))),
    }
}

/// Storage string for a block status.
#[must_use]
pub fn status_str(status: BlockStatus) -> &'static str {
    match status {
        BlockStatus::Prep => "prep",
        BlockStatus::Standby => "standby",
        BlockStatus::Running => "running",
        BlockStatus::Success => "success",
        BlockStatus::Error => "error",
        BlockStatus::Blocker => "blocker",
    }
}

fn parse_block_type(s: &str) -> Result<BlockType> {
    match s {
        "closure" => Ok(BlockType::Closure),
        "invokable" => Ok(BlockType::Invokable),
        "class_name" => Ok(BlockType::ClassName),
        other => Err(AppError::Db(format!("invalid block type: {other}"))),
    }
}

fn block_type_str(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Closure => "closure",
        BlockType::Invokable => "invokable",
        BlockType::ClassName => "class_name",
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl BlockRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a single block row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (e.g. duplicate token).
    pub async fn insert(&self, block: &Block) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        insert_row(&mut conn, block).await
    }

    /// Insert every block of a session in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any insert fails; nothing is persisted then.
    pub async fn insert_session(&self, blocks: &[Block]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for block in blocks {
            insert_row(&mut tx, block).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Retrieve every block of a session in persistence order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn get_by_session(&self, session_token: &str) -> Result<Vec<Block>> {
        let rows: Vec<BlockRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE session_token = ?1 ORDER BY seq ASC"))
                .bind(session_token)
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(BlockRow::into_block).collect()
    }

    /// Retrieve a block by token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no row matches.
    pub async fn get_by_token(&self, token: &str) -> Result<Block> {
        let row: Option<BlockRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE token = ?1"))
            .bind(token)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(BlockRow::into_block)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("block {token}")))
    }

    /// Plain update of every mutable column, keyed by token only.
    ///
    /// Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update(&self, block: &Block) -> Result<bool> {
        let cols = MutableColumns::of(block)?;
        let result = sqlx::query(
            "UPDATE async_block SET status = ?1, params = ?2, block_id = ?3, name = ?4,
             require = ?5, delay = ?6, blocker = ?7, replayable = ?8, replay_count = ?9,
             lock_token = ?10, next_run = ?11, result = ?12, error = ?13, metadata = ?14
             WHERE token = ?15",
        )
        .bind(cols.status)
        .bind(&cols.params)
        .bind(&block.id)
        .bind(&block.name)
        .bind(&cols.require)
        .bind(to_i64(block.delay))
        .bind(i64::from(block.blocker))
        .bind(i64::from(block.replayable))
        .bind(i64::from(block.replay_count))
        .bind(&block.lock_token)
        .bind(block.next_run)
        .bind(&cols.result)
        .bind(&cols.error)
        .bind(&cols.metadata)
        .bind(&block.token)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fenced update: persist the block's execution state only if the stored
    /// status still equals `expected` (and, when given, the stored lock token
    /// equals `lock_token`).
    ///
    /// Returns `false` when the row was concurrently modified elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_status(
        &self,
        block: &Block,
        expected: BlockStatus,
        lock_token: Option<&str>,
    ) -> Result<bool> {
        let cols = MutableColumns::of(block)?;
        let result = sqlx::query(
            "UPDATE async_block SET status = ?1, replay_count = ?2, lock_token = ?3,
             next_run = ?4, result = ?5, error = ?6, metadata = ?7
             WHERE token = ?8 AND status = ?9 AND (?10 IS NULL OR lock_token = ?10)",
        )
        .bind(cols.status)
        .bind(i64::from(block.replay_count))
        .bind(&block.lock_token)
        .bind(block.next_run)
        .bind(&cols.result)
        .bind(&cols.error)
        .bind(&cols.metadata)
        .bind(&block.token)
        .bind(status_str(expected))
        .bind(lock_token)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim a `standby` block for execution under `lock_token`.
    ///
    /// Returns `false` if the block was no longer `standby`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(&self, token: &str, lock_token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE async_block SET status = 'running', lock_token = ?1
             WHERE token = ?2 AND status = 'standby'",
        )
        .bind(lock_token)
        .bind(token)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a freshly persisted session from `prep` to `standby`, but only if
    /// every block of the session is still `prep`.
    ///
    /// Returns the number of rows moved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_session_standby(&self, session_token: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE async_block SET status = 'standby'
             WHERE session_token = ?1 AND status = 'prep'
             AND NOT EXISTS (
                 SELECT 1 FROM async_block
                 WHERE session_token = ?1 AND status != 'prep'
             )",
        )
        .bind(session_token)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Make every block of the session that is waiting on a replay eligible
    /// at `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn reset_session_next_run(&self, session_token: &str, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE async_block SET next_run = ?1
             WHERE session_token = ?2 AND replay_count > 0 AND next_run > 0
             AND status IN ('standby', 'error', 'blocker')",
        )
        .bind(now)
        .bind(session_token)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Return failed replayable blocks whose `next_run` is due to `standby`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn requeue_due_replays(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE async_block SET status = 'standby', lock_token = NULL
             WHERE status IN ('error', 'blocker') AND replayable = 1
             AND next_run > 0 AND next_run <= ?1",
        )
        .bind(now)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Sessions that have a due `standby` block and nothing `running` or `prep`,
    /// oldest first.
    ///
    /// A `standby` block behind a `blocker` does not count: the session pass
    /// halts at the blocker before reaching it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_ready_sessions(&self, now: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT b.session_token FROM async_block b
             WHERE b.status = 'standby' AND b.next_run <= ?1
             AND NOT EXISTS (
                 SELECT 1 FROM async_block r
                 WHERE r.session_token = b.session_token AND r.status IN ('running', 'prep')
             )
             AND NOT EXISTS (
                 SELECT 1 FROM async_block k
                 WHERE k.session_token = b.session_token AND k.status = 'blocker'
                 AND k.seq < b.seq
             )
             GROUP BY b.session_token
             ORDER BY MIN(b.seq) ASC",
        )
        .bind(now)
        .fetch_all(self.db.as_ref())
        .await?;

        Ok(rows.into_iter().map(|(token,)| token).collect())
    }

    /// Delete finished sessions recorded before `before`.
    ///
    /// A session is finished when no block is `prep`, `running`, or waiting
    /// on a replay, and every `standby` block sits behind a blocker that will
    /// not be replayed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM async_block WHERE session_token IN (
                 SELECT session_token FROM async_block
                 GROUP BY session_token
                 HAVING MAX(created_at) < ?1
             )
             AND session_token NOT IN (
                 SELECT p.session_token FROM async_block p
                 WHERE p.status IN ('prep', 'running')
                 OR (p.status IN ('error', 'blocker') AND p.next_run > 0)
                 OR (p.status = 'standby' AND NOT EXISTS (
                     SELECT 1 FROM async_block k
                     WHERE k.session_token = p.session_token AND k.status = 'blocker'
                     AND k.next_run = 0 AND k.seq < p.seq
                 ))
             )",
        )
        .bind(before.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete every block row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM async_block")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_row(conn: &mut sqlx::SqliteConnection, block: &Block) -> Result<()> {
    let cols = MutableColumns::of(block)?;
    let code = serde_json::to_string(&block.code)?;

    sqlx::query(
        "INSERT INTO async_block (token, session_token, block_type, status, code, params,
         block_id, name, require, delay, blocker, replayable, replay_count, lock_token,
         next_run, result, error, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
    )
    .bind(&block.token)
    .bind(&block.session_token)
    .bind(block_type_str(block.block_type()))
    .bind(cols.status)
    .bind(&code)
    .bind(&cols.params)
    .bind(&block.id)
    .bind(&block.name)
    .bind(&cols.require)
    .bind(to_i64(block.delay))
    .bind(i64::from(block.blocker))
    .bind(i64::from(block.replayable))
    .bind(i64::from(block.replay_count))
    .bind(&block.lock_token)
    .bind(block.next_run)
    .bind(&cols.result)
    .bind(&cols.error)
    .bind(&cols.metadata)
    .bind(block.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
