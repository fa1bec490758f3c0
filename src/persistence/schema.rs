//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup, including from each worker process.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS async_block (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    token           TEXT NOT NULL UNIQUE,
    session_token   TEXT NOT NULL,
    block_type      TEXT NOT NULL CHECK(block_type IN ('closure','invokable','class_name')),
    status          TEXT NOT NULL CHECK(status IN ('prep','standby','running','success','error','blocker')),
    code            TEXT NOT NULL,
    params          TEXT NOT NULL,
    block_id        TEXT,
    name            TEXT,
    require         TEXT NOT NULL DEFAULT '[]',
    delay           INTEGER NOT NULL DEFAULT 0,
    blocker         INTEGER NOT NULL DEFAULT 0,
    replayable      INTEGER NOT NULL DEFAULT 0,
    replay_count    INTEGER NOT NULL DEFAULT 0,
    lock_token      TEXT,
    next_run        INTEGER NOT NULL DEFAULT 0,
    result          TEXT,
    error           TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_config (
    namespace       TEXT NOT NULL,
    config_key      TEXT NOT NULL,
    config_value    TEXT NOT NULL,
    PRIMARY KEY (namespace, config_key)
);

CREATE INDEX IF NOT EXISTS idx_block_session ON async_block(session_token);
CREATE INDEX IF NOT EXISTS idx_block_status_next_run ON async_block(status, next_run);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
