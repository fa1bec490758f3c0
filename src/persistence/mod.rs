//! Persistence layer modules.

pub mod block_repo;
pub mod config_repo;
pub mod db;
pub mod retention;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
