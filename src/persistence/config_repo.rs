//! Namespaced string key/value store backed by `SQLite`.
//!
//! Holds the discovered loopback address and the tokens exchanged while
//! testing a loopback candidate.

use std::sync::Arc;

use crate::Result;

use super::db::Database;

/// Namespace used by the scheduler.
pub const NAMESPACE: &str = "async_process";

/// Persisted loopback base URL.
pub const KEY_LOOPBACK_ADDRESS: &str = "loopback_address";

/// Token echoed back by the endpoint's ping response.
pub const KEY_LOOPBACK_PING: &str = "loopback_ping";

/// Token written by the asynchronous discovery probe.
pub const KEY_LOOPBACK_TEST: &str = "loopback_test";

/// Repository for configuration values under one namespace.
#[derive(Clone)]
pub struct ConfigRepo {
    db: Arc<Database>,
    namespace: String,
}

impl ConfigRepo {
    /// Create a repository scoped to [`NAMESPACE`].
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_namespace(db, NAMESPACE)
    }

    /// Create a repository scoped to an arbitrary namespace.
    #[must_use]
    pub fn with_namespace(db: Arc<Database>, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT config_value FROM app_config WHERE namespace = ?1 AND config_key = ?2",
        )
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(self.db.as_ref())
        .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Insert or overwrite a value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_config (namespace, config_key, config_value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, config_key) DO UPDATE SET config_value = excluded.config_value",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(value)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Remove a value; missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_config WHERE namespace = ?1 AND config_key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .execute(self.db.as_ref())
            .await?;

        Ok(())
    }
}
