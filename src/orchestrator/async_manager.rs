//! Recording phase: turn handler references plus arguments into blocks,
//! collect them into a session, and hand the session off for execution.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::models::block::{Block, BlockCode, BlockParams, BlockStatus};
use crate::models::session::SessionView;
use crate::persistence::block_repo::BlockRepo;
use crate::persistence::config_repo::{
    ConfigRepo, KEY_LOOPBACK_ADDRESS, KEY_LOOPBACK_PING, KEY_LOOPBACK_TEST,
};
use crate::persistence::db::Database;
use crate::{AppError, Result};

use super::block_interface::BlockInterface;
use super::codec;
use super::fork_manager::ForkManager;
use super::registry::BlockRegistry;
use super::token;

/// When a closed session should be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTime {
    /// Launch through the fork manager as soon as the session is persisted.
    Now,
    /// Leave the session `standby` for the next sweep.
    Later,
}

impl ExecutionTime {
    fn as_str(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Later => "later",
        }
    }
}

/// Blocks recorded for one session, not yet persisted.
///
/// Each builder is independent; nothing is shared between builders.
pub struct SessionBuilder {
    registry: Arc<BlockRegistry>,
    token: Option<String>,
    blocks: Vec<Block>,
}

impl SessionBuilder {
    fn new(registry: Arc<BlockRegistry>) -> Self {
        Self {
            registry,
            token: None,
            blocks: Vec::new(),
        }
    }

    /// Record a block running `code` with `args`.
    ///
    /// The session token is allocated by the first call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownHandler` if `code` does not resolve in the
    /// registry.
    pub fn record(&mut self, code: BlockCode, args: Vec<Value>) -> Result<BlockInterface<'_>> {
        let wrapper = self.registry.wants_wrapper(&code)?;
        let session_token = self.token.get_or_insert_with(token::block_token).clone();

        let params = BlockParams {
            allowed_types: allow_list(&code, &args, &[]),
            args,
            wrapper,
            dataset: Vec::new(),
        };

        let index = self.blocks.len();
        self.blocks
            .push(Block::new(token::block_token(), session_token, code, params));
        Ok(BlockInterface::new(&mut self.blocks[index]))
    }

    /// Session token, once a block has been recorded.
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Recorded blocks in recording order.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn allow_list(code: &BlockCode, args: &[Value], dataset: &[Vec<Value>]) -> Vec<String> {
    let mut types = codec::collect_types(args.iter().chain(dataset.iter().flatten()));
    types.extend(codec::code_types(code));
    types.into_iter().collect()
}

/// Entry point of the recording phase.
pub struct AsyncManager {
    blocks: BlockRepo,
    config: ConfigRepo,
    registry: Arc<BlockRegistry>,
    fork: Arc<ForkManager>,
}

impl AsyncManager {
    /// Create a manager persisting into `db` and launching through `fork`.
    #[must_use]
    pub fn new(db: Arc<Database>, registry: Arc<BlockRegistry>, fork: Arc<ForkManager>) -> Self {
        Self {
            blocks: BlockRepo::new(Arc::clone(&db)),
            config: ConfigRepo::new(db),
            registry,
            fork,
        }
    }

    /// Fork manager sessions are handed to.
    #[must_use]
    pub fn fork_manager(&self) -> &Arc<ForkManager> {
        &self.fork
    }

    /// Start recording a new session.
    #[must_use]
    pub fn open_session(&self) -> SessionBuilder {
        SessionBuilder::new(Arc::clone(&self.registry))
    }

    /// Persist the recorded session, mark it ready, and optionally launch it.
    ///
    /// Returns the session token, or an empty string when nothing was
    /// recorded. A failed launch is logged and leaves the session `standby`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if persisting fails.
    pub async fn close_session(&self, session: SessionBuilder, when: ExecutionTime) -> Result<String> {
        let Some(session_token) = session.token.clone() else {
            return Ok(String::new());
        };
        let span = info_span!("close_session", session = %session_token, when = when.as_str());
        self.persist_and_launch(session, session_token, when)
            .instrument(span)
            .await
    }

    async fn persist_and_launch(
        &self,
        session: SessionBuilder,
        session_token: String,
        when: ExecutionTime,
    ) -> Result<String> {
        let mut blocks = session.blocks;
        for block in &mut blocks {
            block.params.allowed_types =
                allow_list(&block.code, &block.params.args, &block.params.dataset);
            block
                .metadata
                .insert("session".into(), json!(session_token));
            block
                .metadata
                .insert("execution_time".into(), json!(when.as_str()));
            let delay = i64::try_from(block.delay).unwrap_or(i64::MAX);
            block.next_run = block.created_at.timestamp().saturating_add(delay);
            block.status = BlockStatus::Prep;
        }

        self.blocks.insert_session(&blocks).await?;
        let ready = self.blocks.mark_session_standby(&session_token).await?;
        if ready != u64::try_from(blocks.len()).unwrap_or(u64::MAX) {
            warn!(
                ready,
                recorded = blocks.len(),
                "session modified while closing; not all blocks marked standby"
            );
        }
        info!(blocks = blocks.len(), "session persisted");

        if when == ExecutionTime::Now {
            let mut metadata = Map::new();
            metadata.insert("trigger".into(), json!("close_session"));
            match self.fork.fork_session(&session_token, metadata).await {
                Ok(outcome) => info!(?outcome, "session launch requested"),
                Err(err) => warn!(%err, "session launch failed; left for sweep"),
            }
        }

        Ok(session_token)
    }

    /// Stored state of a closed session, in persistence order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no block carries `session_token`, and
    /// `AppError::Db` if the query fails.
    pub async fn session(&self, session_token: &str) -> Result<SessionView> {
        let blocks = self.blocks.get_by_session(session_token).await?;
        if blocks.is_empty() {
            return Err(AppError::NotFound(format!("session {session_token}")));
        }
        Ok(SessionView::new(session_token, blocks))
    }

    /// Stored state of one block: latest status, result, and error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown token.
    pub async fn block(&self, block_token: &str) -> Result<Block> {
        self.blocks.get_by_token(block_token).await
    }

    /// Delete every block row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn drop_all_blocks(&self) -> Result<u64> {
        let deleted = self.blocks.delete_all().await?;
        info!(deleted, "all blocks dropped");
        Ok(deleted)
    }

    /// Forget the discovered loopback address and discovery tokens.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a delete fails.
    pub async fn reset_config(&self) -> Result<()> {
        for key in [KEY_LOOPBACK_ADDRESS, KEY_LOOPBACK_PING, KEY_LOOPBACK_TEST] {
            self.config.delete(key).await?;
        }
        info!("loopback configuration reset");
        Ok(())
    }
}
