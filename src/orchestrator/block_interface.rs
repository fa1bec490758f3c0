//! Fluent builder over a block being recorded.

use serde_json::Value;
use tracing::debug;

use crate::models::block::{Block, BlockFailure, BlockResult, BlockStatus};

/// Chainable view over one recorded block.
///
/// Builder methods only take effect while the block is still `Prep`;
/// afterwards they are ignored. The read accessors reflect the recording
/// copy; once the session is closed, load the stored state through
/// [`AsyncManager::session`](super::async_manager::AsyncManager::session)
/// or [`AsyncManager::block`](super::async_manager::AsyncManager::block).
pub struct BlockInterface<'a> {
    block: &'a mut Block,
}

impl<'a> BlockInterface<'a> {
    pub(crate) fn new(block: &'a mut Block) -> Self {
        Self { block }
    }

    fn editable(&self, field: &str) -> bool {
        let editable = self.block.status == BlockStatus::Prep;
        if !editable {
            debug!(block = %self.block.token, field, "ignoring edit on persisted block");
        }
        editable
    }

    /// Set the id other blocks of the session can `require`.
    pub fn id(&mut self, id: impl Into<String>) -> &mut Self {
        if self.editable("id") {
            self.block.id = Some(id.into());
        }
        self
    }

    /// Set a descriptive name.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        if self.editable("name") {
            self.block.name = Some(name.into());
        }
        self
    }

    /// Add a dependency on the block with id `id`.
    pub fn require(&mut self, id: impl Into<String>) -> &mut Self {
        if self.editable("require") {
            let id = id.into();
            if !self.block.require.contains(&id) {
                self.block.require.push(id);
            }
        }
        self
    }

    /// Minimum seconds after session creation before the first attempt.
    pub fn delay(&mut self, seconds: u64) -> &mut Self {
        if self.editable("delay") {
            self.block.delay = seconds;
        }
        self
    }

    /// A failure of this block halts the rest of the session.
    pub fn blocker(&mut self, blocker: bool) -> &mut Self {
        if self.editable("blocker") {
            self.block.blocker = blocker;
        }
        self
    }

    /// A failure of this block schedules a replay.
    pub fn replayable(&mut self, replayable: bool) -> &mut Self {
        if self.editable("replayable") {
            self.block.replayable = replayable;
        }
        self
    }

    /// Run the block once per row, each row appended to the base arguments.
    pub fn dataset(&mut self, rows: Vec<Vec<Value>>) -> &mut Self {
        if self.editable("dataset") {
            self.block.params.dataset.extend(rows);
        }
        self
    }

    /// Block token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.block.token
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> BlockStatus {
        self.block.status
    }

    /// Outcome of the most recent attempt.
    #[must_use]
    pub fn result(&self) -> Option<&BlockResult> {
        self.block.result.as_ref()
    }

    /// Failure of the most recent attempt.
    #[must_use]
    pub fn error(&self) -> Option<&BlockFailure> {
        self.block.error.as_ref()
    }
}
