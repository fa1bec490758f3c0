//! Session view: all blocks sharing a session token, in persistence order.

use serde::{Deserialize, Serialize};

use super::block::{Block, BlockStatus};

/// Aggregated status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStatus {
    /// At least one block is still being recorded.
    Prep,
    /// Nothing is running and at least one block waits for a worker.
    Standby,
    /// A worker is mid-execution on this session.
    Running,
    /// Every block succeeded.
    Success,
    /// Every block is terminal and at least one failed.
    Failed,
    /// The session has no blocks.
    Empty,
}

/// Outcome of checking a block's `require` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Every required block succeeded.
    Met,
    /// A required block may still succeed later.
    Pending,
    /// The named id can never succeed.
    Unsatisfiable(String),
}

/// Read-only view over the blocks of one session.
#[derive(Debug, Clone)]
pub struct SessionView {
    token: String,
    blocks: Vec<Block>,
}

impl SessionView {
    /// Build a view from blocks already sorted in persistence order.
    #[must_use]
    pub fn new(token: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            token: token.into(),
            blocks,
        }
    }

    /// Session token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Member blocks in persistence order.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Whether the session has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Look up a block by its caller-assigned id.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id.as_deref() == Some(id))
    }

    /// Look up a block by token.
    #[must_use]
    pub fn by_token(&self, token: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.token == token)
    }

    /// Replace the stored copy of `block` after it has been persisted.
    pub fn refresh(&mut self, block: &Block) {
        if let Some(slot) = self.blocks.iter_mut().find(|b| b.token == block.token) {
            slot.clone_from(block);
        }
    }

    /// Whether every id in `require` names a block that reached `Success`.
    ///
    /// A missing id counts as unmet.
    #[must_use]
    pub fn requirements_met(&self, require: &[String]) -> bool {
        self.requirement_state(require) == Requirement::Met
    }

    /// Classify `require` against the current member states.
    ///
    /// An id is unsatisfiable when no member carries it, when its block
    /// failed with no replay scheduled, or when its block sits behind a
    /// blocker that will not be replayed.
    #[must_use]
    pub fn requirement_state(&self, require: &[String]) -> Requirement {
        let mut pending = false;
        for id in require {
            let Some(required) = self.by_id(id) else {
                return Requirement::Unsatisfiable(id.clone());
            };
            if required.status == BlockStatus::Success {
                continue;
            }
            if required.is_final_failure() || self.halted_before(&required.token) {
                return Requirement::Unsatisfiable(id.clone());
            }
            pending = true;
        }
        if pending {
            Requirement::Pending
        } else {
            Requirement::Met
        }
    }

    /// Whether a blocker with no replay scheduled precedes block `token`.
    #[must_use]
    pub fn halted_before(&self, token: &str) -> bool {
        self.blocks
            .iter()
            .take_while(|b| b.token != token)
            .any(|b| b.status == BlockStatus::Blocker && b.next_run == 0)
    }

    /// Aggregate status. `Standby` is the only state a session can be run from.
    #[must_use]
    pub fn global_status(&self) -> GlobalStatus {
        if self.blocks.is_empty() {
            return GlobalStatus::Empty;
        }
        let any = |status: BlockStatus| self.blocks.iter().any(|b| b.status == status);

        if any(BlockStatus::Running) {
            GlobalStatus::Running
        } else if any(BlockStatus::Prep) {
            GlobalStatus::Prep
        } else if any(BlockStatus::Standby) {
            GlobalStatus::Standby
        } else if self.blocks.iter().all(|b| b.status == BlockStatus::Success) {
            GlobalStatus::Success
        } else {
            GlobalStatus::Failed
        }
    }
}
