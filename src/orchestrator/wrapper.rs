//! Observer hooks invoked around session and block lifecycle events.
//!
//! A wrapper is also handed to handlers that ask for it, so user code can
//! report progress through [`BlockWrapper::activity`].

use tracing::{debug, info, warn};

use crate::models::block::{Block, BlockStatus};
use crate::models::session::SessionView;

/// Lifecycle observer. Every hook has a no-op default.
pub trait BlockWrapper: Send + Sync {
    /// A worker starts processing `session`.
    fn session_start(&self, _session: &SessionView) {}

    /// `block` has been claimed and is about to execute.
    fn init(&self, _block: &Block) {}

    /// Progress reported by user code while a block executes.
    fn activity(&self, _message: &str) {}

    /// `block` finished an attempt; its persisted state is final for this pass.
    fn end(&self, _block: &Block) {}

    /// The worker is done with `session` for this pass.
    fn session_end(&self, _session: &SessionView) {}
}

/// Wrapper that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyWrapper;

impl BlockWrapper for DummyWrapper {}

/// Wrapper that reports every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingWrapper;

impl BlockWrapper for LoggingWrapper {
    fn session_start(&self, session: &SessionView) {
        info!(
            session = session.token(),
            blocks = session.blocks().len(),
            "session started"
        );
    }

    fn init(&self, block: &Block) {
        info!(
            session = %block.session_token,
            block = %block.token,
            id = block.id.as_deref().unwrap_or(""),
            name = block.name.as_deref().unwrap_or(""),
            replay_count = block.replay_count,
            "block started"
        );
    }

    fn activity(&self, message: &str) {
        debug!(message, "block activity");
    }

    fn end(&self, block: &Block) {
        if block.status == BlockStatus::Success {
            info!(block = %block.token, "block succeeded");
        } else {
            let error = block.error.as_ref().map(ToString::to_string);
            warn!(
                block = %block.token,
                status = ?block.status,
                error = error.as_deref().unwrap_or(""),
                next_run = block.next_run,
                "block failed"
            );
        }
    }

    fn session_end(&self, session: &SessionView) {
        info!(
            session = session.token(),
            status = ?session.global_status(),
            "session pass finished"
        );
    }
}
