//! Block model: one recorded unit of deferred work and its execution state.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Execution state of a block.
///
/// `Prep → Standby → Running → {Success | Error | Blocker}`; failed
/// replayable blocks loop back to `Standby` once their `next_run` is due.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Recorded in memory, not yet persisted as ready.
    Prep,
    /// Persisted and waiting for a worker.
    Standby,
    /// Claimed by a worker holding the lock token.
    Running,
    /// Last attempt returned normally.
    Success,
    /// Last attempt failed.
    Error,
    /// Last attempt failed and the block halts its session.
    Blocker,
}

impl BlockStatus {
    /// Whether no further work is scheduled for this status on its own.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Blocker)
    }
}

/// Storage tag for the [`BlockCode`] variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Named closure handler.
    Closure,
    /// Serialized invokable object.
    Invokable,
    /// Class instantiated fresh and run through its entry point.
    ClassName,
}

/// Executable payload of a block.
///
/// Each variant carries exactly what its execution strategy needs, so an
/// invokable without state or a closure without a handler name cannot be
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockCode {
    /// Closure registered under `handler`.
    Closure {
        /// Registry name of the closure.
        handler: String,
    },
    /// Invokable object: registered type name plus its serialized state.
    Invokable {
        /// Registry name of the invokable type.
        type_name: String,
        /// Serialized object state.
        state: Value,
    },
    /// Class name with a fixed entry point.
    ClassName {
        /// Registry name of the class.
        class: String,
    },
}

impl BlockCode {
    /// Closure code referencing a registered handler.
    #[must_use]
    pub fn closure(handler: impl Into<String>) -> Self {
        Self::Closure {
            handler: handler.into(),
        }
    }

    /// Class-name code referencing a registered entry point.
    #[must_use]
    pub fn class(class: impl Into<String>) -> Self {
        Self::ClassName {
            class: class.into(),
        }
    }

    /// Storage tag of this variant.
    #[must_use]
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Closure { .. } => BlockType::Closure,
            Self::Invokable { .. } => BlockType::Invokable,
            Self::ClassName { .. } => BlockType::ClassName,
        }
    }

    /// Registry name the variant resolves through.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        match self {
            Self::Closure { handler } => handler,
            Self::Invokable { type_name, .. } => type_name,
            Self::ClassName { class } => class,
        }
    }
}

/// Serialized arguments of a block plus their decoding capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockParams {
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Concrete type names permitted while decoding `args` and `code`.
    #[serde(default)]
    pub allowed_types: Vec<String>,
    /// Whether the first argument slot is reserved for the wrapper.
    #[serde(default)]
    pub wrapper: bool,
    /// Extra argument sets; the block is invoked once per row.
    #[serde(default)]
    pub dataset: Vec<Vec<Value>>,
}

/// Summary of a failed attempt, as stored in the `error` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockFailure {
    /// Failure classification (error type, `panic`, ...).
    pub class: String,
    /// Human-readable message.
    pub message: String,
    /// Numeric code supplied by the handler, `0` when none.
    #[serde(default)]
    pub code: i64,
    /// Optional trace or context lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl BlockFailure {
    /// Construct a failure with `code` 0 and no trace.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            code: 0,
            trace: None,
        }
    }

    /// Attach a numeric code.
    #[must_use]
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    /// Attach trace text.
    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl Display for BlockFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for BlockFailure {}

/// Outcome of the most recent attempt, as stored in the `result` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockResult {
    /// Attempt start.
    pub start: DateTime<Utc>,
    /// Attempt end.
    pub end: DateTime<Utc>,
    /// How the attempt was launched (`worker`, `loopback`, `inline`, ...).
    pub execution: String,
    /// Structured value returned by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// One recorded, independently schedulable unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    /// Unique block token; immutable.
    pub token: String,
    /// Token of the session the block was recorded in; immutable.
    pub session_token: String,
    /// Current execution state.
    pub status: BlockStatus,
    /// Executable payload.
    pub code: BlockCode,
    /// Arguments and decoding capabilities.
    pub params: BlockParams,
    /// Caller-assigned id used for dependency lookups.
    pub id: Option<String>,
    /// Descriptive name.
    pub name: Option<String>,
    /// Ids that must be `Success` before this block may run.
    pub require: Vec<String>,
    /// Seconds after session creation before the first attempt.
    pub delay: u64,
    /// A failure halts the rest of the session.
    pub blocker: bool,
    /// A failure schedules a replay instead of ending the block.
    pub replayable: bool,
    /// Number of replays after failure.
    pub replay_count: u32,
    /// Fencing token of the worker owning a `Running` block.
    pub lock_token: Option<String>,
    /// Earliest unix timestamp for the next attempt; `0` means never.
    pub next_run: i64,
    /// Outcome of the most recent attempt.
    pub result: Option<BlockResult>,
    /// Failure of the most recent attempt.
    pub error: Option<BlockFailure>,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Recording timestamp.
    pub created_at: DateTime<Utc>,
}

impl Block {
    /// Construct a `Prep` block with default policy.
    #[must_use]
    pub fn new(token: String, session_token: String, code: BlockCode, params: BlockParams) -> Self {
        Self {
            token,
            session_token,
            status: BlockStatus::Prep,
            code,
            params,
            id: None,
            name: None,
            require: Vec::new(),
            delay: 0,
            blocker: false,
            replayable: false,
            replay_count: 0,
            lock_token: None,
            next_run: 0,
            result: None,
            error: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Storage tag derived from the code variant.
    #[must_use]
    pub fn block_type(&self) -> BlockType {
        self.code.block_type()
    }

    /// Whether the block may be attempted at unix time `now`.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.status == BlockStatus::Standby && self.next_run <= now
    }

    /// Whether the block failed and no replay is scheduled.
    #[must_use]
    pub fn is_final_failure(&self) -> bool {
        matches!(self.status, BlockStatus::Error | BlockStatus::Blocker) && self.next_run == 0
    }

    /// Requeue after a failure: bump the replay counter, return to
    /// `Standby` and push `next_run` out by `backoff_seconds`.
    pub fn replay(&mut self, now: i64, backoff_seconds: u64) {
        self.replay_count += 1;
        self.status = BlockStatus::Standby;
        self.next_run = now.saturating_add(i64::try_from(backoff_seconds).unwrap_or(i64::MAX));
    }
}
