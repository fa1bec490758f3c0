//! Error types shared across the scheduler.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all scheduling failure modes.
///
/// Failures raised by user code inside a block never surface as an
/// `AppError`; they are captured on the block row instead.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Block is not in `standby` when a claim is attempted.
    AlreadyRunning(String),
    /// Conditional claim matched no row; another worker owns the block.
    BlockLocked(String),
    /// Session is not ready for execution (someone else is processing it).
    AsyncProcess(String),
    /// Payload could not be encoded or decoded.
    Serialization(String),
    /// Payload referenced a type outside the block's allow-list.
    Disallowed(String),
    /// No handler is registered under the requested name.
    UnknownHandler(String),
    /// Worker process could not be spawned.
    Fork(String),
    /// Loopback HTTP call failed.
    Loopback(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::BlockLocked(msg) => write!(f, "block is locked: {msg}"),
            Self::AsyncProcess(msg) => write!(f, "async process: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Disallowed(msg) => write!(f, "disallowed type: {msg}"),
            Self::UnknownHandler(msg) => write!(f, "unknown handler: {msg}"),
            Self::Fork(msg) => write!(f, "fork: {msg}"),
            Self::Loopback(msg) => write!(f, "loopback: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
