#![forbid(unsafe_code)]

//! `blockdefer`: deferred execution of recorded code blocks.
//!
//! Callers record blocks (a handler reference plus arguments) into a
//! session, close it, and return immediately. The session is later run by a
//! worker process or through a loopback HTTP call, block by block, honouring
//! dependencies, delays, blockers, and replay after failure.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod server;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
