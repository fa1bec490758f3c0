//! Worker process spawner.
//!
//! Launches detached worker processes that each run one session pass. At
//! most `limit` workers are alive at a time; a launch waits for a free slot.
//! The slot is released by a reaper task once the child exits, so the
//! caller never waits for the worker itself.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Environment variable carrying launch metadata (JSON object) to a worker.
pub const METADATA_ENV: &str = "BLOCKDEFER_METADATA";

/// Program and argument template used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Worker executable.
    pub program: PathBuf,
    /// Argument template; `{token}` and `{config}` are substituted.
    pub args: Vec<String>,
    /// Configuration file forwarded through `{config}`.
    pub config_path: Option<PathBuf>,
}

impl WorkerCommand {
    /// Worker command described by `config`, falling back to the running
    /// executable. `None` when neither is available.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Option<Self> {
        let program = config
            .fork
            .worker_program
            .clone()
            .or_else(|| std::env::current_exe().ok())?;
        Some(Self {
            program,
            args: config.fork.worker_args.clone(),
            config_path: config.source_path.clone(),
        })
    }

    /// Concrete arguments for `session_token`.
    #[must_use]
    pub fn render(&self, session_token: &str) -> Vec<String> {
        let config = self
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|arg| arg.replace("{token}", session_token).replace("{config}", &config))
            .collect()
    }
}

/// Bounded pool of worker processes.
#[derive(Clone)]
pub struct WorkerPool {
    command: WorkerCommand,
    slots: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    /// Pool running `command` with at most `limit` live workers.
    #[must_use]
    pub fn new(command: WorkerCommand, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            command,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Pool described by `config`, if a worker executable is available.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Option<Self> {
        WorkerCommand::from_config(config).map(|cmd| Self::new(cmd, config.fork.limit))
    }

    /// Maximum number of concurrently live workers.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of workers currently alive.
    #[must_use]
    pub fn live(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Start a worker for `session_token`, waiting for a free slot first.
    ///
    /// Returns the child's process id when the platform reports one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Fork` if the pool is closed or the process cannot
    /// be started.
    pub async fn spawn(&self, session_token: &str, metadata: &Map<String, Value>) -> Result<Option<u32>> {
        let span = info_span!("spawn_worker", session = session_token);
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .instrument(span.clone())
            .await
            .map_err(|err| AppError::Fork(format!("worker pool closed: {err}")))?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.render(session_token))
            .env(METADATA_ENV, Value::Object(metadata.clone()).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Fork(format!(
                "failed to spawn worker {}: {err}",
                self.command.program.display()
            ))
        })?;

        let pid = child.id();
        span.in_scope(|| {
            info!(
                pid = pid.unwrap_or(0),
                live = self.live(),
                limit = self.limit,
                "worker spawned"
            );
        });

        tokio::spawn(
            async move {
                match child.wait().await {
                    Ok(status) if status.success() => info!("worker exited"),
                    Ok(status) => warn!(code = status.code(), "worker exited with failure"),
                    Err(err) => warn!(%err, "failed to wait for worker"),
                }
                drop(permit);
            }
            .instrument(span),
        );

        Ok(pid)
    }
}
