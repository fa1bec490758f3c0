//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Default size of the worker-process pool.
pub const FORK_LIMIT: usize = 3;

/// Route served by the loopback endpoint.
pub const LOOPBACK_PATH: &str = "/async/process";

/// Worker-process pool settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ForkConfig {
    /// Maximum number of concurrently live worker processes.
    pub limit: usize,
    /// Worker executable; defaults to the running binary.
    pub worker_program: Option<PathBuf>,
    /// Worker arguments. `{token}` and `{config}` are substituted.
    pub worker_args: Vec<String>,
    /// Prefer a loopback call when no worker executable is available.
    pub use_web_fallback: bool,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            limit: FORK_LIMIT,
            worker_program: None,
            worker_args: default_worker_args(),
            use_web_fallback: false,
        }
    }
}

fn default_worker_args() -> Vec<String> {
    ["--config", "{config}", "run-session", "--token", "{token}"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Loopback endpoint settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct LoopbackConfig {
    /// Static base URL; overrides the address persisted by discovery.
    pub address: Option<String>,
    /// Route appended to the base URL.
    pub path: String,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Delay the discovery probe block sleeps before writing its token.
    pub probe_delay_seconds: u64,
    /// How long discovery waits for the probe token to appear.
    pub probe_wait_seconds: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            address: None,
            path: LOOPBACK_PATH.into(),
            connect_timeout_ms: 1000,
            request_timeout_ms: 1000,
            probe_delay_seconds: 2,
            probe_wait_seconds: 6,
        }
    }
}

impl LoopbackConfig {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Replay (retry) policy for failed replayable blocks.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ReplayConfig {
    /// Backoff before the first replay.
    pub base_delay_seconds: u64,
    /// Upper bound for the computed backoff.
    pub max_delay_seconds: u64,
    /// Failures after which a replayable block stops being replayed.
    pub max_replay: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 30,
            max_delay_seconds: 3600,
            max_replay: 5,
        }
    }
}

impl ReplayConfig {
    /// Backoff in seconds for a block that has already been replayed
    /// `replay_count` times.
    #[must_use]
    pub fn backoff_seconds(&self, replay_count: u32) -> u64 {
        let factor = 1_u64.checked_shl(replay_count.min(32)).unwrap_or(u64::MAX);
        self.base_delay_seconds
            .saturating_mul(factor)
            .min(self.max_delay_seconds)
    }
}

/// Periodic sweep settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SweepConfig {
    /// Interval between sweeps while serving.
    pub interval_seconds: u64,
    /// Days a finished session is kept before being purged.
    pub retention_days: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            retention_days: 7,
        }
    }
}

fn default_http_port() -> u16 {
    8642
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file holding block rows and the config store.
    pub db_path: PathBuf,
    /// Port the loopback endpoint listens on (localhost).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Worker-process pool.
    #[serde(default)]
    pub fork: ForkConfig,
    /// Loopback endpoint.
    #[serde(default)]
    pub loopback: LoopbackConfig,
    /// Replay policy.
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Periodic sweep.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// File this configuration was loaded from, forwarded to workers.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fork.limit == 0 {
            return Err(AppError::Config("fork.limit must be greater than zero".into()));
        }

        if self.loopback.connect_timeout_ms == 0 || self.loopback.request_timeout_ms == 0 {
            return Err(AppError::Config(
                "loopback timeouts must be greater than zero".into(),
            ));
        }

        if !self.loopback.path.starts_with('/') {
            return Err(AppError::Config("loopback.path must start with '/'".into()));
        }

        if self.loopback.probe_wait_seconds <= self.loopback.probe_delay_seconds {
            return Err(AppError::Config(
                "loopback.probe_wait_seconds must exceed probe_delay_seconds".into(),
            ));
        }

        if self.replay.max_delay_seconds < self.replay.base_delay_seconds {
            return Err(AppError::Config(
                "replay.max_delay_seconds must be at least base_delay_seconds".into(),
            ));
        }

        if self.sweep.interval_seconds == 0 {
            return Err(AppError::Config(
                "sweep.interval_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
