//! Execution phase: launch sessions out of process and run their blocks.
//!
//! A session is launched either as a detached worker process
//! ([`WorkerPool`]) or through a loopback call to the scheduler's own HTTP
//! endpoint. Whichever process ends up running the session walks its blocks
//! in persistence order through [`ForkManager::run_session`].
//!
//! Every state change of a claimed block is written with a fenced update
//! keyed on the expected status and the lock token; losing that race means
//! another worker owns the row and the local result is discarded.

use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, LoopbackConfig, ReplayConfig};
use crate::models::block::{Block, BlockFailure, BlockResult, BlockStatus};
use crate::models::session::{GlobalStatus, Requirement, SessionView};
use crate::persistence::block_repo::BlockRepo;
use crate::persistence::config_repo::{ConfigRepo, KEY_LOOPBACK_ADDRESS};
use crate::persistence::db::Database;
use crate::{AppError, Result};

use super::codec;
use super::loopback::{endpoint_url, HttpLoopbackClient, LoopbackClient};
use super::registry::{BlockRegistry, HandlerResult, Invocation};
use super::spawner::WorkerPool;
use super::token;
use super::wrapper::{BlockWrapper, DummyWrapper};

/// Metadata key naming how a session pass was launched.
pub const EXECUTION_KEY: &str = "execution";

/// Where the caller of [`ForkManager::fork_session`] lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Long-lived process able to start worker processes.
    Cli,
    /// Request handler; sessions go through the loopback endpoint.
    Web,
}

/// How a launch request was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A worker process was started.
    Forked {
        /// Process id, when the platform reports one.
        pid: Option<u32>,
    },
    /// The loopback endpoint accepted the session.
    Loopback,
    /// Nothing could launch the session; it stays `standby` for the sweeper.
    Deferred,
}

/// Summary of one [`ForkManager::run_session`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Session token.
    pub token: String,
    /// Blocks attempted in this pass.
    pub executed: Vec<String>,
    /// Blocks left `standby` because a requirement is not met.
    pub deferred: Vec<String>,
    /// Blocks failed without running because a requirement can never succeed.
    pub abandoned: Vec<String>,
    /// Blocks skipped because they were not due.
    pub skipped: Vec<String>,
    /// Blocker that halted the pass.
    pub halted_by: Option<String>,
    /// Aggregate status at the end of the pass.
    pub status: GlobalStatus,
}

impl SessionReport {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_owned(),
            executed: Vec::new(),
            deferred: Vec::new(),
            abandoned: Vec::new(),
            skipped: Vec::new(),
            halted_by: None,
            status: GlobalStatus::Standby,
        }
    }
}

/// Launches sessions and executes their blocks.
pub struct ForkManager {
    blocks: BlockRepo,
    config_store: ConfigRepo,
    registry: Arc<BlockRegistry>,
    wrapper: Arc<dyn BlockWrapper>,
    client: Arc<dyn LoopbackClient>,
    pool: Option<WorkerPool>,
    context: ExecutionContext,
    loopback: LoopbackConfig,
    replay: ReplayConfig,
    use_web_fallback: bool,
}

impl ForkManager {
    /// Build a manager from configuration.
    ///
    /// The worker pool is derived from `config.fork`; the loopback client
    /// uses the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Loopback` if the HTTP client cannot be built.
    pub fn new(
        db: Arc<Database>,
        registry: Arc<BlockRegistry>,
        config: &GlobalConfig,
        context: ExecutionContext,
    ) -> Result<Self> {
        let client = HttpLoopbackClient::new(&config.loopback)?;
        Ok(Self {
            blocks: BlockRepo::new(Arc::clone(&db)),
            config_store: ConfigRepo::new(db),
            registry,
            wrapper: Arc::new(DummyWrapper),
            client: Arc::new(client),
            pool: WorkerPool::from_config(config),
            context,
            loopback: config.loopback.clone(),
            replay: config.replay.clone(),
            use_web_fallback: config.fork.use_web_fallback,
        })
    }

    /// Replace the lifecycle wrapper.
    #[must_use]
    pub fn with_wrapper(mut self, wrapper: Arc<dyn BlockWrapper>) -> Self {
        self.wrapper = wrapper;
        self
    }

    /// Replace the loopback client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn LoopbackClient>) -> Self {
        self.client = client;
        self
    }

    /// Replace the worker pool; `None` disables process launches.
    #[must_use]
    pub fn with_pool(mut self, pool: Option<WorkerPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Context this manager launches from.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Worker pool, if process launches are available.
    #[must_use]
    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Execute every due, runnable block of a session in persistence order.
    ///
    /// Blocks whose requirements are not met yet stay `standby` and are
    /// retried on a later pass. Blocks whose requirements can never succeed
    /// fail with class `dependency` and no replay. A failing blocker halts
    /// the pass; so does a blocker left from an earlier pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::AsyncProcess` if the session is not `standby`,
    /// `AppError::BlockLocked` if another worker claimed a block first, and
    /// `AppError::Db` on persistence failures.
    pub async fn run_session(
        &self,
        session_token: &str,
        metadata: Map<String, Value>,
    ) -> Result<SessionReport> {
        let span = info_span!("run_session", session = session_token);
        self.run_session_pass(session_token, metadata)
            .instrument(span)
            .await
    }

    async fn run_session_pass(
        &self,
        session_token: &str,
        metadata: Map<String, Value>,
    ) -> Result<SessionReport> {
        let blocks = self.blocks.get_by_session(session_token).await?;
        let mut session = SessionView::new(session_token, blocks);
        match session.global_status() {
            GlobalStatus::Empty => {
                return Err(AppError::NotFound(format!("session {session_token}")));
            }
            GlobalStatus::Standby => {}
            other => {
                return Err(AppError::AsyncProcess(format!(
                    "session {session_token} is {other:?}"
                )));
            }
        }

        let execution = metadata
            .get(EXECUTION_KEY)
            .and_then(Value::as_str)
            .unwrap_or("inline")
            .to_owned();

        self.wrapper.session_start(&session);
        let mut report = SessionReport::new(session_token);

        let tokens: Vec<String> = session.blocks().iter().map(|b| b.token.clone()).collect();
        for block_token in tokens {
            let Some(mut block) = session.by_token(&block_token).cloned() else {
                continue;
            };

            if block.status == BlockStatus::Blocker {
                info!(block = %block.token, "session halted by earlier blocker");
                report.halted_by = Some(block.token);
                break;
            }

            if !block.is_due(Utc::now().timestamp()) {
                debug!(block = %block.token, status = ?block.status, "block not due");
                report.skipped.push(block.token);
                continue;
            }

            match session.requirement_state(&block.require) {
                Requirement::Met => {}
                Requirement::Pending => {
                    self.defer_block(&mut block).await?;
                    session.refresh(&block);
                    report.deferred.push(block.token);
                    continue;
                }
                Requirement::Unsatisfiable(id) => {
                    let block = self.abandon_block(block, &id).await?;
                    session.refresh(&block);
                    report.abandoned.push(block.token.clone());
                    if block.status == BlockStatus::Blocker {
                        info!(block = %block.token, "blocker abandoned; halting session");
                        report.halted_by = Some(block.token);
                        break;
                    }
                    continue;
                }
            }

            for (key, value) in &metadata {
                block.metadata.insert(key.clone(), value.clone());
            }

            self.lock_block(&mut block).await?;
            let block = self.execute_block(block, &execution).await?;
            session.refresh(&block);
            report.executed.push(block.token.clone());

            if block.status == BlockStatus::Blocker {
                info!(block = %block.token, "blocker failed; halting session");
                report.halted_by = Some(block.token);
                break;
            }
        }

        self.wrapper.session_end(&session);
        report.status = session.global_status();
        info!(
            executed = report.executed.len(),
            deferred = report.deferred.len(),
            skipped = report.skipped.len(),
            status = ?report.status,
            "session pass complete"
        );
        Ok(report)
    }

    async fn defer_block(&self, block: &mut Block) -> Result<()> {
        block.next_run = Utc::now().timestamp();
        if !self
            .blocks
            .update_status(block, BlockStatus::Standby, None)
            .await?
        {
            warn!(block = %block.token, "block changed while deferring");
        }
        debug!(block = %block.token, require = ?block.require, "requirements not met; deferred");
        Ok(())
    }

    async fn abandon_block(&self, mut block: Block, requirement: &str) -> Result<Block> {
        block.status = if block.blocker {
            BlockStatus::Blocker
        } else {
            BlockStatus::Error
        };
        block.next_run = 0;
        block.error = Some(BlockFailure::new(
            "dependency",
            format!("requirement {requirement} can never succeed"),
        ));
        if !self
            .blocks
            .update_status(&block, BlockStatus::Standby, None)
            .await?
        {
            warn!(block = %block.token, "block changed while abandoning");
            return self.blocks.get_by_token(&block.token).await;
        }
        info!(block = %block.token, requirement, "requirement unsatisfiable; block failed");
        Ok(block)
    }

    /// Claim a `standby` block for this worker.
    ///
    /// On success the block is `running` and carries a fresh lock token,
    /// both in memory and in storage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` if the in-memory copy is not
    /// `standby`, `AppError::BlockLocked` if the stored row was claimed
    /// first, and `AppError::Db` if the update fails.
    pub async fn lock_block(&self, block: &mut Block) -> Result<()> {
        if block.status != BlockStatus::Standby {
            return Err(AppError::AlreadyRunning(format!(
                "block {} is {:?}",
                block.token, block.status
            )));
        }
        let lock = token::lock_token();
        if !self.blocks.claim(&block.token, &lock).await? {
            return Err(AppError::BlockLocked(block.token.clone()));
        }
        block.status = BlockStatus::Running;
        block.lock_token = Some(lock);
        Ok(())
    }

    /// Run a claimed block and persist its outcome.
    ///
    /// On success the block becomes `success`; if it had been replayed, every
    /// sibling waiting on a replay becomes due immediately. On failure the
    /// block becomes `error` (or `blocker`); a replayable block under the
    /// replay ceiling gets its counter bumped and `next_run` pushed out by
    /// the backoff, otherwise `next_run` is cleared. If the row was claimed
    /// by someone else meanwhile, nothing is written and the stored copy is
    /// returned instead.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if persisting the outcome fails.
    pub async fn execute_block(&self, block: Block, execution: &str) -> Result<Block> {
        let span = info_span!("execute_block", block = %block.token);
        self.execute_claimed(block, execution).instrument(span).await
    }

    async fn execute_claimed(&self, mut block: Block, execution: &str) -> Result<Block> {
        self.wrapper.init(&block);

        let start = Utc::now();
        let outcome = self.invoke(&block).await;
        let end = Utc::now();
        let now = end.timestamp();
        let replayed_before = block.replay_count > 0;

        let succeeded = match outcome {
            Ok(output) => {
                block.status = BlockStatus::Success;
                block.error = None;
                block.next_run = 0;
                block.result = Some(BlockResult {
                    start,
                    end,
                    execution: execution.to_owned(),
                    output,
                });
                true
            }
            Err(failure) => {
                if block.replayable && block.replay_count < self.replay.max_replay {
                    let backoff = self.replay.backoff_seconds(block.replay_count);
                    block.replay(now, backoff);
                } else {
                    block.next_run = 0;
                }
                block.status = if block.blocker {
                    BlockStatus::Blocker
                } else {
                    BlockStatus::Error
                };
                block.error = Some(failure);
                block.result = Some(BlockResult {
                    start,
                    end,
                    execution: execution.to_owned(),
                    output: None,
                });
                false
            }
        };

        let lock = block.lock_token.take();
        if !self
            .blocks
            .update_status(&block, BlockStatus::Running, lock.as_deref())
            .await?
        {
            warn!("block lost its lock while executing; outcome discarded");
            let stored = self.blocks.get_by_token(&block.token).await?;
            self.wrapper.end(&stored);
            return Ok(stored);
        }

        if succeeded && replayed_before {
            let reset = self
                .blocks
                .reset_session_next_run(&block.session_token, now)
                .await?;
            debug!(reset, "replayed block succeeded; siblings due now");
        }

        self.wrapper.end(&block);
        Ok(block)
    }

    async fn invoke(&self, block: &Block) -> HandlerResult {
        let calls = codec::decode_code(&block.code, &block.params.allowed_types)
            .and_then(|()| codec::decode_invocations(&block.params))
            .map_err(|err| BlockFailure::new("decode", err.to_string()))?;

        let wrapper = block.params.wrapper.then(|| Arc::clone(&self.wrapper));
        let dataset = !block.params.dataset.is_empty();
        let mut outputs = Vec::with_capacity(calls.len());

        for args in calls {
            let call = self
                .registry
                .prepare(&block.code)
                .map_err(|err| BlockFailure::new("unknown_handler", err.to_string()))?;
            let invocation = Invocation {
                wrapper: wrapper.clone(),
                args,
            };
            let output = match tokio::task::spawn_blocking(move || call(invocation)).await {
                Ok(result) => result?,
                Err(err) if err.is_panic() => {
                    return Err(BlockFailure::new("panic", panic_message(err.into_panic())));
                }
                Err(err) => return Err(BlockFailure::new("cancelled", err.to_string())),
            };
            outputs.push(output.unwrap_or(Value::Null));
        }

        if dataset {
            Ok(Some(Value::Array(outputs)))
        } else {
            Ok(outputs.pop().filter(|v| !v.is_null()))
        }
    }

    /// Launch a session out of process.
    ///
    /// From a CLI context the session goes to a worker process. Without a
    /// worker executable the loopback endpoint is used instead, but only when
    /// `use_web_fallback` is set. From a web context the loopback endpoint is
    /// always used. If nothing is reachable the session is left for the
    /// sweeper.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Fork` if a worker process fails to start.
    pub async fn fork_session(
        &self,
        session_token: &str,
        metadata: Map<String, Value>,
    ) -> Result<LaunchOutcome> {
        let span = info_span!("fork_session", session = session_token, context = ?self.context);
        self.launch(session_token, metadata).instrument(span).await
    }

    async fn launch(
        &self,
        session_token: &str,
        metadata: Map<String, Value>,
    ) -> Result<LaunchOutcome> {
        if self.context == ExecutionContext::Cli {
            if let Some(pool) = &self.pool {
                let mut metadata = metadata;
                metadata.insert(EXECUTION_KEY.into(), json!("worker"));
                let pid = pool.spawn(session_token, &metadata).await?;
                return Ok(LaunchOutcome::Forked { pid });
            }
            if !self.use_web_fallback {
                info!("no worker available and web fallback disabled; session deferred");
                return Ok(LaunchOutcome::Deferred);
            }
        }

        match self.loopback(session_token).await {
            Ok(true) => Ok(LaunchOutcome::Loopback),
            Ok(false) => {
                info!("no loopback address known; session deferred");
                Ok(LaunchOutcome::Deferred)
            }
            Err(err) => {
                warn!(%err, "loopback launch failed; session deferred");
                Ok(LaunchOutcome::Deferred)
            }
        }
    }

    /// Loopback base URL: the configured one, else the discovered one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the config store cannot be read.
    pub async fn loopback_address(&self) -> Result<Option<String>> {
        if let Some(address) = &self.loopback.address {
            return Ok(Some(address.clone()));
        }
        self.config_store.get(KEY_LOOPBACK_ADDRESS).await
    }

    async fn loopback(&self, session_token: &str) -> Result<bool> {
        let Some(base) = self.loopback_address().await? else {
            return Ok(false);
        };
        self.loopback_to(&base, session_token).await?;
        info!(base = %base, "session handed to loopback endpoint");
        Ok(true)
    }

    /// POST `session_token` to the endpoint under `base` and return the
    /// response body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Loopback` if the call fails.
    pub async fn loopback_to(&self, base: &str, session_token: &str) -> Result<String> {
        let url = endpoint_url(base, &self.loopback.path);
        self.client.post_token(&url, session_token).await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
