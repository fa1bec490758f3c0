//! Shared helpers for scheduler integration tests.
//!
//! Builds an in-memory database, a registry with test handlers, and the
//! manager pair wired together so test modules can focus on behaviour.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use blockdefer::config::GlobalConfig;
use blockdefer::models::block::Block;
use blockdefer::models::session::SessionView;
use blockdefer::orchestrator::async_manager::{AsyncManager, ExecutionTime, SessionBuilder};
use blockdefer::orchestrator::builtin_registry;
use blockdefer::orchestrator::fork_manager::{ExecutionContext, ForkManager, SessionReport};
use blockdefer::orchestrator::loopback::LoopbackClient;
use blockdefer::orchestrator::registry::BlockRegistry;
use blockdefer::orchestrator::wrapper::BlockWrapper;
use blockdefer::persistence::block_repo::BlockRepo;
use blockdefer::persistence::config_repo::ConfigRepo;
use blockdefer::persistence::db;
use blockdefer::{AppError, Result};
use sqlx::SqlitePool;

/// Configuration with immediate replays and a short discovery probe.
pub fn test_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
db_path = "unused.db"
http_port = 0

[replay]
base_delay_seconds = 0
max_delay_seconds = 0
max_replay = 3

[loopback]
probe_delay_seconds = 1
probe_wait_seconds = 4
"#,
    )
    .expect("valid test config")
}

/// Everything a test needs to record and run sessions.
pub struct Harness {
    pub db: Arc<SqlitePool>,
    pub store: ConfigRepo,
    pub blocks: BlockRepo,
    pub fork: Arc<ForkManager>,
    pub manager: Arc<AsyncManager>,
}

impl Harness {
    /// Close `session` without launching it and return its token.
    pub async fn close(&self, session: SessionBuilder) -> String {
        self.manager
            .close_session(session, ExecutionTime::Later)
            .await
            .expect("close session")
    }

    /// Run one pass over `token`.
    pub async fn run(&self, token: &str) -> Result<SessionReport> {
        self.fork.run_session(token, Map::new()).await
    }

    /// Current stored copy of block `token`.
    pub async fn block(&self, token: &str) -> Block {
        self.blocks.get_by_token(token).await.expect("block exists")
    }
}

/// Harness whose fork manager has no worker pool and `context`.
pub async fn harness_with(
    config: &GlobalConfig,
    context: ExecutionContext,
    client: Option<Arc<dyn LoopbackClient>>,
    setup: impl FnOnce(&mut BlockRegistry),
) -> Harness {
    build(config, context, client, None, setup).await
}

/// CLI harness whose fork manager reports lifecycle events to `wrapper`.
pub async fn wrapped_harness(
    wrapper: Arc<dyn BlockWrapper>,
    setup: impl FnOnce(&mut BlockRegistry),
) -> Harness {
    build(&test_config(), ExecutionContext::Cli, None, Some(wrapper), setup).await
}

async fn build(
    config: &GlobalConfig,
    context: ExecutionContext,
    client: Option<Arc<dyn LoopbackClient>>,
    wrapper: Option<Arc<dyn BlockWrapper>>,
    setup: impl FnOnce(&mut BlockRegistry),
) -> Harness {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let store = ConfigRepo::new(Arc::clone(&db));
    let mut registry = builtin_registry(store.clone());
    setup(&mut registry);
    let registry = Arc::new(registry);

    let mut fork = ForkManager::new(Arc::clone(&db), Arc::clone(&registry), config, context)
        .expect("fork manager")
        .with_pool(None);
    if let Some(client) = client {
        fork = fork.with_client(client);
    }
    if let Some(wrapper) = wrapper {
        fork = fork.with_wrapper(wrapper);
    }
    let fork = Arc::new(fork);
    let manager = Arc::new(AsyncManager::new(
        Arc::clone(&db),
        registry,
        Arc::clone(&fork),
    ));

    Harness {
        blocks: BlockRepo::new(Arc::clone(&db)),
        db,
        store,
        fork,
        manager,
    }
}

/// CLI harness with the default test config.
pub async fn harness(setup: impl FnOnce(&mut BlockRegistry)) -> Harness {
    harness_with(&test_config(), ExecutionContext::Cli, None, setup).await
}

/// Loopback client recording every call instead of sending it.
#[derive(Default)]
pub struct RecordingClient {
    pub calls: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl RecordingClient {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl LoopbackClient for RecordingClient {
    fn post_token<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("calls lock")
                .push((url.to_owned(), token.to_owned()));
            if self.fail {
                Err(AppError::Loopback("connection refused".into()))
            } else {
                Ok(json!({ "token": token, "accepted": true }).to_string())
            }
        })
    }
}

/// Shared, ordered log handlers append to.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Append `entry` to `log`.
pub fn log_call(log: &CallLog, entry: impl Into<String>) {
    log.lock().expect("log lock").push(entry.into());
}

/// Snapshot of `log`.
pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

/// First argument of a call as a string, for log entries.
pub fn first_arg(args: &[Value]) -> String {
    args.first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Wrapper appending every lifecycle event to a [`CallLog`].
#[derive(Default)]
pub struct RecordingWrapper {
    pub log: CallLog,
}

impl BlockWrapper for RecordingWrapper {
    fn session_start(&self, session: &SessionView) {
        log_call(&self.log, format!("session_start:{}", session.blocks().len()));
    }

    fn init(&self, block: &Block) {
        log_call(&self.log, format!("init:{}", block.name.as_deref().unwrap_or("")));
    }

    fn activity(&self, message: &str) {
        log_call(&self.log, format!("activity:{message}"));
    }

    fn end(&self, block: &Block) {
        log_call(
            &self.log,
            format!(
                "end:{}:{:?}",
                block.name.as_deref().unwrap_or(""),
                block.status
            ),
        );
    }

    fn session_end(&self, session: &SessionView) {
        log_call(&self.log, format!("session_end:{:?}", session.global_status()));
    }
}
