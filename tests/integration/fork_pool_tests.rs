//! Worker pool behaviour against real child processes.
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map};

use blockdefer::orchestrator::builtin_registry;
use blockdefer::orchestrator::fork_manager::{ExecutionContext, ForkManager, LaunchOutcome};
use blockdefer::orchestrator::spawner::{WorkerCommand, WorkerPool};
use blockdefer::persistence::config_repo::ConfigRepo;
use blockdefer::persistence::db;
use blockdefer::AppError;

use super::test_helpers::test_config;

fn shell(script: &str) -> WorkerCommand {
    WorkerCommand {
        program: PathBuf::from("sh"),
        args: vec!["-c".into(), script.into(), "sh".into(), "{token}".into()],
        config_path: None,
    }
}

async fn wait_idle(pool: &WorkerPool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.live() > 0 {
        assert!(Instant::now() < deadline, "workers did not exit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn spawned_worker_releases_its_slot_on_exit() {
    let pool = WorkerPool::new(shell("sleep 0.2"), 2);

    let pid = pool.spawn("session-a", &Map::new()).await.unwrap();
    assert!(pid.is_some());
    assert_eq!(pool.live(), 1);

    wait_idle(&pool).await;
}

#[tokio::test]
async fn launches_beyond_the_limit_wait_for_a_slot() {
    let pool = WorkerPool::new(shell("sleep 0.3"), 1);

    pool.spawn("first", &Map::new()).await.unwrap();
    let started = Instant::now();
    pool.spawn("second", &Map::new()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(pool.live() <= pool.limit());
    wait_idle(&pool).await;
}

#[tokio::test]
async fn worker_receives_token_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let script = format!(
        "printf '%s %s' \"$1\" \"$BLOCKDEFER_METADATA\" > '{}'",
        out.display()
    );
    let pool = WorkerPool::new(shell(&script), 1);

    let mut metadata = Map::new();
    metadata.insert("trigger".into(), json!("test"));
    pool.spawn("tok123", &metadata).await.unwrap();
    wait_idle(&pool).await;

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, r#"tok123 {"trigger":"test"}"#);
}

#[tokio::test]
async fn missing_program_is_a_fork_error() {
    let pool = WorkerPool::new(
        WorkerCommand {
            program: PathBuf::from("/nonexistent/blockdefer-worker"),
            args: Vec::new(),
            config_path: None,
        },
        1,
    );

    let err = pool.spawn("session", &Map::new()).await.unwrap_err();
    assert!(matches!(err, AppError::Fork(_)));
    assert_eq!(pool.live(), 0);
}

#[tokio::test]
async fn cli_fork_session_starts_a_worker() {
    let db = Arc::new(db::connect_memory().await.unwrap());
    let registry = Arc::new(builtin_registry(ConfigRepo::new(Arc::clone(&db))));
    let pool = WorkerPool::new(shell("exit 0"), 1);
    let fork = ForkManager::new(db, registry, &test_config(), ExecutionContext::Cli)
        .unwrap()
        .with_pool(Some(pool.clone()));

    let outcome = fork.fork_session("sessiontoken05", Map::new()).await.unwrap();
    assert!(matches!(outcome, LaunchOutcome::Forked { pid: Some(_) }));
    wait_idle(&pool).await;
}
