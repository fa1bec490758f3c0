//! Sweep pass: requeue, launch, and retention.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use blockdefer::models::block::{BlockCode, BlockFailure, BlockStatus};
use blockdefer::orchestrator::fork_manager::ExecutionContext;
use blockdefer::orchestrator::loopback::LoopbackClient;
use blockdefer::orchestrator::registry::Invocation;
use blockdefer::orchestrator::sweeper::{spawn_sweeper, sweep_once};
use blockdefer::persistence::config_repo::KEY_LOOPBACK_ADDRESS;

use super::test_helpers::{harness, harness_with, test_config, Harness, RecordingClient};

#[tokio::test]
async fn sweep_requeues_failed_replays_and_launches_ready_sessions() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let client = Arc::new(RecordingClient::default());
    let h = harness_with(
        &test_config(),
        ExecutionContext::Web,
        Some(Arc::clone(&client) as Arc<dyn LoopbackClient>),
        move |r| {
            r.register_closure("flaky", false, move |_: Invocation| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BlockFailure::new("transient", "retry me"))
            });
        },
    )
    .await;
    h.store
        .set(KEY_LOOPBACK_ADDRESS, "http://127.0.0.1:8642")
        .await
        .unwrap();

    let mut session = h.manager.open_session();
    let block = session
        .record(BlockCode::closure("flaky"), Vec::new())
        .unwrap()
        .replayable(true)
        .token()
        .to_owned();
    let token = h.close(session).await;
    h.run(&token).await.unwrap();
    assert_eq!(h.block(&block).await.status, BlockStatus::Error);

    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(report.launched, 1);
    assert_eq!(h.block(&block).await.status, BlockStatus::Standby);
    assert_eq!(client.calls()[0].1, token);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sweep_counts_deferred_sessions() {
    let h = harness(|r| r.register_closure("ok", false, |_: Invocation| Ok(None))).await;

    let mut session = h.manager.open_session();
    session.record(BlockCode::closure("ok"), Vec::new()).unwrap();
    h.close(session).await;

    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();
    assert_eq!(report.launched, 0);
    assert_eq!(report.deferred, 1);
}

#[tokio::test]
async fn sweep_purges_only_old_finished_sessions() {
    let h = harness(|r| r.register_closure("ok", false, |_: Invocation| Ok(None))).await;

    let mut old = h.manager.open_session();
    let old_block = old
        .record(BlockCode::closure("ok"), Vec::new())
        .unwrap()
        .token()
        .to_owned();
    let old_token = h.close(old).await;
    h.run(&old_token).await.unwrap();

    let mut pending = h.manager.open_session();
    let pending_block = pending
        .record(BlockCode::closure("ok"), Vec::new())
        .unwrap()
        .token()
        .to_owned();
    h.close(pending).await;

    let cutoff = (Utc::now() - Duration::days(30)).to_rfc3339();
    sqlx::query("UPDATE async_block SET created_at = ?1")
        .bind(&cutoff)
        .execute(h.db.as_ref())
        .await
        .unwrap();

    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();

    assert_eq!(report.purged, 1);
    assert!(h.blocks.get_by_token(&old_block).await.is_err());
    assert!(h.blocks.get_by_token(&pending_block).await.is_ok());
}

async fn age_all_blocks(h: &Harness, days: i64) {
    let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
    sqlx::query("UPDATE async_block SET created_at = ?1")
        .bind(&cutoff)
        .execute(h.db.as_ref())
        .await
        .unwrap();
}

async fn web_harness(client: &Arc<RecordingClient>) -> Harness {
    let h = harness_with(
        &test_config(),
        ExecutionContext::Web,
        Some(Arc::clone(client) as Arc<dyn LoopbackClient>),
        |r| {
            r.register_closure("ok", false, |_: Invocation| Ok(None));
            r.register_closure("fail", false, |_: Invocation| {
                Err(BlockFailure::new("runtime", "boom"))
            });
        },
    )
    .await;
    h.store
        .set(KEY_LOOPBACK_ADDRESS, "http://127.0.0.1:8642")
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn session_halted_by_a_blocker_is_not_relaunched_and_gets_purged() {
    let client = Arc::new(RecordingClient::default());
    let h = web_harness(&client).await;

    let mut session = h.manager.open_session();
    session
        .record(BlockCode::closure("fail"), Vec::new())
        .unwrap()
        .blocker(true);
    let trailing = session
        .record(BlockCode::closure("ok"), Vec::new())
        .unwrap()
        .token()
        .to_owned();
    let token = h.close(session).await;
    h.run(&token).await.unwrap();
    assert_eq!(h.block(&trailing).await.status, BlockStatus::Standby);

    for _ in 0..3 {
        let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
            .await
            .unwrap();
        assert_eq!(report.launched, 0);
        assert_eq!(report.deferred, 0);
    }
    assert!(client.calls().is_empty());

    age_all_blocks(&h, 30).await;
    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();
    assert_eq!(report.purged, 2);
    assert!(h.blocks.get_by_session(&token).await.unwrap().is_empty());
}

#[tokio::test]
async fn session_with_a_dead_requirement_finishes_and_gets_purged() {
    let client = Arc::new(RecordingClient::default());
    let h = web_harness(&client).await;

    let mut session = h.manager.open_session();
    session
        .record(BlockCode::closure("fail"), Vec::new())
        .unwrap()
        .id("a");
    let dependent = session
        .record(BlockCode::closure("ok"), Vec::new())
        .unwrap()
        .require("a")
        .token()
        .to_owned();
    let token = h.close(session).await;
    h.run(&token).await.unwrap();
    assert_eq!(h.block(&dependent).await.status, BlockStatus::Error);

    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();
    assert_eq!(report.launched, 0);
    assert!(client.calls().is_empty());

    age_all_blocks(&h, 30).await;
    let report = sweep_once(&h.fork, &h.blocks, &test_config().sweep)
        .await
        .unwrap();
    assert_eq!(report.purged, 2);
}

#[tokio::test]
async fn background_sweeper_stops_on_cancel() {
    let h = harness(|_| {}).await;
    let ct = CancellationToken::new();
    let handle = spawn_sweeper(
        Arc::clone(&h.fork),
        h.blocks.clone(),
        test_config().sweep,
        ct.clone(),
    );

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ct.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("sweeper stops")
        .expect("sweeper task");

    // Nothing recorded, nothing to launch.
    assert!(h
        .blocks
        .list_ready_sessions(Utc::now().timestamp())
        .await
        .unwrap()
        .is_empty());
}
