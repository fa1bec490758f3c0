//! Loopback discovery against a live endpoint.

use std::sync::Arc;

use blockdefer::orchestrator::discovery::LoopbackDiscovery;
use blockdefer::persistence::config_repo::{ConfigRepo, KEY_LOOPBACK_ADDRESS};

use super::loopback_endpoint_tests::spawn_endpoint;
use super::test_helpers::{harness, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_working_candidate_is_stored() {
    let h = harness(|_| {}).await;
    let (base, ct) = spawn_endpoint(&h).await;

    let discovery = LoopbackDiscovery::new(
        Arc::clone(&h.manager),
        h.store.clone(),
        test_config().loopback,
    );
    let reports = discovery
        .discover(&["http://127.0.0.1:9".to_owned(), base.clone()])
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert!(!reports[0].accepted);
    assert!(reports[0]
        .reason
        .as_deref()
        .unwrap()
        .starts_with("unreachable"));
    assert!(reports[1].accepted, "{:?}", reports[1].reason);
    assert_eq!(
        h.store.get(KEY_LOOPBACK_ADDRESS).await.unwrap(),
        Some(base)
    );
    ct.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn endpoint_of_another_instance_fails_the_ping() {
    let h = harness(|_| {}).await;
    let other = harness(|_| {}).await;
    let (base, ct) = spawn_endpoint(&other).await;

    let discovery = LoopbackDiscovery::new(
        Arc::clone(&h.manager),
        ConfigRepo::new(Arc::clone(&h.db)),
        test_config().loopback,
    );
    let report = discovery.test_candidate(&base).await;

    assert!(!report.accepted);
    assert!(report.reason.unwrap().contains("mismatch"));
    assert_eq!(h.store.get(KEY_LOOPBACK_ADDRESS).await.unwrap(), None);
    ct.cancel();
}
