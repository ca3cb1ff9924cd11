//! Integration test: node lifecycle.
//!
//! Registration, serving, reconciliation against a live settings file and
//! control plane, graceful drain and restart over the same cache directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use pier_integration_tests::{TEST_SECRET, TestNode, Upstream, fetch, origin_bytes};
use pier_node::{DrainOutcome, NodePhase};

#[tokio::test]
async fn test_node_registers_and_serves_through_cache() {
    let node = TestNode::start(64).await;

    let pings = node.control.pings();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].secret, TEST_SECRET);
    assert_eq!(pings[0].disk_space, 64 * 1024 * 1024);
    assert_eq!(node.supervisor.phase(), NodePhase::Running);

    let (status, cache, body) = node.get("/data/c0ffee/2048.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    assert_eq!(body.as_ref(), origin_bytes("data", "c0ffee", "2048.png").unwrap());

    let (status, cache, body) = node.get("/data/c0ffee/2048.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(body.len(), 2048);
    assert_eq!(node.upstream.fetches(), 1);
    assert_eq!(node.stored_bytes().await, 2048);
}

#[tokio::test]
async fn test_reconciliation_applies_settings_file_changes() {
    let node = TestNode::start(64).await;
    let mirror = Upstream::spawn().await;

    node.update_settings(|s| {
        s.override_upstream = Some(mirror.url());
        s.max_cache_size_mebibytes = 8;
        s.cache_scan_interval_seconds = 30;
        s.cache_refresh_age_seconds = 600;
    });
    let report = node.supervisor.reconcile_once().await;
    assert!(report.settings_reloaded);
    assert!(report.assignment_updated);

    assert_eq!(node.supervisor.assignment().image_server, mirror.url());
    let limits = node.engine().limits();
    assert_eq!(limits.max_bytes, 8 * 1024 * 1024);
    assert_eq!(limits.scan_interval_secs, 30);
    assert_eq!(limits.refresh_age_secs, 600);
    assert_eq!(node.control.pings().last().unwrap().disk_space, 8 * 1024 * 1024);

    let (status, _, _) = node.get("/data-saver/c0ffee/100.jpg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mirror.fetches(), 1, "miss went to the override");
    assert_eq!(node.upstream.fetches(), 0);
}

#[tokio::test]
async fn test_background_reconciliation_follows_control_plane() {
    let node = TestNode::start(64).await;
    let moved = Upstream::spawn().await;
    let task = node.supervisor.spawn_reconciliation();

    node.control.set_image_server(&moved.url());
    let mut assignment = node.supervisor.subscribe_assignment();
    tokio::time::timeout(
        Duration::from_secs(5),
        assignment.wait_for(|a| a.image_server == moved.url()),
    )
    .await
    .expect("assignment should follow the control plane")
    .unwrap();
    drop(assignment);

    node.supervisor.begin_shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("reconciliation should stop after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_control_plane_outage_keeps_assignment() {
    let node = TestNode::start(64).await;
    let before = node.supervisor.assignment();

    node.control.set_failing(true);
    for _ in 0..3 {
        let report = node.supervisor.reconcile_once().await;
        assert!(!report.assignment_updated);
    }
    assert_eq!(node.supervisor.assignment(), before);
    assert_eq!(node.control.pings().len(), 4);

    // Serving is unaffected by the outage.
    let (status, _, _) = node.get("/data/c0ffee/512.png").await;
    assert_eq!(status, StatusCode::OK);

    node.control.set_failing(false);
    assert!(node.supervisor.reconcile_once().await.assignment_updated);
}

#[tokio::test]
async fn test_invalid_settings_file_keeps_running_config() {
    let node = TestNode::start(64).await;
    std::fs::write(
        node.cache_dir().parent().unwrap().join("settings.toml"),
        "client_secret = \"\"\n",
    )
    .unwrap();

    let report = node.supervisor.reconcile_once().await;
    assert!(!report.settings_reloaded);
    assert!(report.assignment_updated);
    assert_eq!(node.supervisor.settings().client_secret, TEST_SECRET);
    assert_eq!(node.control.pings().last().unwrap().secret, TEST_SECRET);
}

#[tokio::test]
async fn test_deleted_settings_file_is_not_recreated() {
    let node = TestNode::start(64).await;
    let path = node.cache_dir().parent().unwrap().join("settings.toml");
    std::fs::remove_file(&path).unwrap();

    let report = node.supervisor.reconcile_once().await;
    assert!(!report.settings_reloaded);
    assert!(report.assignment_updated);
    assert!(!path.exists(), "no template written while running");
    assert_eq!(node.supervisor.settings().client_secret, TEST_SECRET);
}

#[tokio::test]
async fn test_drain_deregisters_and_waits_for_quiet() {
    let node = TestNode::start(64).await;
    let (status, _, _) = node.get("/data/c0ffee/64.png").await;
    assert_eq!(status, StatusCode::OK);

    let started = Instant::now();
    let outcome = node.supervisor.shutdown().await;
    assert_eq!(outcome, Some(DrainOutcome::Quiet));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(node.control.stops(), 1);
    assert_eq!(node.supervisor.phase(), NodePhase::Stopped);

    // The listener stays up until the process exits.
    let (status, cache, _) = node.get("/data/c0ffee/64.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn test_drain_under_client_traffic_serves_until_ceiling() {
    let node = TestNode::start(64).await;
    node.update_settings(|s| s.graceful_shutdown_seconds = 1);
    node.supervisor.reconcile_once().await;
    let (status, _, _) = node.get("/data/abc/1.png").await;
    assert_eq!(status, StatusCode::OK);

    let router = node.router.clone();
    let done = Arc::new(AtomicBool::new(false));
    let traffic = tokio::spawn({
        let done = done.clone();
        async move {
            let mut statuses = Vec::new();
            while !done.load(Ordering::SeqCst) {
                let (status, _, _) = fetch(&router, "/data/abc/1.png").await;
                statuses.push(status);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            statuses
        }
    });

    let started = Instant::now();
    let outcome = node.supervisor.shutdown().await;
    let elapsed = started.elapsed();
    let since_last = node.supervisor.run_state().since_last_request();
    done.store(true, Ordering::SeqCst);
    let statuses = traffic.await.unwrap();

    assert!(statuses.len() >= 10, "only {} requests during drain", statuses.len());
    assert!(statuses.iter().all(|s| *s == StatusCode::OK), "{statuses:?}");

    assert_eq!(outcome, Some(DrainOutcome::TimedOut));
    assert!(elapsed >= Duration::from_secs(1), "drained after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "drained after {elapsed:?}");
    assert!(since_last.is_some_and(|d| d < Duration::from_millis(300)));

    // Requests made during the drain were answered from the cache.
    let (status, cache, _) = node.get("/data/abc/1.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(node.upstream.fetches(), 1);
}

#[tokio::test]
async fn test_concurrent_shutdowns_drain_once() {
    let node = TestNode::start(64).await;

    let (a, b, c) = tokio::join!(
        node.supervisor.shutdown(),
        node.supervisor.shutdown(),
        node.supervisor.shutdown()
    );
    assert_eq!([a, b, c].iter().filter(|o| o.is_some()).count(), 1);
    assert_eq!(node.control.stops(), 1);
}

#[tokio::test]
async fn test_restart_reuses_cached_objects() {
    let node = TestNode::start(64).await;
    for i in 1..=5 {
        let (status, _, _) = node.get(&format!("/data/c0ffee/{}.png", i * 1000)).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(node.upstream.fetches(), 5);
    let total = node.engine().total_bytes();

    let node = node.restart().await;
    assert_eq!(node.engine().len(), 5);
    assert_eq!(node.engine().total_bytes(), total);

    let (status, cache, body) = node.get("/data/c0ffee/3000.png").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(body.as_ref(), origin_bytes("data", "c0ffee", "3000.png").unwrap());
    assert_eq!(node.upstream.fetches(), 5);
}
