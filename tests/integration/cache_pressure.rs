//! Integration test: cache pressure.
//!
//! The size ceiling holds under concurrent misses, follows the settings
//! file, and idle objects expire on scan. On-disk bytes always match the
//! index.

use std::sync::Arc;

use axum::http::StatusCode;
use pier_integration_tests::TestNode;
use pier_types::now_millis;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ceiling_holds_under_concurrent_misses() {
    let node = Arc::new(TestNode::start(1).await);

    let mut tasks = Vec::new();
    for i in 0..32 {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            let (status, _, body) = node.get(&format!("/data/c{i:03}/{}.png", 100 * KIB)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.len() as u64, 100 * KIB);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let engine = node.engine();
    assert!(engine.total_bytes() <= MIB, "total {} over ceiling", engine.total_bytes());
    assert!(!engine.is_empty());
    assert_eq!(node.stored_bytes().await, engine.total_bytes());
}

#[tokio::test]
async fn test_lowering_ceiling_in_settings_evicts_oldest() {
    let node = TestNode::start(4).await;
    for i in 0..10 {
        let (status, _, _) = node.get(&format!("/data/c{i:03}/{}.png", 300 * KIB)).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(node.engine().total_bytes(), 3000 * KIB);

    // Touch the first object so it is the most recently used.
    let (_, cache, _) = node.get(&format!("/data/c000/{}.png", 300 * KIB)).await;
    assert_eq!(cache.as_deref(), Some("HIT"));

    node.update_settings(|s| s.max_cache_size_mebibytes = 1);
    node.supervisor.reconcile_once().await;

    let engine = node.engine();
    assert!(engine.total_bytes() <= MIB);
    assert_eq!(engine.len(), 3);
    assert_eq!(node.stored_bytes().await, engine.total_bytes());

    let (_, cache, _) = node.get(&format!("/data/c000/{}.png", 300 * KIB)).await;
    assert_eq!(cache.as_deref(), Some("HIT"), "recently used object survives");
    let (_, cache, _) = node.get(&format!("/data/c001/{}.png", 300 * KIB)).await;
    assert_eq!(cache.as_deref(), Some("MISS"), "oldest object was evicted");
}

#[tokio::test]
async fn test_idle_objects_expire_on_scan() {
    let node = TestNode::start(64).await;
    node.update_settings(|s| s.cache_refresh_age_seconds = 60);
    node.supervisor.reconcile_once().await;

    for i in 0..4 {
        node.get(&format!("/data/c{i:03}/1000.png")).await;
    }

    let report = node.engine().scan_and_evict_at(now_millis() + 30_000).await;
    assert_eq!(report.expired, 0);
    assert_eq!(node.engine().len(), 4);

    let report = node.engine().scan_and_evict_at(now_millis() + 120_000).await;
    assert_eq!(report.expired, 4);
    assert!(node.engine().is_empty());
    assert_eq!(node.stored_bytes().await, 0);
}

#[tokio::test]
async fn test_scan_adopts_objects_written_behind_the_index() {
    let node = TestNode::start(64).await;
    node.get("/data/c000/4096.png").await;

    // A second node process sharing the directory would look like this.
    let other = pier_store::FileStore::new(node.cache_dir()).unwrap();
    let id = pier_types::ContentId::for_image("data", "c001", "4096.png");
    pier_store::ObjectStore::put(&other, id, bytes::Bytes::from(vec![7u8; 4096]))
        .await
        .unwrap();

    let report = node.engine().scan_and_evict().await;
    assert_eq!(report.adopted, 1);
    assert_eq!(node.engine().len(), 2);
    assert_eq!(node.engine().total_bytes(), 8192);

    let (_, cache, body) = node.get("/data/c001/4096.png").await;
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(body.as_ref(), &[7u8; 4096][..]);
}
