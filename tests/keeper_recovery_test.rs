use keeper_log::error::{KeeperError, StorageError};
use keeper_log::keeper::{ANY_VERSION, KeeperOp};
use keeper_log::storage::disk::Disk;
use keeper_log::storage::log::SegmentPhase;
use keeper_log::storage::log::naming::{StorageRole, segment_key};
use keeper_log::{KeeperConfig, KeeperServer, Readiness};

mod common;
use common::TestEnv;

#[tokio::test]
async fn test_entries_survive_crash_with_cold_root_prefix() {
    let env = TestEnv::new();
    let server = env.start().await;
    for i in 1..=30 {
        server
            .create(&format!("/k{}", i), format!("value-{}", i).into_bytes())
            .await
            .unwrap();
    }
    let tick = server.run_maintenance().await.unwrap();
    // segments ending at or below 25 leave the hot disk
    assert_eq!(tick.migrated, 8);
    let cold_keys = env.cold_disk().list("logs").await.unwrap();
    assert_eq!(cold_keys.len(), 8);
    // no shutdown: the process dies here
    drop(server);

    let server = env.start().await;
    assert_eq!(server.readiness(), Readiness::Ready);
    assert_eq!(server.recovery_report().last_index, 30);

    let entries = server.read_log(1, 31).await.unwrap();
    assert_eq!(entries.len(), 30);
    for (i, entry) in entries.iter().enumerate() {
        let n = i + 1;
        assert_eq!(entry.index, n as u64);
        let op = KeeperOp::deserialize(&entry.payload).unwrap();
        assert_eq!(
            op,
            KeeperOp::Create {
                path: format!("/k{}", n),
                data: format!("value-{}", n).into_bytes(),
            }
        );
        assert_eq!(server.get(&format!("/k{}", n)).unwrap().0, format!("value-{}", n).into_bytes());
    }

    // the log continues where it stopped
    server.create("/k31", vec![]).await.unwrap();
    assert_eq!(server.last_applied_index(), 31);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_migration_crash_replays_segment_once() {
    let env = TestEnv::new();
    let server = env.start().await;
    for i in 1..=9 {
        server.create(&format!("/n{}", i), vec![i as u8]).await.unwrap();
    }
    drop(server);

    // remote put finished, local delete never happened
    let key = segment_key(1, Some(3), StorageRole::Log);
    let blob = env.local_disk().get(key.as_str()).await.unwrap();
    env.cold_disk().put(key.as_str(), blob).await.unwrap();

    let server = env.start().await;
    let report = server.recovery_report().clone();
    assert_eq!(report.replayed, 9);
    assert_eq!(report.last_index, 9);

    let status = server.log_status().await.unwrap();
    let firsts: Vec<u64> = status.segments.iter().map(|s| s.first_index).collect();
    assert_eq!(firsts, vec![1, 4, 7, 10]);
    assert_eq!(status.segments[0].disk_id, "local");
    assert_eq!(server.get_children("/").unwrap().len(), 9);

    // the next tick finishes the interrupted move
    server.run_maintenance().await.unwrap();
    assert!(!env.local_disk().exists(key.as_str()).await.unwrap());
    let status = server.log_status().await.unwrap();
    assert_eq!(status.segments[0].phase, SegmentPhase::Migrated);
    assert_eq!(server.read_log(1, 4).await.unwrap().len(), 3);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_middle_segment_is_corrupt_log() {
    let env = TestEnv::new();
    let server = env.start().await;
    for i in 1..=9 {
        server.create(&format!("/n{}", i), vec![]).await.unwrap();
    }
    server.shutdown().await.unwrap();

    env.local_disk()
        .delete(segment_key(4, Some(6), StorageRole::Log).as_str())
        .await
        .unwrap();

    let result = env.try_start().await;
    assert!(matches!(
        result,
        Err(KeeperError::Storage(StorageError::CorruptLog(_)))
    ));
}

#[tokio::test]
async fn test_children_visible_after_restart() {
    let env = TestEnv::new();
    let server = env.start().await;
    server.create("/test_azure", vec![]).await.unwrap();
    for i in 0..30 {
        server
            .create(&format!("/test_azure/node_{:02}", i), b"data".to_vec())
            .await
            .unwrap();
    }
    server.run_maintenance().await.unwrap();
    server.shutdown().await.unwrap();

    let server = env.start().await;
    let children = server.get_children("/test_azure").unwrap();
    assert_eq!(children.len(), 30);
    assert_eq!(children[0], "node_00");
    for child in &children {
        let (data, stat) = server.get(&format!("/test_azure/{}", child)).unwrap();
        assert_eq!(data, b"data");
        assert_eq!(stat.version, 0);
    }
    let parent = server.exists("/test_azure").unwrap().unwrap();
    assert_eq!(parent.num_children, 30);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_compaction_and_corrupt_fallback() {
    let mut env = TestEnv::new();
    let settings = &mut env.config.coordination_settings;
    settings.snapshot_distance = 10;
    settings.reserved_log_items = 15;

    let server = env.start().await;
    for i in 1..=25 {
        server.create(&format!("/n{}", i), vec![]).await.unwrap();
    }
    assert_eq!(server.last_snapshot_index(), 20);
    // compaction up to 20 - 15 removed 1..=3
    assert_eq!(server.log_status().await.unwrap().first_index, 4);
    server.shutdown().await.unwrap();

    let server = env.start().await;
    let report = server.recovery_report().clone();
    assert_eq!(report.snapshot_index, 20);
    assert_eq!(report.replayed, 5);
    assert_eq!(server.get_children("/").unwrap().len(), 25);
    server.shutdown().await.unwrap();

    env.local_disk()
        .put(
            segment_key(1, Some(20), StorageRole::Snapshot).as_str(),
            bytes::Bytes::from_static(b"garbage"),
        )
        .await
        .unwrap();

    let server = env.start().await;
    let report = server.recovery_report().clone();
    assert_eq!(report.snapshot_index, 10);
    assert_eq!(report.replayed, 15);
    assert_eq!(server.get_children("/").unwrap().len(), 25);

    server.delete("/n25", ANY_VERSION).await.unwrap();
    assert_eq!(server.get_children("/").unwrap().len(), 24);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_on_exit() {
    let mut env = TestEnv::new();
    env.config.create_snapshot_on_exit = true;

    let server = env.start().await;
    for i in 1..=4 {
        server.create(&format!("/n{}", i), vec![]).await.unwrap();
    }
    server.shutdown().await.unwrap();
    assert_eq!(server.last_snapshot_index(), 4);

    let server = env.start().await;
    assert_eq!(server.recovery_report().snapshot_index, 4);
    assert_eq!(server.recovery_report().replayed, 0);
    assert_eq!(server.get_children("/").unwrap().len(), 4);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_from_json_config() {
    let local_dir = tempfile::TempDir::new().unwrap();
    let cold_dir = tempfile::TempDir::new().unwrap();
    let raw = format!(
        r#"{{
            "disks": {{
                "local": {{ "type": "local", "path": {:?} }},
                "cold": {{
                    "type": "object_storage",
                    "provider": "local_fs",
                    "path": {:?},
                    "endpoint_subpath": "cont/logs"
                }}
            }},
            "latest_log_storage_disk": "local",
            "log_storage_disk": "cold",
            "snapshot_storage_disk": "local",
            "coordination_settings": {{
                "rotate_log_storage_interval": 3,
                "reserved_log_items": 0,
                "rotation_check_interval_ms": 10
            }}
        }}"#,
        local_dir.path().display().to_string(),
        cold_dir.path().display().to_string()
    );
    let config = KeeperConfig::from_json(&raw).unwrap();

    let server = KeeperServer::start(config.clone()).await.unwrap();
    for i in 1..=6 {
        server.create(&format!("/n{}", i), vec![]).await.unwrap();
    }
    server.run_maintenance().await.unwrap();
    server.shutdown().await.unwrap();

    // both sealed segments landed under the cold root prefix
    let mut migrated = 0;
    for entry in walk(cold_dir.path()) {
        let relative = entry.strip_prefix(cold_dir.path()).unwrap();
        assert!(relative.starts_with("cont/logs/logs"), "{:?}", relative);
        migrated += 1;
    }
    assert_eq!(migrated, 2);

    let server = KeeperServer::start(config).await.unwrap();
    assert_eq!(server.get_children("/").unwrap().len(), 6);
    server.shutdown().await.unwrap();
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files
}
