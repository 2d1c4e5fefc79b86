//! Unit tests for the disk adapters.

use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use tempfile::TempDir;

use super::*;

async fn seed(store: &Arc<InMemory>, path: &str, data: &'static [u8]) {
    store
        .put(&ObjectPath::from(path), Bytes::from_static(data).into())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_object_disk_list_stays_under_root_prefix() {
    let store = Arc::new(InMemory::new());
    let disk = ObjectStorageDisk::new("cold", store.clone(), "cont/logs");

    disk.put("logs/a.bin", Bytes::from_static(b"a")).await.unwrap();
    disk.put("logs/b.bin", Bytes::from_static(b"b")).await.unwrap();
    // Blobs in unrelated top-level prefixes of the same bucket.
    seed(&store, "logs/foreign.bin", b"x").await;
    seed(&store, "cont/other/c.bin", b"y").await;
    seed(&store, "cont/logs2/d.bin", b"z").await;

    let expected = vec!["logs/a.bin".to_string(), "logs/b.bin".to_string()];
    assert_eq!(disk.list("").await.unwrap(), expected);
    assert_eq!(disk.list("/").await.unwrap(), expected);
    assert_eq!(disk.list("logs").await.unwrap(), expected);
    assert_eq!(disk.list("/logs/").await.unwrap(), expected);
    assert!(disk.list("snapshots").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_object_disk_writes_under_root_prefix() {
    let store = Arc::new(InMemory::new());
    let disk = ObjectStorageDisk::new("cold", store.clone(), "/cont/logs/");

    disk.put("/logs/a.bin", Bytes::from_static(b"a")).await.unwrap();

    let raw = store
        .get(&ObjectPath::from("cont/logs/logs/a.bin"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(raw.as_ref(), b"a");
    assert_eq!(disk.root_prefix(), "cont/logs");
}

#[tokio::test]
async fn test_object_disk_empty_root_prefix() {
    let store = Arc::new(InMemory::new());
    let disk = ObjectStorageDisk::new("cold", store.clone(), "");

    disk.put("logs/a.bin", Bytes::from_static(b"a")).await.unwrap();
    seed(&store, "other/b.bin", b"b").await;

    assert_eq!(disk.list("logs").await.unwrap(), vec!["logs/a.bin".to_string()]);
    assert_eq!(disk.list("").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_object_disk_get_missing_is_not_found() {
    let disk = ObjectStorageDisk::new("cold", Arc::new(InMemory::new()), "root");
    let err = disk.get("logs/missing.bin").await.unwrap_err();
    assert!(matches!(err, DiskError::NotFound(_)));
    assert!(!disk.exists("logs/missing.bin").await.unwrap());
}

#[tokio::test]
async fn test_object_disk_delete_is_idempotent() {
    let disk = ObjectStorageDisk::new("cold", Arc::new(InMemory::new()), "root");
    disk.put("logs/a.bin", Bytes::from_static(b"a")).await.unwrap();
    disk.delete("logs/a.bin").await.unwrap();
    disk.delete("logs/a.bin").await.unwrap();
    assert!(disk.list("logs").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_object_disk_has_no_append() {
    let disk = ObjectStorageDisk::new("cold", Arc::new(InMemory::new()), "");
    assert!(!disk.supports_append());
    let err = disk.append("logs/a.bin", Bytes::from_static(b"a")).await.unwrap_err();
    assert!(matches!(err, DiskError::Unsupported { .. }));
}

#[tokio::test]
async fn test_local_disk_put_get_list() {
    let temp_dir = TempDir::new().unwrap();
    let disk = LocalDisk::new("local", temp_dir.path()).unwrap();

    disk.put("logs/b.bin", Bytes::from_static(b"b")).await.unwrap();
    disk.put("logs/a.bin", Bytes::from_static(b"a")).await.unwrap();
    disk.put("snapshots/s.bin", Bytes::from_static(b"s")).await.unwrap();

    assert_eq!(disk.get("logs/a.bin").await.unwrap().as_ref(), b"a");
    assert_eq!(
        disk.list("logs").await.unwrap(),
        vec!["logs/a.bin".to_string(), "logs/b.bin".to_string()]
    );
    assert_eq!(disk.list("/").await.unwrap().len(), 3);
    assert!(disk.list("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_disk_put_twice_same_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let disk = LocalDisk::new("local", temp_dir.path()).unwrap();

    disk.put("logs/a.bin", Bytes::from_static(b"same")).await.unwrap();
    let first = disk.list("").await.unwrap();
    disk.put("logs/a.bin", Bytes::from_static(b"same")).await.unwrap();

    assert_eq!(disk.list("").await.unwrap(), first);
    assert_eq!(disk.get("logs/a.bin").await.unwrap().as_ref(), b"same");
}

#[tokio::test]
async fn test_local_disk_append_and_delete() {
    let temp_dir = TempDir::new().unwrap();
    let disk = LocalDisk::new("local", temp_dir.path()).unwrap();

    assert!(disk.supports_append());
    disk.append("logs/open.bin", Bytes::from_static(b"ab")).await.unwrap();
    disk.append("logs/open.bin", Bytes::from_static(b"cd")).await.unwrap();
    assert_eq!(disk.get("logs/open.bin").await.unwrap().as_ref(), b"abcd");

    disk.delete("logs/open.bin").await.unwrap();
    disk.delete("logs/open.bin").await.unwrap();
    assert!(!disk.exists("logs/open.bin").await.unwrap());
    assert!(matches!(
        disk.get("logs/open.bin").await.unwrap_err(),
        DiskError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_keys_cannot_escape_root() {
    let temp_dir = TempDir::new().unwrap();
    let disk = LocalDisk::new("local", temp_dir.path()).unwrap();

    for key in ["", "/", "../x", "logs/../../x", "logs//a"] {
        assert!(
            matches!(
                disk.put(key, Bytes::from_static(b"x")).await,
                Err(DiskError::InvalidKey(_))
            ),
            "key {:?} should be rejected",
            key
        );
    }
}

#[test]
fn test_registry_resolves_roles() {
    let temp_dir = TempDir::new().unwrap();
    let mut registry = DiskRegistry::new();
    registry.register(Arc::new(LocalDisk::new("local", temp_dir.path()).unwrap()));
    registry.register(Arc::new(ObjectStorageDisk::new(
        "cold",
        Arc::new(InMemory::new()),
        "cont/logs",
    )));

    let roles = registry.resolve_roles("local", "cold", "local").unwrap();
    assert!(roles.is_tiered());
    assert_eq!(roles.log.descriptor().root_prefix, "cont/logs");
    assert_eq!(roles.log.descriptor().kind, DiskKind::ObjectStorage);

    assert!(matches!(
        registry.resolve_roles("local", "missing", "local"),
        Err(DiskError::Config(_))
    ));
}
