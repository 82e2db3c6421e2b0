//! Snapshot export/import, stores and auto-save.

mod common;

use appbox_common::{RuntimePort, Snapshot, SnapshotFile, SnapshotStore, SNAPSHOT_VERSION};
use appbox_pool::snapshot::{self, AutoSaver};
use appbox_pool::{
    ExportLimits, FsSnapshotStore, MemoryRuntime, MemorySnapshotStore, PoolConfig, PoolManager,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use common::{app, wait_until, CountingStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn booted() -> (MemoryRuntime, Arc<appbox_pool::MemoryHandle>) {
    let runtime = MemoryRuntime::new();
    runtime.boot("fixture").await.unwrap();
    let handle = runtime.last_handle().await.unwrap();
    (runtime, handle)
}

fn file(path: &str, bytes: &[u8]) -> SnapshotFile {
    SnapshotFile {
        path: path.to_string(),
        content: STANDARD.encode(bytes),
    }
}

#[tokio::test]
async fn test_export_skips_excluded_entries() {
    let (_runtime, handle) = booted().await;
    handle.seed("index.js", b"1").await.unwrap();
    handle.seed("node_modules/react/index.js", b"2").await.unwrap();
    handle.seed("src/.git/HEAD", b"3").await.unwrap();
    handle.seed("src/app.js", b"4").await.unwrap();
    handle.seed("debug.log", b"5").await.unwrap();

    let limits = ExportLimits {
        exclude: vec!["node_modules".into(), ".git".into(), "*.log".into()],
        ..ExportLimits::default()
    };
    let snapshot = snapshot::export(&*handle, &limits).await.unwrap();
    let paths: Vec<_> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["index.js", "src/app.js"]);
    assert_eq!(snapshot.version, SNAPSHOT_VERSION);
}

#[tokio::test]
async fn test_export_respects_depth_and_file_caps() {
    let (_runtime, handle) = booted().await;
    handle.seed("a.txt", b"a").await.unwrap();
    handle.seed("d1/b.txt", b"b").await.unwrap();
    handle.seed("d1/d2/c.txt", b"c").await.unwrap();
    handle.seed("d1/d2/d3/d.txt", b"d").await.unwrap();

    let shallow = ExportLimits {
        max_depth: 1,
        ..ExportLimits::default()
    };
    let snapshot = snapshot::export(&*handle, &shallow).await.unwrap();
    let paths: Vec<_> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "d1/b.txt"]);

    let capped = ExportLimits {
        max_files: 3,
        ..ExportLimits::default()
    };
    let snapshot = snapshot::export(&*handle, &capped).await.unwrap();
    assert_eq!(snapshot.files.len(), 3);
}

#[tokio::test]
async fn test_import_skips_corrupt_payload() {
    let (_runtime, handle) = booted().await;
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        files: vec![
            file("a/one.txt", b"one"),
            SnapshotFile {
                path: "a/b/two.txt".to_string(),
                content: "%%% not base64 %%%".to_string(),
            },
            file("three.txt", b"three"),
        ],
    };

    let report = snapshot::import(&*handle, &snapshot).await;
    assert!(!report.is_complete());
    assert_eq!(report.written, vec!["a/one.txt", "three.txt"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a/b/two.txt");

    let files = handle.files().await;
    assert_eq!(files.len(), 2);
    assert_eq!(files["a/one.txt"], b"one");
    assert_eq!(files["three.txt"], b"three");
}

#[tokio::test]
async fn test_import_continues_past_write_failures() {
    let (runtime, handle) = booted().await;
    runtime.fail_writes_under("locked/");
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        files: vec![file("locked/x.txt", b"x"), file("open/y.txt", b"y")],
    };

    let report = snapshot::import(&*handle, &snapshot).await;
    assert_eq!(report.directories_created, 2);
    assert_eq!(report.written, vec!["open/y.txt"]);
    assert_eq!(report.failed[0].0, "locked/x.txt");
}

#[tokio::test]
async fn test_stale_version_is_treated_as_absent() {
    let store = MemorySnapshotStore::new();
    store
        .insert_raw(
            "old",
            Snapshot {
                version: SNAPSHOT_VERSION + 1,
                saved_at: Utc::now(),
                files: vec![file("legacy.txt", b"legacy")],
            },
        )
        .await;
    assert!(snapshot::load_persisted(&store, "old").await.is_none());
    assert!(snapshot::load_persisted(&store, "missing").await.is_none());

    let runtime = Arc::new(MemoryRuntime::new());
    let pool = PoolManager::new(
        PoolConfig::default(),
        runtime.clone(),
        Arc::new(store),
    );
    pool.create_or_get(app("old")).await.unwrap();
    assert!(runtime.last_handle().await.unwrap().files().await.is_empty());
}

#[tokio::test]
async fn test_fs_store_survives_restart() {
    common::init_tracing();
    let dir = tempdir().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());

    {
        let store = Arc::new(FsSnapshotStore::new(dir.path()).await.unwrap());
        let pool = PoolManager::new(PoolConfig::default(), runtime.clone(), store);
        pool.create_or_get(app("notes")).await.unwrap();
        let handle = runtime.last_handle().await.unwrap();
        handle.seed("notes/today.md", b"# Today").await.unwrap();
        pool.suspend("notes").await.unwrap();
        pool.shutdown().await;
    }

    let store = Arc::new(FsSnapshotStore::new(dir.path()).await.unwrap());
    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].app_id, "notes");
    assert_eq!(listed[0].display_name, "App notes");
    assert_eq!(listed[0].file_count, 1);

    let pool = PoolManager::new(PoolConfig::default(), runtime.clone(), store);
    pool.create_or_get(app("notes")).await.unwrap();
    let files = runtime.last_handle().await.unwrap().files().await;
    assert_eq!(files["notes/today.md"], b"# Today");
    assert_eq!(pool.list_snapshots().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_content_hash_tracks_changes() {
    let (_runtime, handle) = booted().await;
    handle.seed("a.txt", b"one").await.unwrap();
    let limits = ExportLimits::default();

    let first = snapshot::export(&*handle, &limits).await.unwrap();
    let again = snapshot::export(&*handle, &limits).await.unwrap();
    assert_eq!(snapshot::content_hash(&first), snapshot::content_hash(&again));

    handle.seed("a.txt", b"two").await.unwrap();
    let changed = snapshot::export(&*handle, &limits).await.unwrap();
    assert_ne!(snapshot::content_hash(&first), snapshot::content_hash(&changed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosave_coalesces_bursts() {
    let store = Arc::new(CountingStore::default());
    let saver = Arc::new(AutoSaver::new(
        store.clone(),
        ExportLimits::default(),
        Duration::from_millis(100),
    ));
    let (_runtime, handle) = booted().await;
    handle.seed("draft.txt", b"v1").await.unwrap();

    for _ in 0..10 {
        saver.enqueue("draft", handle.clone(), "Draft");
    }
    assert_eq!(saver.pending_count(), 1);
    assert!(saver.is_pending("draft"));

    let done = {
        let saver = Arc::clone(&saver);
        wait_until(Duration::from_secs(2), move || {
            let saver = Arc::clone(&saver);
            async move { saver.pending_count() == 0 }
        })
        .await
    };
    assert!(done);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.puts(), 1);
    assert!(store.get("draft").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosave_cancel() {
    let store = Arc::new(CountingStore::default());
    let saver = Arc::new(AutoSaver::new(
        store.clone(),
        ExportLimits::default(),
        Duration::from_millis(100),
    ));
    let (_runtime, handle) = booted().await;

    saver.enqueue("draft", handle, "Draft");
    saver.cancel("draft").await;
    assert!(!saver.is_pending("draft"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.puts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosave_cancel_waits_for_write_in_flight() {
    let store = Arc::new(CountingStore::default());
    let saver = Arc::new(AutoSaver::new(
        store.clone(),
        ExportLimits::default(),
        Duration::from_millis(20),
    ));
    let (_runtime, handle) = booted().await;
    handle.seed("draft.txt", b"v1").await.unwrap();
    store.delay_next_put(Duration::from_millis(300));

    saver.enqueue("draft", handle, "Draft");
    let writing = {
        let store = Arc::clone(&store);
        wait_until(Duration::from_secs(2), move || {
            let store = Arc::clone(&store);
            async move { store.puts() > 0 }
        })
        .await
    };
    assert!(writing);
    assert!(saver.is_pending("draft"));

    saver.cancel("draft").await;
    assert!(!saver.is_pending("draft"));
    assert!(store.get("draft").await.unwrap().is_some());
}
