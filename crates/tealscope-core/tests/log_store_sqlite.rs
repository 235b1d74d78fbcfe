//! Log store, session manager and snapshot cache over SQLite.

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{PAGE_URL, seq_entry};
use tealscope_core::entry::LogEntry;
use tealscope_core::kv::{KvStore, SqliteKvStore, keys};
use tealscope_core::log_store::{LogStore, QuotaPolicy};
use tealscope_core::session::SessionManager;
use tealscope_core::snapshots::{SnapshotCache, SnapshotKind};

fn open(dir: &TempDir) -> Arc<dyn KvStore> {
    Arc::new(SqliteKvStore::open(dir.path().join("data").join("tealscope.db")).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_survive_reopen_in_order() {
    let dir = TempDir::new().unwrap();
    let kv = open(&dir);
    let sessions = SessionManager::rehydrate(Arc::clone(&kv)).await.unwrap();
    let store = LogStore::new(Arc::clone(&kv), QuotaPolicy::default(), sessions.subscribe());

    let tickets: Vec<_> = (0..50)
        .map(|i| store.append("sqlite-a", seq_entry(PAGE_URL, i)))
        .chain((0..50).map(|i| store.append("sqlite-b", seq_entry(PAGE_URL, i))))
        .collect();
    for result in futures_join(tickets).await {
        result.unwrap();
    }

    drop(store);
    let reopened = LogStore::new(open(&dir), QuotaPolicy::default(), sessions.subscribe());
    for bucket in ["sqlite-a", "sqlite-b"] {
        let sequences: Vec<u64> = reopened
            .read_bucket(bucket)
            .await
            .unwrap()
            .iter()
            .filter_map(LogEntry::sequence)
            .collect();
        assert_eq!(sequences, (0..50).collect::<Vec<_>>(), "bucket {bucket}");
    }
}

async fn futures_join<F>(futures: Vec<F>) -> Vec<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}

#[tokio::test]
async fn session_state_rehydrates_from_disk() {
    let dir = TempDir::new().unwrap();
    let id = {
        let sessions = SessionManager::rehydrate(open(&dir)).await.unwrap();
        let id = sessions.start(Some("Disk"), Some(PAGE_URL)).await.unwrap();
        sessions.record_log().await.unwrap();
        id
    };

    let sessions = SessionManager::rehydrate(open(&dir)).await.unwrap();
    let status = sessions.status();
    assert!(status.enabled);
    assert_eq!(status.session_id.as_deref(), Some(id.as_str()));
    assert_eq!(status.log_count, 1);

    let meta = sessions.stop().await.unwrap().unwrap();
    assert_eq!(meta.observed_url.as_deref(), Some(PAGE_URL));

    let store = LogStore::new(open(&dir), QuotaPolicy::default(), sessions.subscribe());
    let listed = store.list_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].log_count, 1);
    assert!(listed[0].ended_at.is_some());
}

#[tokio::test]
async fn sqlite_eviction_spares_the_current_session() {
    let dir = TempDir::new().unwrap();
    let kv = open(&dir);
    let sessions = SessionManager::rehydrate(Arc::clone(&kv)).await.unwrap();

    let mut finished = Vec::new();
    for name in ["one", "two", "three"] {
        let id = sessions.start(Some(name), None).await.unwrap();
        kv.set(&keys::session_log(&id), json!(["y".repeat(4_000)]))
            .await
            .unwrap();
        finished.push(id);
    }
    // the third session is still recording
    let current = finished.pop().unwrap();
    let usage = kv.bytes_in_use().await.unwrap();

    let store = LogStore::new(
        Arc::clone(&kv),
        QuotaPolicy {
            threshold_bytes: usage - 1,
            target_bytes: usage - 3_000,
        },
        sessions.subscribe(),
    );
    let report = store.ensure_under_quota(&[]).await.unwrap();
    assert_eq!(report.evicted, vec![finished[0].clone()]);
    assert!(report.usage_after <= usage - 3_000);
    assert!(store.read_session(&finished[0]).await.unwrap().is_none());
    assert_eq!(store.read_bucket(&current).await.unwrap().len(), 1);
    assert_eq!(store.read_bucket(&finished[1]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn snapshots_persist_per_tab() {
    let dir = TempDir::new().unwrap();
    let cache = SnapshotCache::new(open(&dir));
    cache
        .record(SnapshotKind::Storage, "tab-3", Some(PAGE_URL), json!({"local": {"k": "v"}}))
        .await
        .unwrap();

    let reopened = SnapshotCache::new(open(&dir));
    let record = reopened
        .get(SnapshotKind::Storage, "tab-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.data, json!({"local": {"k": "v"}}));
    assert_eq!(record.url.as_deref(), Some(PAGE_URL));
    assert!(reopened.get(SnapshotKind::Consent, "tab-3").await.unwrap().is_none());
}
