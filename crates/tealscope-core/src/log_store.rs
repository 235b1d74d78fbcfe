//! Per-session append-only log storage with quota eviction.
//!
//! Each session's logs live in one bucket, `sessionLog:<session_id>`, holding
//! a JSON array in delivery order. Buckets are only ever removed whole.
//!
//! # Architecture
//!
//! ```text
//! append(session, entry) ──► registry ──► writer task for that bucket
//!        (sync enqueue)        (mutex)        │ 1. ensure_under_quota
//!                                             │ 2. read array
//!                                             │ 3. push + write back
//!                                             ▼
//!                                          KvStore
//! ```
//!
//! - One writer task per bucket with queued work; jobs for a bucket apply in
//!   call order, different buckets proceed concurrently.
//! - A writer retires when it finds its queue empty while holding the
//!   registry lock. Enqueue takes the same lock, so a job either lands in a
//!   live queue or spawns a fresh writer.
//!
//! # Quota
//!
//! Before every write, if usage exceeds `threshold_bytes` the oldest
//! unprotected buckets (by session `started_at`, then `ended_at`) are removed
//! together with their metadata until usage is at most `target_bytes`. The
//! bucket being written, the current session and every bucket with a live
//! writer are protected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::entry::LogEntry;
use crate::error::{Error, Result, StoreError};
use crate::kv::{KvStore, keys};
use crate::reorder::{LogSink, StreamKey};
use crate::session::SessionMeta;

/// Eviction thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    /// Eviction starts once usage exceeds this
    pub threshold_bytes: u64,
    /// Eviction stops once usage is at or below this
    pub target_bytes: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for QuotaPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            threshold_bytes: config.quota_threshold_bytes,
            target_bytes: config.quota_target_bytes,
        }
    }
}

/// Result of one quota pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub usage_before: u64,
    pub usage_after: u64,
    /// Session ids whose buckets were removed, oldest first
    pub evicted: Vec<String>,
}

impl EvictionReport {
    #[must_use]
    pub fn any_evicted(&self) -> bool {
        !self.evicted.is_empty()
    }
}

enum WriterJob {
    Append {
        entry: LogEntry,
        done: oneshot::Sender<Result<()>>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Completion handle for an enqueued append
#[must_use = "dropping the ticket discards the write result"]
pub struct AppendTicket {
    session_id: String,
    rx: oneshot::Receiver<Result<()>>,
}

impl AppendTicket {
    /// Wait for the write to be applied.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .map_err(|_| Error::Store(StoreError::WriterGone(self.session_id)))?
    }
}

struct Inner {
    kv: Arc<dyn KvStore>,
    quota: QuotaPolicy,
    current: watch::Receiver<Option<String>>,
    /// Live writers keyed by session id
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<WriterJob>>>,
}

/// Session log store
///
/// Cheap to clone; clones share the writer registry. Appending spawns tokio
/// tasks and must happen inside a runtime.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("quota", &self.inner.quota)
            .field("active_writers", &self.active_writers())
            .finish()
    }
}

fn lock_writers(
    writers: &Mutex<HashMap<String, mpsc::UnboundedSender<WriterJob>>>,
) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<WriterJob>>> {
    // A panicking writer cannot leave the map half-updated.
    writers
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl LogStore {
    /// `current` tracks the active session id (see `SessionManager::subscribe`).
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        quota: QuotaPolicy,
        current: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kv,
                quota,
                current,
                writers: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.inner.kv
    }

    #[must_use]
    pub fn quota(&self) -> QuotaPolicy {
        self.inner.quota
    }

    /// Number of buckets with a live writer task
    #[must_use]
    pub fn active_writers(&self) -> usize {
        lock_writers(&self.inner.writers).len()
    }

    /// Queue `entry` for `session_id`'s bucket.
    ///
    /// The job's position in the bucket is fixed when this returns.
    pub fn enqueue(&self, session_id: &str, entry: LogEntry) -> AppendTicket {
        let (done, rx) = oneshot::channel();
        let mut job = WriterJob::Append { entry, done };

        let mut writers = lock_writers(&self.inner.writers);
        if let Some(tx) = writers.get(session_id) {
            match tx.send(job) {
                Ok(()) => {
                    return AppendTicket {
                        session_id: session_id.to_string(),
                        rx,
                    };
                }
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, queue) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(job);
        writers.insert(session_id.to_string(), tx);
        drop(writers);

        debug!(session_id, "Spawning bucket writer");
        tokio::spawn(run_writer(
            Arc::clone(&self.inner),
            session_id.to_string(),
            queue,
        ));

        AppendTicket {
            session_id: session_id.to_string(),
            rx,
        }
    }

    /// Append `entry` to `session_id`'s bucket.
    ///
    /// The job is queued before the returned future is first polled.
    pub fn append(
        &self,
        session_id: &str,
        entry: LogEntry,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        self.enqueue(session_id, entry).wait()
    }

    /// Wait until every job queued so far has been applied.
    pub async fn drain(&self) {
        let barriers: Vec<oneshot::Receiver<()>> = {
            let writers = lock_writers(&self.inner.writers);
            writers
                .values()
                .filter_map(|tx| {
                    let (btx, brx) = oneshot::channel();
                    tx.send(WriterJob::Barrier(btx)).ok().map(|()| brx)
                })
                .collect()
        };
        for barrier in barriers {
            // A closed barrier means the writer already finished its queue.
            let _ = barrier.await;
        }
    }

    /// Entries of a bucket in persisted order; empty when absent.
    pub async fn read_bucket(&self, session_id: &str) -> Result<Vec<LogEntry>> {
        let bucket = keys::session_log(session_id);
        let items = match self.inner.kv.get(&bucket).await? {
            Some(Value::Array(items)) => items,
            Some(_) => {
                warn!(bucket = %bucket, "Bucket is not an array; treating as empty");
                return Ok(Vec::new());
            }
            None => return Ok(Vec::new()),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<LogEntry>(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Skipping undecodable log entry");
                    None
                }
            })
            .collect())
    }

    /// Metadata of one session
    pub async fn read_session(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        match self.inner.kv.get(&keys::session_meta(session_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All sessions with metadata, oldest first
    pub async fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let mut sessions = Vec::new();
        for key in self.inner.kv.keys_with_prefix(keys::SESSION_META_PREFIX).await? {
            let Some(value) = self.inner.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_value::<SessionMeta>(value) {
                Ok(meta) => sessions.push(meta),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable session metadata"),
            }
        }
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    /// Current store usage in bytes
    pub async fn usage(&self) -> Result<u64> {
        self.inner.kv.bytes_in_use().await
    }

    /// Run a quota pass protecting `extra_protected`, the current session
    /// and every bucket with a live writer.
    pub async fn ensure_under_quota(&self, extra_protected: &[String]) -> Result<EvictionReport> {
        let protected = self.inner.protected_ids(extra_protected);
        self.inner.ensure_under_quota(&protected).await
    }
}

impl Inner {
    fn protected_ids(&self, extra: &[String]) -> Vec<String> {
        let mut protected: Vec<String> = extra.to_vec();
        if let Some(current) = self.current.borrow().clone() {
            protected.push(current);
        }
        protected.extend(lock_writers(&self.writers).keys().cloned());
        protected
    }

    async fn ensure_under_quota(&self, protected: &[String]) -> Result<EvictionReport> {
        let usage_before = self.kv.bytes_in_use().await?;
        let mut report = EvictionReport {
            usage_before,
            usage_after: usage_before,
            evicted: Vec::new(),
        };
        if usage_before <= self.quota.threshold_bytes {
            return Ok(report);
        }

        let mut candidates = Vec::new();
        for key in self.kv.keys_with_prefix(keys::SESSION_LOG_PREFIX).await? {
            let Some(session_id) = keys::session_id_of_log_key(&key) else {
                continue;
            };
            if protected.iter().any(|p| p == session_id) {
                continue;
            }
            let age_key = self.age_key(session_id).await;
            candidates.push((age_key, session_id.to_string()));
        }
        candidates.sort();

        debug!(
            usage = usage_before,
            threshold = self.quota.threshold_bytes,
            candidates = candidates.len(),
            "Storage over quota; evicting oldest sessions"
        );

        let mut usage = usage_before;
        for (_, session_id) in candidates {
            if usage <= self.quota.target_bytes {
                break;
            }
            self.kv
                .remove(&[keys::session_log(&session_id), keys::session_meta(&session_id)])
                .await?;
            usage = self.kv.bytes_in_use().await?;
            debug!(session_id = %session_id, usage, "Evicted session bucket");
            report.evicted.push(session_id);
        }
        report.usage_after = usage;

        if report.any_evicted() {
            info!(
                evicted = report.evicted.len(),
                usage_before = report.usage_before,
                usage_after = report.usage_after,
                "Evicted old sessions to stay under storage quota"
            );
        }
        if usage > self.quota.target_bytes {
            warn!(
                usage,
                target = self.quota.target_bytes,
                "Storage still over target; nothing left to evict"
            );
        }
        Ok(report)
    }

    /// `started_at`, else `ended_at`, else empty. Unreadable metadata sorts
    /// oldest.
    async fn age_key(&self, session_id: &str) -> String {
        let meta = match self.kv.get(&keys::session_meta(session_id)).await {
            Ok(Some(meta)) => meta,
            _ => return String::new(),
        };
        ["started_at", "ended_at"]
            .iter()
            .find_map(|field| {
                meta.get(*field)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    async fn write_one(&self, session_id: &str, entry: LogEntry) -> Result<()> {
        let protected = self.protected_ids(&[session_id.to_string()]);
        self.ensure_under_quota(&protected).await?;

        let bucket = keys::session_log(session_id);
        let mut items = match self.kv.get(&bucket).await? {
            Some(Value::Array(items)) => items,
            Some(_) => {
                warn!(bucket = %bucket, "Bucket is not an array; starting a new one");
                Vec::new()
            }
            None => Vec::new(),
        };
        items.push(serde_json::to_value(&entry)?);
        self.kv.set(&bucket, Value::Array(items)).await
    }

    /// Next queued job, or `None` after deregistering this writer.
    fn next_job_or_retire(
        &self,
        session_id: &str,
        queue: &mut mpsc::UnboundedReceiver<WriterJob>,
    ) -> Option<WriterJob> {
        if let Ok(job) = queue.try_recv() {
            return Some(job);
        }
        let mut writers = lock_writers(&self.writers);
        match queue.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                writers.remove(session_id);
                None
            }
        }
    }
}

async fn run_writer(
    inner: Arc<Inner>,
    session_id: String,
    mut queue: mpsc::UnboundedReceiver<WriterJob>,
) {
    while let Some(job) = inner.next_job_or_retire(&session_id, &mut queue) {
        match job {
            WriterJob::Append { entry, done } => {
                let result = inner.write_one(&session_id, entry).await;
                if let Err(e) = &result {
                    warn!(
                        session_id = %session_id,
                        bucket = %keys::session_log(&session_id),
                        error = %e,
                        "Failed to append log entry"
                    );
                }
                let _ = done.send(result);
            }
            WriterJob::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(session_id = %session_id, "Bucket writer retired");
}

impl LogSink for LogStore {
    fn deliver(&self, key: &StreamKey, entry: LogEntry) {
        // Failures are logged by the writer.
        drop(self.enqueue(&key.session_id, entry));
    }
}
