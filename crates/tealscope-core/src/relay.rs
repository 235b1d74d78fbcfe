//! Background message relay.
//!
//! [`Relay`] is the engine's single entry point: it takes decoded
//! [`Message`]s from pages and extension UIs and wires the session manager,
//! reorder buffer, log store, snapshot cache and collector together. Every
//! handler resolves to a [`Reply`]; errors become `{ok: false, error}`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::browser::{Browser, TabInfo};
use crate::casefile::{ExportOptions, build_case_file};
use crate::config::Config;
use crate::dispatch::{CollectorClient, CollectorPayload};
use crate::entry::{DbIndexTracker, LogEntry, StructuredEntry};
use crate::error::{BrowserError, Result};
use crate::kv::{KvStore, keys};
use crate::log_store::{LogStore, QuotaPolicy};
use crate::protocol::{Message, MessageSender, Reply, TabRequest};
use crate::reorder::{LogSink, ReorderBuffer, StreamKey, SubmitOutcome};
use crate::session::SessionManager;
use crate::snapshots::{SnapshotCache, SnapshotKind};

pub const SENDING_DISABLED: &str = "Sending is disabled";
pub const SEND_FAILED: &str = "Failed to send payload after retries";

/// Stamps `db_generation` in stream order, then hands entries to the store.
///
/// Generations are assigned after reordering so an out-of-order arrival is
/// not mistaken for a page log reset.
pub struct StampingSink {
    store: LogStore,
    trackers: Mutex<HashMap<StreamKey, DbIndexTracker>>,
}

impl StampingSink {
    #[must_use]
    pub fn new(store: LogStore) -> Self {
        Self {
            store,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the trackers of every stream of a session.
    pub fn forget_session(&self, session_id: &str) {
        lock(&self.trackers).retain(|key, _| key.session_id != session_id);
    }
}

impl LogSink for StampingSink {
    fn deliver(&self, key: &StreamKey, mut entry: LogEntry) {
        lock(&self.trackers)
            .entry(key.clone())
            .or_default()
            .stamp(&mut entry);
        self.store.deliver(key, entry);
    }
}

pub struct Relay {
    config: Config,
    sessions: Arc<SessionManager>,
    store: LogStore,
    reorder: ReorderBuffer<StampingSink>,
    collector: CollectorClient,
    snapshots: SnapshotCache,
    browser: Arc<dyn Browser>,
    /// Fire-and-forget collector deliveries
    deliveries: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("sessions", &self.sessions)
            .field("store", &self.store)
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Relay {
    /// Rehydrate session state from `kv` and wire the components.
    pub async fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        browser: Arc<dyn Browser>,
        collector: CollectorClient,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionManager::rehydrate(Arc::clone(&kv)).await?);
        let store = LogStore::new(
            Arc::clone(&kv),
            QuotaPolicy::from(&config.store),
            sessions.subscribe(),
        );
        let reorder = ReorderBuffer::new(
            StampingSink::new(store.clone()),
            config.reorder.gap_timeout(),
        );
        Ok(Self {
            sessions,
            store,
            reorder,
            collector,
            snapshots: SnapshotCache::new(kv),
            browser,
            deliveries: Mutex::new(JoinSet::new()),
            config,
        })
    }

    /// Like [`Relay::new`] with an HTTP collector client built from config.
    pub async fn from_config(
        config: Config,
        kv: Arc<dyn KvStore>,
        browser: Arc<dyn Browser>,
    ) -> Result<Self> {
        let collector = CollectorClient::from_config(&config.collector)?;
        Self::new(config, kv, browser, collector).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn reorder(&self) -> &ReorderBuffer<StampingSink> {
        &self.reorder
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub fn collector(&self) -> &CollectorClient {
        &self.collector
    }

    /// Decode a raw message and handle it.
    pub async fn handle_value(&self, raw: &Value, sender: &MessageSender) -> Reply {
        match Message::decode(raw) {
            Ok(message) => self.handle(message, sender).await,
            Err(e) => {
                debug!(error = %e, "Rejecting undecodable message");
                Reply::failure(e.to_string())
            }
        }
    }

    pub async fn handle(&self, message: Message, sender: &MessageSender) -> Reply {
        let kind = message.kind();
        debug!(kind, tab_id = ?sender.tab_id, "Handling message");

        let result = match message {
            Message::GetEnabled => Ok(Reply::ok().with("enabled", self.sessions.status().enabled)),
            Message::SetEnabled {
                enabled,
                session_name,
            } => self.set_enabled(enabled, session_name.as_deref()).await,
            Message::ContentReady { url } => {
                debug!(url = ?url.as_deref().or(sender.url.as_deref()), "Content script ready");
                Ok(Reply::ok().with("enabled", self.sessions.status().enabled))
            }
            Message::ConsoleLog { payload } => self.console_log(payload, sender).await,
            Message::BridgeStatus { payload } => Ok(self.bridge_status(payload, sender)),
            Message::SendUtag => self.send_utag().await,
            Message::GetStorageMap => {
                self.tab_snapshot(SnapshotKind::Storage, TabRequest::GetStorageMap)
                    .await
            }
            Message::GetConsentStatus => {
                self.tab_snapshot(SnapshotKind::Consent, TabRequest::GetConsentStatus)
                    .await
            }
            Message::GetIqProfile => {
                self.tab_snapshot(SnapshotKind::Iq, TabRequest::GetIqProfile)
                    .await
            }
            Message::GetSessionStatus => self.session_status().await,
            Message::ExportCaseFile { options } => self.export_case_file(&options).await,
        };

        result.unwrap_or_else(|e| {
            warn!(kind, error = %e, "Message handler failed");
            Reply::failure(e.to_string())
        })
    }

    /// Flush every buffered entry and wait for pending writes and deliveries.
    pub async fn shutdown(&self) {
        let flushed = self.reorder.flush_all();
        let mut deliveries = std::mem::take(&mut *lock(&self.deliveries));
        while deliveries.join_next().await.is_some() {}
        self.store.drain().await;
        debug!(flushed, "Relay shut down");
    }

    // =========================================================================
    // Session transitions
    // =========================================================================

    async fn set_enabled(&self, enabled: bool, session_name: Option<&str>) -> Result<Reply> {
        if let Some(previous) = self.sessions.current() {
            self.retire_streams(&previous);
        }

        let reply = if enabled {
            let tab = self.browser.active_tab().await;
            let session_id = self
                .sessions
                .start(session_name, tab.as_ref().map(|t| t.url.as_str()))
                .await?;
            Reply::ok().with("enabled", true).with("session_id", session_id)
        } else {
            match self.sessions.stop().await? {
                Some(meta) => Reply::ok()
                    .with("enabled", false)
                    .with("session_id", meta.session_id)
                    .with("log_count", meta.log_count),
                None => Reply::ok().with("enabled", false),
            }
        };

        self.broadcast_recording_state(enabled).await;
        Ok(reply)
    }

    /// Release everything buffered for a session and drop its streams.
    fn retire_streams(&self, session_id: &str) {
        let flushed = self.reorder.flush_session(session_id);
        self.reorder.forget_session(session_id);
        self.reorder.sink().forget_session(session_id);
        if flushed > 0 {
            debug!(session_id, flushed, "Flushed buffered entries on session change");
        }
    }

    async fn broadcast_recording_state(&self, enabled: bool) {
        let Some(tab) = self.browser.active_tab().await else {
            return;
        };
        if !tab.is_supported() {
            return;
        }
        if let Err(e) = self
            .send_with_timeout(tab.id, &TabRequest::RecordingState { enabled })
            .await
        {
            debug!(tab_id = tab.id, error = %e, "Recording state not delivered");
        }
    }

    // =========================================================================
    // Log capture
    // =========================================================================

    async fn console_log(&self, payload: Value, sender: &MessageSender) -> Result<Reply> {
        let status = self.sessions.status();
        let session_id = status
            .session_id
            .filter(|_| status.enabled)
            .unwrap_or_else(|| keys::NO_SESSION.to_string());

        let entry = entry_from_payload(&payload, sender);
        let stream_url = entry
            .url()
            .map(str::to_string)
            .or_else(|| sender.url.clone())
            .unwrap_or_default();
        let key = StreamKey::new(session_id.clone(), stream_url.clone());

        let sequence = entry.sequence();
        let outcome = self.reorder.submit(key, entry);
        match outcome {
            SubmitOutcome::Stale | SubmitOutcome::Duplicate => {
                warn!(session_id = %session_id, stream_url = %stream_url, ?sequence, ?outcome, "Delivered entry out of band");
            }
            _ => debug!(session_id = %session_id, stream_url = %stream_url, ?sequence, ?outcome, "Submitted log entry"),
        }

        let log_count = if status.enabled {
            self.sessions.record_log().await?
        } else {
            None
        };

        let forwarded = status.enabled && self.config.collector.forward_console_logs;
        if forwarded {
            let body = if payload.is_null() { json!({}) } else { payload };
            self.spawn_delivery(CollectorPayload::console(&stream_url, body).to_value());
        }

        Ok(Reply::ok()
            .with("session_id", session_id)
            .with("log_count", log_count)
            .with("forwarded", forwarded))
    }

    fn bridge_status(&self, payload: Value, sender: &MessageSender) -> Reply {
        let forwarded =
            self.config.collector.forward_bridge_status && self.sessions.status().enabled;
        if forwarded {
            let url = sender.url.clone().unwrap_or_default();
            let body = if payload.is_null() { json!({}) } else { payload };
            self.spawn_delivery(CollectorPayload::status(&url, body).to_value());
        }
        Reply::ok().with("forwarded", forwarded)
    }

    fn spawn_delivery(&self, payload: Value) {
        let collector = self.collector.clone();
        let mut deliveries = lock(&self.deliveries);
        while deliveries.try_join_next().is_some() {}
        deliveries.spawn(async move {
            collector.deliver(&payload).await;
        });
    }

    // =========================================================================
    // Tab requests
    // =========================================================================

    async fn send_with_timeout(
        &self,
        tab_id: u64,
        request: &TabRequest,
    ) -> std::result::Result<Value, BrowserError> {
        let timeout = self.config.snapshots.request_timeout();
        tokio::time::timeout(timeout, self.browser.send_to_tab(tab_id, request))
            .await
            .unwrap_or(Err(BrowserError::Timeout(
                self.config.snapshots.request_timeout_ms,
            )))
    }

    /// Send a request, injecting the content script once if nothing listens.
    async fn request_from_tab(
        &self,
        tab: &TabInfo,
        request: &TabRequest,
    ) -> std::result::Result<Value, BrowserError> {
        match self.send_with_timeout(tab.id, request).await {
            Err(BrowserError::ReceivingEndMissing) => {
                debug!(tab_id = tab.id, "No content script; injecting");
                self.browser.inject_content_script(tab.id).await?;
                self.send_with_timeout(tab.id, request).await
            }
            other => other,
        }
    }

    async fn supported_tab(&self) -> std::result::Result<TabInfo, BrowserError> {
        let tab = self
            .browser
            .active_tab()
            .await
            .ok_or(BrowserError::NoActiveTab)?;
        if tab.is_supported() {
            Ok(tab)
        } else {
            Err(BrowserError::UnsupportedUrl(tab.url))
        }
    }

    async fn send_utag(&self) -> Result<Reply> {
        if !self.sessions.status().enabled {
            return Ok(Reply::failure(SENDING_DISABLED));
        }
        let tab = match self.supported_tab().await {
            Ok(tab) => tab,
            Err(e) => return Ok(Reply::failure(e.to_string())),
        };
        let response = match self.request_from_tab(&tab, &TabRequest::GetUtag).await {
            Ok(response) => response,
            Err(e) => return Ok(Reply::failure(e.to_string())),
        };

        let utag = response
            .get("utag")
            .filter(|u| !u.is_null())
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.snapshots
            .record(SnapshotKind::Utag, &tab.key(), Some(&tab.url), utag.clone())
            .await?;

        if self
            .collector
            .deliver(&CollectorPayload::utag(&tab.url, utag).to_value())
            .await
        {
            info!(tab_id = tab.id, endpoint = %self.collector.endpoint(), "Sent utag snapshot");
            Ok(Reply::ok())
        } else {
            Ok(Reply::failure(SEND_FAILED))
        }
    }

    /// Fetch a snapshot from the active tab, caching it. On failure the
    /// cached snapshot for that tab (or, without a tab, the latest of its
    /// kind) is returned alongside the error.
    async fn tab_snapshot(&self, kind: SnapshotKind, request: TabRequest) -> Result<Reply> {
        let tab = match self.supported_tab().await {
            Ok(tab) => tab,
            Err(e) => {
                let cached = self.snapshots.latest(kind).await?;
                return Ok(Reply::failure(e.to_string())
                    .with("snapshot", serde_json::to_value(cached)?)
                    .with("stale", true));
            }
        };

        match self.request_from_tab(&tab, &request).await {
            Ok(data) => {
                let record = self
                    .snapshots
                    .record(kind, &tab.key(), Some(&tab.url), data)
                    .await?;
                Ok(Reply::ok()
                    .with("snapshot", serde_json::to_value(record)?)
                    .with("stale", false))
            }
            Err(e) => {
                debug!(kind = %kind, tab_id = tab.id, error = %e, "Falling back to cached snapshot");
                let cached = self.snapshots.get(kind, &tab.key()).await?;
                Ok(Reply::failure(e.to_string())
                    .with("snapshot", serde_json::to_value(cached)?)
                    .with("stale", true))
            }
        }
    }

    // =========================================================================
    // Status and export
    // =========================================================================

    async fn session_status(&self) -> Result<Reply> {
        let status = self.sessions.status();
        let quota = self.store.quota();
        Ok(Reply::ok()
            .merge(serde_json::to_value(&status)?)
            .with("reorder", serde_json::to_value(self.reorder.stats())?)
            .with("usage_bytes", self.store.usage().await?)
            .with("quota_threshold_bytes", quota.threshold_bytes)
            .with("quota_target_bytes", quota.target_bytes))
    }

    async fn export_case_file(&self, options: &ExportOptions) -> Result<Reply> {
        self.store.drain().await;
        let case_file = build_case_file(
            &self.store,
            &self.snapshots,
            self.sessions.current_or_last(),
            options,
        )
        .await?;
        let name = case_file
            .utagdb_logger
            .as_ref()
            .and_then(|logger| logger.session_id.clone())
            .unwrap_or_else(|| keys::NO_SESSION.to_string());
        Ok(Reply::ok()
            .with("filename", format!("tealscope-case-{name}.json"))
            .with("case_file", case_file.to_value()))
    }
}

/// Build a log entry from a `console_log` payload.
///
/// Strings are legacy plain entries. Objects are structured records; a
/// missing url or timestamp is filled from the sender and the clock. Any
/// other payload is wrapped as the record's arguments.
fn entry_from_payload(payload: &Value, sender: &MessageSender) -> LogEntry {
    let mut record = match payload {
        Value::String(line) => return LogEntry::Plain(line.clone()),
        Value::Object(_) => serde_json::from_value::<StructuredEntry>(payload.clone())
            .unwrap_or_else(|e| {
                debug!(error = %e, "Console payload is not a structured entry; wrapping");
                StructuredEntry {
                    args: vec![payload.clone()],
                    ..StructuredEntry::default()
                }
            }),
        Value::Array(items) => StructuredEntry {
            args: items.clone(),
            ..StructuredEntry::default()
        },
        Value::Null => StructuredEntry::default(),
        other => StructuredEntry {
            args: vec![other.clone()],
            ..StructuredEntry::default()
        },
    };
    if record.url.is_empty() {
        record.url = sender.url.clone().unwrap_or_default();
    }
    if record.timestamp.is_empty() {
        record.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    }
    LogEntry::Structured(record)
}
