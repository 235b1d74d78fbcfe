//! Recording session lifecycle.
//!
//! At most one session records at a time. The manager owns the persisted
//! scalar keys (`enabled`, `session_id`, `session_name`, `log_count`,
//! `last_session_id`) and each session's `session:<id>` metadata record.
//! Other components refer to sessions only by id; the log store follows the
//! active id through [`SessionManager::subscribe`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::kv::{KvStore, keys};

const MAX_SLUG_LEN: usize = 48;
const FALLBACK_SLUG: &str = "session";

/// Persisted metadata of one recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub observed_url: Option<String>,
    /// Final entry count, written when the session stops
    #[serde(default)]
    pub log_count: u64,
}

impl SessionMeta {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// In-memory view of the recording state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub enabled: bool,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub log_count: u64,
    pub last_session_id: Option<String>,
}

/// Owns session state and its persistence
pub struct SessionManager {
    kv: Arc<dyn KvStore>,
    state: Mutex<SessionStatus>,
    /// Serializes transitions and counter writes across awaits
    transition: tokio::sync::Mutex<()>,
    current: watch::Sender<Option<String>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("status", &self.status())
            .finish()
    }
}

impl SessionManager {
    /// Load persisted state. A stored `enabled` flag without a session id is
    /// treated as disabled.
    pub async fn rehydrate(kv: Arc<dyn KvStore>) -> Result<Self> {
        let session_id = string_key(kv.as_ref(), keys::SESSION_ID).await?;
        let enabled = kv
            .get(keys::ENABLED)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            && session_id.is_some();
        let status = SessionStatus {
            enabled,
            session_id: if enabled { session_id } else { None },
            session_name: if enabled {
                string_key(kv.as_ref(), keys::SESSION_NAME).await?
            } else {
                None
            },
            log_count: kv
                .get(keys::LOG_COUNT)
                .await?
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            last_session_id: string_key(kv.as_ref(), keys::LAST_SESSION_ID).await?,
        };

        debug!(
            enabled = status.enabled,
            session_id = ?status.session_id,
            log_count = status.log_count,
            "Rehydrated session state"
        );

        let (current, _) = watch::channel(status.session_id.clone());
        Ok(Self {
            kv,
            state: Mutex::new(status),
            transition: tokio::sync::Mutex::new(()),
            current,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionStatus> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot of the in-memory state
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lock_state().clone()
    }

    /// Active session id
    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Follow the active session id
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    /// Start recording, stopping any active session first.
    ///
    /// `observed_url` is kept only when it is an http(s) URL.
    pub async fn start(&self, name: Option<&str>, observed_url: Option<&str>) -> Result<String> {
        let _guard = self.transition.lock().await;

        if self.lock_state().enabled {
            self.stop_locked().await?;
        }

        let started = Utc::now();
        let stamp = next_stamp(started);
        let session_name = name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        let session_id = format!(
            "{}-{}",
            slugify(session_name.as_deref()),
            stamp.format("%Y%m%dT%H%M%S%3f")
        );
        let meta = SessionMeta {
            session_id: session_id.clone(),
            session_name: session_name.clone(),
            started_at: rfc3339(started),
            ended_at: None,
            observed_url: observed_url.filter(|u| is_http_url(u)).map(str::to_string),
            log_count: 0,
        };

        self.kv
            .set_many(vec![
                (keys::ENABLED.to_string(), json!(true)),
                (keys::SESSION_ID.to_string(), json!(session_id)),
                (keys::SESSION_NAME.to_string(), json!(session_name)),
                (keys::LOG_COUNT.to_string(), json!(0)),
                (keys::session_meta(&session_id), serde_json::to_value(&meta)?),
            ])
            .await?;

        {
            let mut state = self.lock_state();
            state.enabled = true;
            state.session_id = Some(session_id.clone());
            state.session_name = session_name;
            state.log_count = 0;
        }
        self.current.send_replace(Some(session_id.clone()));

        info!(session_id = %session_id, observed_url = ?meta.observed_url, "Recording session started");
        Ok(session_id)
    }

    /// Stop the active session; no-op when nothing is recording.
    pub async fn stop(&self) -> Result<Option<SessionMeta>> {
        let _guard = self.transition.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<Option<SessionMeta>> {
        let (session_id, session_name, log_count) = {
            let state = self.lock_state();
            match (&state.session_id, state.enabled) {
                (Some(id), true) => (id.clone(), state.session_name.clone(), state.log_count),
                _ => return Ok(None),
            }
        };

        let meta_key = keys::session_meta(&session_id);
        let mut meta = match self.kv.get(&meta_key).await? {
            Some(value) => serde_json::from_value::<SessionMeta>(value)?,
            None => SessionMeta {
                session_id: session_id.clone(),
                session_name,
                started_at: String::new(),
                ended_at: None,
                observed_url: None,
                log_count: 0,
            },
        };
        meta.ended_at = Some(rfc3339(Utc::now()));
        meta.log_count = log_count;

        self.kv
            .set_many(vec![
                (keys::ENABLED.to_string(), json!(false)),
                (keys::SESSION_ID.to_string(), Value::Null),
                (keys::SESSION_NAME.to_string(), Value::Null),
                (keys::LAST_SESSION_ID.to_string(), json!(session_id)),
                (meta_key, serde_json::to_value(&meta)?),
            ])
            .await?;

        {
            let mut state = self.lock_state();
            state.enabled = false;
            state.session_id = None;
            state.session_name = None;
            state.last_session_id = Some(session_id.clone());
        }
        self.current.send_replace(None);

        info!(session_id = %session_id, log_count, "Recording session stopped");
        Ok(Some(meta))
    }

    /// Count one ingested entry. Returns the new count, or `None` when not
    /// recording.
    pub async fn record_log(&self) -> Result<Option<u64>> {
        let _guard = self.transition.lock().await;
        let count = {
            let mut state = self.lock_state();
            if !state.enabled {
                return Ok(None);
            }
            state.log_count += 1;
            state.log_count
        };
        self.kv.set(keys::LOG_COUNT, json!(count)).await?;
        Ok(Some(count))
    }

    /// Session to export by default: the active one, else the last stopped.
    #[must_use]
    pub fn current_or_last(&self) -> Option<String> {
        let state = self.lock_state();
        state
            .session_id
            .clone()
            .or_else(|| state.last_session_id.clone())
    }
}

async fn string_key(kv: &dyn KvStore, key: &str) -> Result<Option<String>> {
    Ok(kv
        .get(key)
        .await?
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|s| !s.is_empty()))
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_http_url(candidate: &str) -> bool {
    url::Url::parse(candidate).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Sanitize a session name into an id prefix.
///
/// Lowercase ASCII alphanumerics are kept; every other run of characters
/// becomes one `-`. Falls back to `session`.
#[must_use]
pub fn slugify(name: Option<&str>) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in name.unwrap_or_default().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
            if slug.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        trimmed.to_string()
    }
}

static LAST_STAMP_MS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Millisecond stamp strictly greater than every stamp issued before in
/// this process.
fn next_stamp(now: DateTime<Utc>) -> DateTime<Utc> {
    let now_ms = now.timestamp_millis();
    let mut last = LAST_STAMP_MS.load(Ordering::Relaxed);
    loop {
        let candidate = now_ms.max(last.saturating_add(1));
        match LAST_STAMP_MS.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                return Utc
                    .timestamp_millis_opt(candidate)
                    .single()
                    .unwrap_or(now);
            }
            Err(actual) => last = actual,
        }
    }
}
