//! Per-tab snapshot cache.
//!
//! Consent state, storage maps, iQ profile data and `utag` objects are opaque
//! JSON produced by the page side. The latest snapshot of each kind is kept
//! per tab under `tabSnapshot:<kind>:<tab-key>` so exports work after the tab
//! has navigated away or closed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::kv::{KvStore, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Consent,
    Storage,
    Iq,
    Utag,
}

impl SnapshotKind {
    pub const ALL: [Self; 4] = [Self::Consent, Self::Storage, Self::Iq, Self::Utag];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consent => "consent",
            Self::Storage => "storage",
            Self::Iq => "iq",
            Self::Utag => "utag",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown snapshot kind: {s}. Expected one of: consent, storage, iq, utag"))
    }
}

/// One cached snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub kind: SnapshotKind,
    pub tab_key: String,
    #[serde(default)]
    pub url: Option<String>,
    pub captured_at: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct SnapshotCache {
    kv: Arc<dyn KvStore>,
}

impl fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCache").finish_non_exhaustive()
    }
}

impl SnapshotCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Store the latest snapshot of `kind` for a tab, replacing the previous one.
    pub async fn record(
        &self,
        kind: SnapshotKind,
        tab_key: &str,
        url: Option<&str>,
        data: Value,
    ) -> Result<SnapshotRecord> {
        let record = SnapshotRecord {
            kind,
            tab_key: tab_key.to_string(),
            url: url.map(str::to_string),
            captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        };
        self.kv
            .set(&keys::snapshot(kind.as_str(), tab_key), serde_json::to_value(&record)?)
            .await?;
        debug!(kind = %kind, tab_key, "Cached tab snapshot");
        Ok(record)
    }

    pub async fn get(&self, kind: SnapshotKind, tab_key: &str) -> Result<Option<SnapshotRecord>> {
        match self.kv.get(&keys::snapshot(kind.as_str(), tab_key)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Most recently captured snapshot of `kind` across all tabs
    pub async fn latest(&self, kind: SnapshotKind) -> Result<Option<SnapshotRecord>> {
        let prefix = format!("{}{}:", keys::SNAPSHOT_PREFIX, kind.as_str());
        let mut latest: Option<SnapshotRecord> = None;
        for key in self.kv.keys_with_prefix(&prefix).await? {
            let Some(value) = self.kv.get(&key).await? else {
                continue;
            };
            let record = match serde_json::from_value::<SnapshotRecord>(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable snapshot");
                    continue;
                }
            };
            let newer = latest
                .as_ref()
                .is_none_or(|current| record.captured_at > current.captured_at);
            if newer {
                latest = Some(record);
            }
        }
        Ok(latest)
    }
}
