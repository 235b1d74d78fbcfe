//! Case-file export.
//!
//! A case file is a single JSON document a support engineer can attach to a
//! ticket: the session's log timeline plus the latest consent and iQ
//! snapshots. Sections are independently selectable; an excluded section is
//! omitted, an included section with no data is `null` (or, for the logger,
//! an empty timeline).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entry::LogEntry;
use crate::error::Result;
use crate::log_store::LogStore;
use crate::redact::{redact_consent_signals, redact_url, redact_urls_in, redact_value};
use crate::session::SessionMeta;
use crate::snapshots::{SnapshotCache, SnapshotKind, SnapshotRecord};

/// What to put in the case file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    #[serde(alias = "includeLogger")]
    pub include_logger: bool,
    #[serde(alias = "includeConsent")]
    pub include_consent: bool,
    #[serde(alias = "includeIq")]
    pub include_iq: bool,
    pub redact: bool,
    /// Session to export; defaults to the current, else the last session
    #[serde(alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_logger: true,
            include_consent: true,
            include_iq: true,
            redact: false,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: "tealscope".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The `utagdb_logger` section
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoggerSection {
    pub session: Option<SessionMeta>,
    pub session_id: Option<String>,
    pub entry_count: usize,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseFile {
    pub generated_at: String,
    pub app: AppInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utagdb_logger: Option<LoggerSection>,
    #[serde(default, deserialize_with = "included", skip_serializing_if = "Option::is_none")]
    pub consent_monitor: Option<Option<SnapshotRecord>>,
    #[serde(default, deserialize_with = "included", skip_serializing_if = "Option::is_none")]
    pub iq_profile: Option<Option<SnapshotRecord>>,
}

/// A present key is an included section, even when its value is `null`.
fn included<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Assemble a case file.
///
/// `default_session` is used when `options.session_id` is unset. A missing
/// session yields an empty logger section, never an error.
pub async fn build_case_file(
    store: &LogStore,
    snapshots: &SnapshotCache,
    default_session: Option<String>,
    options: &ExportOptions,
) -> Result<CaseFile> {
    let utagdb_logger = if options.include_logger {
        let session_id = options.session_id.clone().or(default_session);
        Some(match session_id {
            Some(id) => {
                let entries = store.read_bucket(&id).await?;
                LoggerSection {
                    session: store.read_session(&id).await?,
                    session_id: Some(id),
                    entry_count: entries.len(),
                    entries,
                }
            }
            None => LoggerSection::default(),
        })
    } else {
        None
    };

    let consent_monitor = if options.include_consent {
        Some(snapshots.latest(SnapshotKind::Consent).await?)
    } else {
        None
    };
    let iq_profile = if options.include_iq {
        Some(snapshots.latest(SnapshotKind::Iq).await?)
    } else {
        None
    };

    let mut case_file = CaseFile {
        generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        app: AppInfo::default(),
        utagdb_logger,
        consent_monitor,
        iq_profile,
    };
    if options.redact {
        case_file.redact();
    }

    debug!(
        session_id = ?case_file.utagdb_logger.as_ref().and_then(|l| l.session_id.as_deref()),
        entries = case_file.utagdb_logger.as_ref().map_or(0, |l| l.entry_count),
        redacted = options.redact,
        "Built case file"
    );
    Ok(case_file)
}

fn redact_entry(entry: &mut LogEntry) {
    match entry {
        LogEntry::Plain(line) => *line = redact_urls_in(line).into_owned(),
        LogEntry::Structured(record) => {
            record.url = redact_url(&record.url);
            record.args.iter_mut().for_each(redact_value);
        }
    }
}

fn redact_snapshot(record: &mut SnapshotRecord) {
    if let Some(url) = &mut record.url {
        *url = redact_url(url);
    }
    if record.kind == SnapshotKind::Consent {
        redact_consent_signals(&mut record.data);
    }
    redact_value(&mut record.data);
}

impl CaseFile {
    /// Strip URL queries/fragments and consent signal values in place.
    pub fn redact(&mut self) {
        if let Some(logger) = &mut self.utagdb_logger {
            if let Some(meta) = &mut logger.session {
                if let Some(url) = &mut meta.observed_url {
                    *url = redact_url(url);
                }
            }
            logger.entries.iter_mut().for_each(redact_entry);
        }
        for snapshot in [&mut self.consent_monitor, &mut self.iq_profile]
            .into_iter()
            .flatten()
            .flatten()
        {
            redact_snapshot(snapshot);
        }
    }

    /// Pretty JSON text
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKvStore};
    use crate::log_store::QuotaPolicy;
    use crate::session::SessionManager;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        sessions: SessionManager,
        store: LogStore,
        snapshots: SnapshotCache,
    }

    async fn fixture() -> Fixture {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let sessions = SessionManager::rehydrate(Arc::clone(&kv)).await.unwrap();
        let store = LogStore::new(Arc::clone(&kv), QuotaPolicy::default(), sessions.subscribe());
        Fixture {
            sessions,
            store,
            snapshots: SnapshotCache::new(kv),
        }
    }

    impl Fixture {
        async fn build(&self, options: &ExportOptions) -> CaseFile {
            build_case_file(&self.store, &self.snapshots, self.sessions.current_or_last(), options)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn no_session_yields_empty_logger_section() {
        let fx = fixture().await;
        let case_file = fx.build(&ExportOptions::default()).await;
        let value = case_file.to_value();
        assert_eq!(
            value["utagdb_logger"],
            json!({"session": null, "session_id": null, "entry_count": 0, "entries": []})
        );
        assert_eq!(value["consent_monitor"], Value::Null);
        assert!(value.as_object().unwrap().contains_key("consent_monitor"));
        assert_eq!(value["app"]["name"], "tealscope");
    }

    #[tokio::test]
    async fn exports_last_session_entries_in_order() {
        let fx = fixture().await;
        let id = fx.sessions.start(Some("cart"), Some("https://shop.example/")).await.unwrap();
        for i in 0..3 {
            fx.store.append(&id, LogEntry::Plain(format!("line {i}"))).await.unwrap();
        }
        fx.sessions.stop().await.unwrap();

        let case_file = fx.build(&ExportOptions::default()).await;
        let logger = case_file.utagdb_logger.unwrap();
        assert_eq!(logger.session_id.as_deref(), Some(id.as_str()));
        assert_eq!(logger.entry_count, 3);
        assert_eq!(logger.entries[2], LogEntry::Plain("line 2".into()));
        assert!(logger.session.unwrap().ended_at.is_some());
    }

    #[tokio::test]
    async fn excluded_sections_are_omitted() {
        let fx = fixture().await;
        let options = ExportOptions {
            include_logger: false,
            include_iq: false,
            ..ExportOptions::default()
        };
        let value = fx.build(&options).await.to_value();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["app", "consent_monitor", "generated_at"]);
    }

    #[tokio::test]
    async fn explicit_session_id_wins() {
        let fx = fixture().await;
        fx.store.append("other", LogEntry::Plain("x".into())).await.unwrap();
        let options = ExportOptions {
            session_id: Some("other".into()),
            ..ExportOptions::default()
        };
        let logger = fx.build(&options).await.utagdb_logger.unwrap();
        assert_eq!(logger.entry_count, 1);
        assert!(logger.session.is_none());
    }

    #[tokio::test]
    async fn redaction_covers_entries_session_and_snapshots() {
        let fx = fixture().await;
        let id = fx
            .sessions
            .start(None, Some("https://shop.example/?email=a@b.c"))
            .await
            .unwrap();
        fx.store
            .append(
                &id,
                LogEntry::structured(
                    "https://shop.example/p?id=9#top",
                    "t",
                    vec![json!("beacon https://collect.example/i?uid=1")],
                ),
            )
            .await
            .unwrap();
        fx.store
            .append(&id, LogEntry::Plain("GET https://x.example/?t=secret".into()))
            .await
            .unwrap();
        fx.snapshots
            .record(
                SnapshotKind::Consent,
                "tab-1",
                Some("https://shop.example/?q=1"),
                json!({"signals": [{"label": "OptanonConsent", "value": "groups=1"}]}),
            )
            .await
            .unwrap();

        let options = ExportOptions {
            redact: true,
            ..ExportOptions::default()
        };
        let text = fx.build(&options).await.to_pretty_json().unwrap();
        assert!(!text.contains("email=a@b.c"));
        assert!(!text.contains("id=9"));
        assert!(!text.contains("uid=1"));
        assert!(!text.contains("t=secret"));
        assert!(!text.contains("groups=1"));
        assert!(text.contains("https://shop.example/p?[REDACTED]#[REDACTED]"));
        assert!(text.contains("OptanonConsent"));
    }

    #[test]
    fn empty_and_excluded_sections_survive_reload() {
        let case_file = CaseFile {
            generated_at: "2026-01-01T00:00:00Z".into(),
            app: AppInfo::default(),
            utagdb_logger: None,
            consent_monitor: Some(None),
            iq_profile: None,
        };
        let reloaded: CaseFile = serde_json::from_value(case_file.to_value()).unwrap();
        assert_eq!(reloaded, case_file);

        let with_snapshot = CaseFile {
            iq_profile: Some(Some(SnapshotRecord {
                kind: SnapshotKind::Iq,
                tab_key: "tab-0".into(),
                url: None,
                captured_at: "2026-01-01T00:00:00Z".into(),
                data: json!({"account": "acme"}),
            })),
            ..case_file
        };
        let text = with_snapshot.to_pretty_json().unwrap();
        let reloaded: CaseFile = serde_json::from_str(&text).unwrap();
        assert_eq!(reloaded, with_snapshot);
    }

    #[test]
    fn options_accept_camel_case_and_defaults() {
        let options: ExportOptions =
            serde_json::from_value(json!({"includeIq": false, "sessionId": "s"})).unwrap();
        assert!(options.include_logger);
        assert!(!options.include_iq);
        assert_eq!(options.session_id.as_deref(), Some("s"));
    }
}
