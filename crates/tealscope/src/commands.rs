//! Command implementations for tscope.

use std::io::{BufRead, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use serde_json::{Value, json};
use tracing::{debug, warn};

use tealscope_core::browser::{HeadlessBrowser, TabInfo};
use tealscope_core::casefile::{ExportOptions, build_case_file};
use tealscope_core::config::Config;
use tealscope_core::dispatch::CollectorClient;
use tealscope_core::entry::{LogEntry, sort_by_order_key};
use tealscope_core::kv::{KvStore, SqliteKvStore};
use tealscope_core::protocol::{Message, MessageSender};
use tealscope_core::relay::Relay;

use crate::{OutputFormat, SessionCommands, SnapshotCommands};

/// Tab id given to the page in headless mode
const HEADLESS_TAB_ID: u64 = 0;

pub struct Context {
    pub config: Config,
    pub format: OutputFormat,
}

impl Context {
    fn open_kv(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        let db_path = self.config.db_path();
        let kv = SqliteKvStore::open(&db_path)
            .with_context(|| format!("Failed to open session database {}", db_path.display()))?;
        debug!(db_path = %db_path.display(), "Opened session database");
        Ok(Arc::new(kv))
    }

    async fn relay(&self, tab_url: Option<String>) -> anyhow::Result<Relay> {
        let browser = HeadlessBrowser::new(tab_url.map(|url| TabInfo {
            id: HEADLESS_TAB_ID,
            url,
        }));
        Relay::from_config(self.config.clone(), self.open_kv()?, Arc::new(browser))
            .await
            .context("Failed to start relay")
    }

    /// Print `value` as JSON, or `plain` as text.
    fn emit(&self, value: &Value, plain: impl FnOnce() -> String) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Plain => {
                let text = plain();
                if !text.is_empty() {
                    println!("{}", text.trim_end());
                }
            }
        }
        Ok(())
    }
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))
    }
}

fn read_json(input: &str) -> anyhow::Result<Value> {
    let text = read_input(input)?;
    serde_json::from_str(&text)
        .map_err(tealscope_core::Error::from)
        .with_context(|| format!("{input} is not valid JSON"))
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

// =============================================================================
// session
// =============================================================================

pub async fn session(ctx: &Context, command: SessionCommands) -> anyhow::Result<()> {
    match command {
        SessionCommands::Start { name, url } => {
            let relay = ctx.relay(url).await?;
            let reply = relay
                .handle(
                    Message::SetEnabled {
                        enabled: true,
                        session_name: name,
                    },
                    &MessageSender::extension(),
                )
                .await;
            if !reply.ok {
                bail!("Failed to start session: {}", opt(reply.error.as_deref()));
            }
            let session_id = reply.get("session_id").cloned().unwrap_or(Value::Null);
            ctx.emit(&json!({"ok": true, "session_id": session_id}), || {
                format!("Started session {}", session_id.as_str().unwrap_or_default())
            })
        }
        SessionCommands::Stop => {
            let relay = ctx.relay(None).await?;
            let reply = relay
                .handle(
                    Message::SetEnabled {
                        enabled: false,
                        session_name: None,
                    },
                    &MessageSender::extension(),
                )
                .await;
            relay.shutdown().await;
            if !reply.ok {
                bail!("Failed to stop session: {}", opt(reply.error.as_deref()));
            }
            let value = reply.to_value();
            ctx.emit(&value, || match reply.get("session_id").and_then(Value::as_str) {
                Some(id) => format!(
                    "Stopped session {id} ({} entries)",
                    reply.get("log_count").and_then(Value::as_u64).unwrap_or(0)
                ),
                None => "No active session".to_string(),
            })
        }
        SessionCommands::Status => {
            let relay = ctx.relay(None).await?;
            let reply = relay
                .handle(Message::GetSessionStatus, &MessageSender::extension())
                .await;
            if !reply.ok {
                bail!("Failed to read status: {}", opt(reply.error.as_deref()));
            }
            let value = reply.to_value();
            ctx.emit(&value, || {
                let field = |key: &str| {
                    reply
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("-")
                        .to_string()
                };
                format!(
                    "enabled:         {}\nsession_id:      {}\nsession_name:    {}\nlog_count:       {}\nlast_session_id: {}\nusage:           {} / {} bytes",
                    reply.get("enabled").and_then(Value::as_bool).unwrap_or(false),
                    field("session_id"),
                    field("session_name"),
                    reply.get("log_count").and_then(Value::as_u64).unwrap_or(0),
                    field("last_session_id"),
                    reply.get("usage_bytes").and_then(Value::as_u64).unwrap_or(0),
                    reply.get("quota_threshold_bytes").and_then(Value::as_u64).unwrap_or(0),
                )
            })
        }
        SessionCommands::List => {
            let relay = ctx.relay(None).await?;
            let sessions = relay.store().list_sessions().await?;
            ctx.emit(&serde_json::to_value(&sessions)?, || {
                if sessions.is_empty() {
                    return "No sessions recorded".to_string();
                }
                sessions
                    .iter()
                    .map(|s| {
                        format!(
                            "{}\t{}\t{}\t{}\t{}",
                            s.session_id,
                            opt(s.session_name.as_deref()),
                            s.started_at,
                            s.ended_at.as_deref().unwrap_or("active"),
                            s.log_count
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

// =============================================================================
// ingest
// =============================================================================

pub async fn ingest(ctx: &Context, input: &str, tab_url: Option<String>) -> anyhow::Result<()> {
    let relay = ctx.relay(tab_url.clone()).await?;
    let sender = match tab_url {
        Some(url) => MessageSender::tab(HEADLESS_TAB_ID, url),
        None => MessageSender::extension(),
    };

    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(std::io::BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("Failed to open {input}"))?;
        Box::new(std::io::BufReader::new(file))
    };

    let (mut handled, mut failed) = (0u64, 0u64);
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {input}"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(line) {
            Ok(raw) => relay.handle_value(&raw, &sender).await,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping line that is not JSON");
                failed += 1;
                continue;
            }
        };
        if reply.ok {
            handled += 1;
        } else {
            warn!(line = index + 1, error = ?reply.error, "Message rejected");
            failed += 1;
        }
    }
    relay.shutdown().await;

    let status = relay.sessions().status();
    let summary = json!({
        "handled": handled,
        "failed": failed,
        "session_id": status.session_id,
        "log_count": status.log_count,
    });
    ctx.emit(&summary, || {
        format!("Handled {handled} messages ({failed} failed)")
    })
}

// =============================================================================
// logs / export
// =============================================================================

pub async fn logs(ctx: &Context, session_id: Option<String>, sorted: bool) -> anyhow::Result<()> {
    let relay = ctx.relay(None).await?;
    let Some(session_id) = session_id.or_else(|| relay.sessions().current_or_last()) else {
        bail!("No session recorded yet; start one with `tscope session start`");
    };
    let mut entries = relay.store().read_bucket(&session_id).await?;
    if sorted {
        sort_by_order_key(&mut entries);
    }

    ctx.emit(
        &json!({"session_id": session_id, "entries": entries}),
        || {
            entries
                .iter()
                .map(|entry| match entry {
                    LogEntry::Plain(line) => line.clone(),
                    LogEntry::Structured(_) => serde_json::to_string(entry).unwrap_or_default(),
                })
                .collect::<Vec<_>>()
                .join("\n")
        },
    )
}

pub async fn export(
    ctx: &Context,
    options: &ExportOptions,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let relay = ctx.relay(None).await?;
    let case_file = build_case_file(
        relay.store(),
        relay.snapshots(),
        relay.sessions().current_or_last(),
        options,
    )
    .await
    .context("Failed to build case file")?;
    let text = case_file.to_pretty_json()?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{text}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            let entries = case_file.utagdb_logger.as_ref().map_or(0, |l| l.entry_count);
            ctx.emit(
                &json!({"ok": true, "path": path.display().to_string(), "entries": entries}),
                || format!("Wrote case file to {} ({entries} entries)", path.display()),
            )
        }
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

// =============================================================================
// send / quota / snapshot
// =============================================================================

pub async fn send(ctx: &Context, input: &str) -> anyhow::Result<()> {
    let payload = read_json(input)?;
    let client = CollectorClient::from_config(&ctx.config.collector)
        .map_err(tealscope_core::Error::from)
        .context("Invalid collector configuration")?;
    let outcome = client.deliver_outcome(&payload).await;
    let attempts = outcome.attempts;
    if let Err(e) = outcome.result {
        return Err(tealscope_core::Error::from(e)).with_context(|| {
            format!(
                "Failed to send payload after {attempts} attempts to {}",
                client.endpoint()
            )
        });
    }
    ctx.emit(
        &json!({"ok": true, "endpoint": client.endpoint(), "attempts": attempts}),
        || format!("Delivered to {} after {attempts} attempt(s)", client.endpoint()),
    )
}

pub async fn quota(ctx: &Context, enforce: bool) -> anyhow::Result<()> {
    let relay = ctx.relay(None).await?;
    let policy = relay.store().quota();
    let usage = relay.store().usage().await?;
    let report = if enforce {
        Some(relay.store().ensure_under_quota(&[]).await?)
    } else {
        None
    };

    let value = json!({
        "usage_bytes": usage,
        "threshold_bytes": policy.threshold_bytes,
        "target_bytes": policy.target_bytes,
        "over_threshold": usage > policy.threshold_bytes,
        "eviction": report,
    });
    ctx.emit(&value, || {
        let mut text = format!(
            "usage: {usage} bytes (threshold {}, target {})",
            policy.threshold_bytes, policy.target_bytes
        );
        if let Some(report) = &report {
            if report.any_evicted() {
                text.push_str(&format!(
                    "\nevicted {} session(s): {}\nusage now: {} bytes",
                    report.evicted.len(),
                    report.evicted.join(", "),
                    report.usage_after
                ));
            } else {
                text.push_str("\nnothing to evict");
            }
        }
        text
    })
}

pub async fn snapshot(ctx: &Context, command: SnapshotCommands) -> anyhow::Result<()> {
    match command {
        SnapshotCommands::Import {
            kind,
            input,
            tab,
            url,
        } => {
            let data = read_json(&input)?;
            let relay = ctx.relay(None).await?;
            let record = relay
                .snapshots()
                .record(kind, &tab, url.as_deref(), data)
                .await?;
            ctx.emit(&serde_json::to_value(&record)?, || {
                format!("Stored {kind} snapshot for {tab}")
            })
        }
    }
}
