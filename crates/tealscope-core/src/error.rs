//! Error types for tealscope-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tealscope-core
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value store errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Collector delivery errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Inter-context message decoding errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Browser/tab boundary errors
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Dispatch(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Protocol(_) => Some(
                Remediation::new("Each input line must be a JSON object with a known `type`.")
                    .alternative("Known types: get_enabled, set_enabled, console_log, bridge_status, send_utag, get_storage_map, get_consent_status, get_iq_profile, get_session_status, export_case_file, content_ready."),
            ),
            Self::Browser(_) => Some(
                Remediation::new("Open an http(s) page with the content script loaded and retry.")
                    .alternative("Reload the tab so the content script is injected."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Key-value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stored value for {key} is corrupt: {details}")]
    Corrupt { key: String, details: String },

    #[error("Storage quota exceeded: write needs {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Bucket writer for {0} stopped before completing the write")]
    WriterGone(String),
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Show status", "tscope session status")
            .alternative("Ensure no other process holds a write lock on the database."),
            Self::Corrupt { key, .. } => {
                Remediation::new(format!("The stored value for `{key}` could not be decoded."))
                    .alternative("Delete the database file to start fresh if the data is expendable.")
            }
            Self::QuotaExceeded { .. } => Remediation::new(
                "Storage is full even after evicting old sessions.",
            )
            .command("Inspect usage", "tscope quota")
            .command("Evict old sessions", "tscope quota --enforce")
            .alternative("Lower store.quota_threshold_bytes or stop the active recording."),
            Self::WriterGone(_) => Remediation::new(
                "The log writer stopped unexpectedly; the entry was not persisted.",
            )
            .alternative("Retry the operation; check logs for a preceding storage error."),
        }
    }
}

/// Collector delivery errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Collector request failed: {0}")]
    Transport(String),

    #[error("Collector responded with HTTP {0}")]
    Status(u16),

    #[error("Collector rejected the payload: {0}")]
    Rejected(String),

    #[error("Invalid collector endpoint: {0}")]
    InvalidEndpoint(String),
}

impl DispatchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Transport(_) | Self::Status(_) => Remediation::new(
                "The local collector is unreachable or unhealthy. Start it and retry.",
            )
            .command("Check collector", "curl -s -X POST -H 'content-type: application/json' -d '{}' http://localhost:3005/")
            .alternative("Set collector.endpoint in tealscope.toml if it listens elsewhere."),
            Self::Rejected(_) => Remediation::new("The collector answered `ok: false`.")
                .alternative("Check the collector logs for the rejection reason."),
            Self::InvalidEndpoint(endpoint) => {
                Remediation::new(format!("`{endpoint}` is not a valid http(s) URL."))
                    .alternative("Use a full URL such as http://localhost:3005/.")
            }
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or point to an existing one: {path}"))
                    .alternative("Omit --config to run with built-in defaults.")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check that {path} is readable."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in tealscope.toml.")
                .alternative("Compare against the documented defaults."),
            Self::ValidationError(_) => Remediation::new("Fix the invalid setting and retry.")
                .alternative("store.quota_target_bytes must be below store.quota_threshold_bytes."),
        }
    }
}

/// Message decoding errors at the inter-context boundary
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message is missing a `type` field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} message: {details}")]
    Malformed { kind: String, details: String },
}

/// Browser/tab boundary errors
///
/// These are expected conditions (content script not injected yet, tab on a
/// `chrome://` page, ...) and are surfaced as `{ok: false, error}` replies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("No active tab")]
    NoActiveTab,

    #[error("Unsupported tab URL")]
    UnsupportedUrl(String),

    #[error("Could not establish connection. Receiving end does not exist.")]
    ReceivingEndMissing,

    #[error("Content script injection failed: {0}")]
    InjectionFailed(String),

    #[error("Tab did not respond within {0} ms")]
    Timeout(u64),
}
