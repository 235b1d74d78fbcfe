//! Inter-context message protocol.
//!
//! Messages from the popup, side panel and content scripts are JSON objects
//! tagged by `type`. They are decoded once, here, into [`Message`]; the rest
//! of the engine never looks at raw JSON envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::casefile::ExportOptions;
use crate::error::ProtocolError;

/// Every `type` the background accepts
pub const KNOWN_TYPES: &[&str] = &[
    "get_enabled",
    "set_enabled",
    "content_ready",
    "console_log",
    "bridge_status",
    "send_utag",
    "get_storage_map",
    "get_consent_status",
    "get_iq_profile",
    "get_session_status",
    "export_case_file",
];

/// Inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    GetEnabled,
    SetEnabled {
        #[serde(default)]
        enabled: bool,
        #[serde(default, alias = "sessionName", skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
    },
    ContentReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ConsoleLog {
        #[serde(default)]
        payload: Value,
    },
    BridgeStatus {
        #[serde(default)]
        payload: Value,
    },
    SendUtag,
    GetStorageMap,
    GetConsentStatus,
    GetIqProfile,
    GetSessionStatus,
    ExportCaseFile {
        #[serde(default)]
        options: ExportOptions,
    },
}

impl Message {
    /// Decode a JSON value, distinguishing missing, unknown and malformed.
    pub fn decode(value: &Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        Self::deserialize(value).map_err(|e| ProtocolError::Malformed {
            kind: kind.to_string(),
            details: e.to_string(),
        })
    }

    /// Decode JSON text
    pub fn decode_str(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            kind: "json".to_string(),
            details: e.to_string(),
        })?;
        Self::decode(&value)
    }

    /// Wire name of this message
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetEnabled => "get_enabled",
            Self::SetEnabled { .. } => "set_enabled",
            Self::ContentReady { .. } => "content_ready",
            Self::ConsoleLog { .. } => "console_log",
            Self::BridgeStatus { .. } => "bridge_status",
            Self::SendUtag => "send_utag",
            Self::GetStorageMap => "get_storage_map",
            Self::GetConsentStatus => "get_consent_status",
            Self::GetIqProfile => "get_iq_profile",
            Self::GetSessionStatus => "get_session_status",
            Self::ExportCaseFile { .. } => "export_case_file",
        }
    }
}

/// Where a message came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSender {
    /// Originating tab, absent for extension pages
    pub tab_id: Option<u64>,
    /// URL of the originating tab
    pub url: Option<String>,
}

impl MessageSender {
    #[must_use]
    pub fn tab(tab_id: u64, url: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id),
            url: Some(url.into()),
        }
    }

    /// Extension page (popup, side panel, CLI)
    #[must_use]
    pub fn extension() -> Self {
        Self::default()
    }
}

/// Reply to an inbound message: `{ok, error?, ...data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            data: Map::new(),
        }
    }

    /// Add one data field
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Merge the fields of a JSON object; other values land under `data`.
    #[must_use]
    pub fn merge(mut self, value: Value) -> Self {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    if k != "ok" && k != "error" {
                        self.data.insert(k, v);
                    }
                }
            }
            Value::Null => {}
            other => {
                self.data.insert("data".to_string(), other);
            }
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Request sent from the background to a tab's content script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabRequest {
    GetUtag,
    GetStorageMap,
    GetConsentStatus,
    GetIqProfile,
    RecordingState { enabled: bool },
}
