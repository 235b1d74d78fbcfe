//! Shared test infrastructure for tealscope-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use tealscope_core::browser::{Browser, TabInfo};
use tealscope_core::entry::LogEntry;
use tealscope_core::error::BrowserError;
use tealscope_core::protocol::TabRequest;
use tealscope_core::reorder::{LogSink, StreamKey};

pub const PAGE_URL: &str = "https://shop.example/checkout";

/// Structured entry tagged with its own sequence number
pub fn seq_entry(url: &str, seq: u64) -> LogEntry {
    LogEntry::structured(url, "2026-01-01T00:00:00.000Z", vec![json!(seq)]).with_sequence(seq)
}

/// Sink that records every delivery in order
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<(StreamKey, LogEntry)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, e)| e.sequence())
            .collect()
    }

    pub fn sequences_for(&self, url: &str) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.url == url)
            .filter_map(|(_, e)| e.sequence())
            .collect()
    }
}

impl LogSink for RecordingSink {
    fn deliver(&self, key: &StreamKey, entry: LogEntry) {
        self.seen.lock().unwrap().push((key.clone(), entry));
    }
}

/// Browser with one tab whose content script answers from a table
pub struct ScriptedBrowser {
    tab: Option<TabInfo>,
    responses: Mutex<HashMap<String, Value>>,
    pub requests: Mutex<Vec<TabRequest>>,
}

impl ScriptedBrowser {
    pub fn on(url: &str) -> Self {
        Self {
            tab: Some(TabInfo {
                id: 11,
                url: url.to_string(),
            }),
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, request: &TabRequest, value: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(request_type(request), value);
        self
    }

    pub fn recording_states(&self) -> Vec<bool> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                TabRequest::RecordingState { enabled } => Some(*enabled),
                _ => None,
            })
            .collect()
    }
}

fn request_type(request: &TabRequest) -> String {
    serde_json::to_value(request).unwrap()["type"]
        .as_str()
        .unwrap()
        .to_string()
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn active_tab(&self) -> Option<TabInfo> {
        self.tab.clone()
    }

    async fn send_to_tab(&self, _tab_id: u64, request: &TabRequest) -> Result<Value, BrowserError> {
        self.requests.lock().unwrap().push(request.clone());
        if let TabRequest::RecordingState { .. } = request {
            return Ok(json!({"ok": true}));
        }
        self.responses
            .lock()
            .unwrap()
            .get(&request_type(request))
            .cloned()
            .ok_or(BrowserError::ReceivingEndMissing)
    }

    async fn inject_content_script(&self, _tab_id: u64) -> Result<(), BrowserError> {
        Ok(())
    }
}
