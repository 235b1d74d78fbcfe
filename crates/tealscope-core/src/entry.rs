//! Log entry model and ordering keys.
//!
//! A captured log entry is either a legacy plain string or a structured
//! record produced by the page-side console bridge:
//!
//! ```json
//! {"url": "https://shop.example/", "timestamp": "2026-01-01T00:00:00.000Z",
//!  "args": ["utag.DB", "..."], "level": "log", "sequence": 4,
//!  "db_index": 12, "db_generation": 0}
//! ```
//!
//! `sequence` is the primary per-stream order and drives the reorder buffer.
//! `db_index`/`db_generation` track the page's `utag.db_log` array and give a
//! secondary key that survives producer restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single captured log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogEntry {
    /// Legacy unstructured line
    Plain(String),
    /// Structured console record
    Structured(StructuredEntry),
}

/// Structured console record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredEntry {
    /// Page URL the entry was captured on
    #[serde(default)]
    pub url: String,

    /// Producer timestamp (ISO 8601)
    #[serde(default)]
    pub timestamp: String,

    /// Serialized console arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Console method (`log`, `warn`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-stream producer sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// Length of the page log array when the entry was captured
    #[serde(default, alias = "dbIndex", skip_serializing_if = "Option::is_none")]
    pub db_index: Option<u64>,

    /// Number of times the page log array was observed to reset
    #[serde(
        default,
        alias = "dbGeneration",
        skip_serializing_if = "Option::is_none"
    )]
    pub db_generation: Option<u64>,
}

impl LogEntry {
    /// Structured entry with only url, timestamp and args set
    #[must_use]
    pub fn structured(url: impl Into<String>, timestamp: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Structured(StructuredEntry {
            url: url.into(),
            timestamp: timestamp.into(),
            args,
            ..StructuredEntry::default()
        })
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        if let Self::Structured(entry) = &mut self {
            entry.sequence = Some(sequence);
        }
        self
    }

    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Plain(_) => None,
            Self::Structured(entry) => entry.sequence,
        }
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Structured(entry) => Some(entry.url.as_str()),
        }
    }

    /// `(db_generation, db_index)` when the entry carries a db index
    #[must_use]
    pub fn db_key(&self) -> Option<(u64, u64)> {
        match self {
            Self::Structured(StructuredEntry {
                db_index: Some(index),
                db_generation,
                ..
            }) => Some((db_generation.unwrap_or(0), *index)),
            _ => None,
        }
    }
}

// =============================================================================
// Producer-side generation tracking
// =============================================================================

/// Tracks `db_index` values from one producer and assigns generations.
///
/// The generation increments whenever the observed index decreases, i.e.
/// the page replaced or truncated its log array.
#[derive(Debug, Default, Clone)]
pub struct DbIndexTracker {
    last_index: Option<u64>,
    generation: u64,
}

impl DbIndexTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed index and return the generation it belongs to.
    pub fn observe(&mut self, index: u64) -> u64 {
        if let Some(last) = self.last_index {
            if index < last {
                self.generation += 1;
            }
        }
        self.last_index = Some(index);
        self.generation
    }

    /// Fill in `db_generation` on entries that carry only a `db_index`.
    ///
    /// Entries that already carry a generation are left untouched.
    pub fn stamp(&mut self, entry: &mut LogEntry) {
        if let LogEntry::Structured(record) = entry {
            if let (Some(index), None) = (record.db_index, record.db_generation) {
                record.db_generation = Some(self.observe(index));
            }
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// =============================================================================
// Full sort over the composite key
// =============================================================================

/// Sort entries by `(db_generation, db_index, sequence, arrival)`.
///
/// An entry missing part of the key inherits it from the nearest preceding
/// entry that has it (`0` before any such entry), so unkeyed entries stay
/// next to the entries they arrived with. The sort is stable.
pub fn sort_by_order_key(entries: &mut Vec<LogEntry>) {
    let mut db = (0u64, 0u64);
    let mut seq = 0u64;
    let mut keyed: Vec<((u64, u64, u64, usize), LogEntry)> = entries
        .drain(..)
        .enumerate()
        .map(|(arrival, entry)| {
            if let Some(key) = entry.db_key() {
                db = key;
            }
            if let Some(s) = entry.sequence() {
                seq = s;
            }
            ((db.0, db.1, seq, arrival), entry)
        })
        .collect();
    keyed.sort_by_key(|(key, _)| *key);
    entries.extend(keyed.into_iter().map(|(_, entry)| entry));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keyed(generation: u64, index: u64, seq: u64, tag: &str) -> LogEntry {
        LogEntry::Structured(StructuredEntry {
            url: "https://shop.example/".into(),
            args: vec![json!(tag)],
            sequence: Some(seq),
            db_index: Some(index),
            db_generation: Some(generation),
            ..StructuredEntry::default()
        })
    }

    fn tag(entry: &LogEntry) -> String {
        match entry {
            LogEntry::Plain(s) => s.clone(),
            LogEntry::Structured(e) => e.args[0].as_str().unwrap().to_string(),
        }
    }

    #[test]
    fn plain_and_structured_entries_deserialize_untagged() {
        let plain: LogEntry = serde_json::from_value(json!("utag loaded")).unwrap();
        assert_eq!(plain, LogEntry::Plain("utag loaded".into()));

        let structured: LogEntry = serde_json::from_value(json!({
            "url": "https://shop.example/cart",
            "timestamp": "2026-01-01T00:00:00.000Z",
            "args": ["a", 1],
            "level": "warn",
            "sequence": 3,
            "dbIndex": 9
        }))
        .unwrap();
        assert_eq!(structured.sequence(), Some(3));
        assert_eq!(structured.url(), Some("https://shop.example/cart"));
        assert_eq!(structured.db_key(), Some((0, 9)));
    }

    #[test]
    fn serialization_omits_absent_optionals() {
        let entry = LogEntry::structured("https://a/", "t", vec![json!("x")]);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value, json!({"url": "https://a/", "timestamp": "t", "args": ["x"]}));
    }

    #[test]
    fn tracker_bumps_generation_when_index_decreases() {
        let mut tracker = DbIndexTracker::new();
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.observe(5), 0);
        assert_eq!(tracker.observe(5), 0);
        assert_eq!(tracker.observe(2), 1);
        assert_eq!(tracker.observe(3), 1);
        assert_eq!(tracker.observe(0), 2);
        assert_eq!(tracker.generation(), 2);
    }

    #[test]
    fn tracker_stamps_only_entries_missing_generation() {
        let mut tracker = DbIndexTracker::new();
        let mut first = LogEntry::Structured(StructuredEntry {
            db_index: Some(10),
            ..StructuredEntry::default()
        });
        let mut reset = LogEntry::Structured(StructuredEntry {
            db_index: Some(1),
            ..StructuredEntry::default()
        });
        let mut explicit = keyed(7, 0, 0, "x");
        tracker.stamp(&mut first);
        tracker.stamp(&mut reset);
        tracker.stamp(&mut explicit);
        assert_eq!(first.db_key(), Some((0, 10)));
        assert_eq!(reset.db_key(), Some((1, 1)));
        assert_eq!(explicit.db_key(), Some((7, 0)));
    }

    #[test]
    fn sort_orders_by_generation_then_index() {
        let mut entries = vec![
            keyed(1, 0, 0, "g1-0"),
            keyed(0, 5, 1, "g0-5"),
            keyed(0, 2, 2, "g0-2"),
            keyed(1, 3, 3, "g1-3"),
        ];
        sort_by_order_key(&mut entries);
        let tags: Vec<_> = entries.iter().map(tag).collect();
        assert_eq!(tags, ["g0-2", "g0-5", "g1-0", "g1-3"]);
    }

    #[test]
    fn unkeyed_entries_stay_with_their_predecessor() {
        let mut entries = vec![
            keyed(0, 4, 0, "late"),
            LogEntry::Plain("after-late".into()),
            keyed(0, 1, 1, "early"),
            LogEntry::Plain("after-early".into()),
        ];
        sort_by_order_key(&mut entries);
        let tags: Vec<_> = entries.iter().map(tag).collect();
        assert_eq!(tags, ["early", "after-early", "late", "after-late"]);
    }

    #[test]
    fn leading_unkeyed_entries_sort_first() {
        let mut entries = vec![
            LogEntry::Plain("boot".into()),
            keyed(0, 0, 0, "first"),
        ];
        sort_by_order_key(&mut entries);
        assert_eq!(tag(&entries[0]), "boot");
    }
}
