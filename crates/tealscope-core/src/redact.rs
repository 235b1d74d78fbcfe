//! Case-file redaction.
//!
//! Query strings and fragments routinely carry emails, click ids and session
//! tokens, and consent signals carry raw cookie values. Redaction keeps the
//! structure of the export intact so it still reads as a timeline.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("valid URL pattern"));

/// Replace the query and fragment of one URL with `[REDACTED]` markers.
#[must_use]
pub fn redact_url(url: &str) -> String {
    let (before_fragment, fragment) = match url.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (url, None),
    };
    let (base, query) = match before_fragment.split_once('?') {
        Some((head, q)) => (head, Some(q)),
        None => (before_fragment, None),
    };

    let mut out = base.to_string();
    if query.is_some_and(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(REDACTED);
    }
    if fragment.is_some_and(|f| !f.is_empty()) {
        out.push('#');
        out.push_str(REDACTED);
    }
    out
}

/// Redact every http(s) URL embedded in `text`.
#[must_use]
pub fn redact_urls_in(text: &str) -> Cow<'_, str> {
    URL_PATTERN.replace_all(text, |caps: &Captures<'_>| redact_url(&caps[0]))
}

/// Redact URLs in every string of a JSON tree. Object keys are kept.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let redacted = match redact_urls_in(s) {
                Cow::Owned(redacted) => Some(redacted),
                Cow::Borrowed(_) => None,
            };
            if let Some(redacted) = redacted {
                *s = redacted;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        Value::Object(map) => map.values_mut().for_each(redact_value),
        _ => {}
    }
}

/// Blank out `signals[*].value` of a consent snapshot.
pub fn redact_consent_signals(consent: &mut Value) {
    let Some(signals) = consent.get_mut("signals").and_then(Value::as_array_mut) else {
        return;
    };
    for signal in signals {
        if let Some(value) = signal.get_mut("value") {
            if !value.is_null() {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
}
