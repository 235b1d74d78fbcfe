#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;

use tealscope_core::entry::{LogEntry, sort_by_order_key};
use tealscope_core::protocol::Message;
use tealscope_core::redact::{redact_consent_signals, redact_urls_in, redact_value};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let _ = redact_urls_in(text);

    let Ok(message) = Message::decode_str(text) else {
        return;
    };

    // Anything we accept must survive being re-encoded.
    let encoded = serde_json::to_value(&message).expect("decoded message serializes");
    let again = Message::decode(&encoded).expect("re-encoded message decodes");
    assert_eq!(again.kind(), message.kind());

    if let Message::ConsoleLog { payload } | Message::BridgeStatus { payload } = message {
        let mut scrubbed = payload.clone();
        redact_value(&mut scrubbed);
        redact_consent_signals(&mut scrubbed);

        if let Value::Array(items) = payload {
            let mut entries: Vec<LogEntry> = items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect();
            let before = entries.len();
            sort_by_order_key(&mut entries);
            assert_eq!(entries.len(), before);
        }
    }
});
