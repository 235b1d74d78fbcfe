//! Collector delivery with retry.
//!
//! Payloads are POSTed as JSON to the local collector. A delivery succeeds
//! on a 2xx response whose body is not a JSON object with `"ok": false`;
//! anything else is retried on the configured schedule and finally dropped.
//!
//! The HTTP layer sits behind [`Transport`] so tests can script responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::CollectorConfig;
use crate::error::DispatchError;
use crate::retry::{RetryOutcome, RetryPolicy, with_retry_outcome};

/// Raw collector response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP POST of a JSON body
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<TransportResponse, DispatchError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("tealscope/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<TransportResponse, DispatchError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(TransportResponse { status, body })
    }
}

/// Apply the collector success rule to one response.
pub fn classify(response: &TransportResponse) -> Result<(), DispatchError> {
    if !(200..300).contains(&response.status) {
        return Err(DispatchError::Status(response.status));
    }
    match serde_json::from_str::<Value>(&response.body) {
        Ok(Value::Object(map)) if map.get("ok") == Some(&Value::Bool(false)) => {
            let reason = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("ok: false")
                .to_string();
            Err(DispatchError::Rejected(reason))
        }
        _ => Ok(()),
    }
}

/// Client for the local collector
#[derive(Clone)]
pub struct CollectorClient {
    endpoint: String,
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for CollectorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorClient")
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .finish()
    }
}

impl CollectorClient {
    pub fn new(
        endpoint: impl Into<String>,
        policy: RetryPolicy,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DispatchError> {
        let endpoint = endpoint.into();
        match url::Url::parse(&endpoint) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(DispatchError::InvalidEndpoint(endpoint)),
        }
        Ok(Self {
            endpoint,
            policy,
            transport,
        })
    }

    /// HTTP client configured from the `[collector]` section
    pub fn from_config(config: &CollectorConfig) -> Result<Self, DispatchError> {
        let transport = HttpTransport::new(config.request_timeout())?;
        Self::new(
            config.endpoint.clone(),
            config.retry_policy(),
            Arc::new(transport),
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One attempt, no retry
    pub async fn try_deliver(&self, payload: &Value) -> Result<(), DispatchError> {
        let response = self.transport.post_json(&self.endpoint, payload).await?;
        classify(&response)
    }

    /// Deliver with retry, reporting attempts and elapsed time
    pub async fn deliver_outcome(&self, payload: &Value) -> RetryOutcome<(), DispatchError> {
        with_retry_outcome(&self.policy, || self.try_deliver(payload)).await
    }

    /// Deliver with retry; `false` once every attempt failed.
    pub async fn deliver(&self, payload: &Value) -> bool {
        let outcome = self.deliver_outcome(payload).await;
        match outcome.result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint,
                    attempts = outcome.attempts,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    error = %e,
                    "Dropping collector payload after retries"
                );
                false
            }
        }
    }
}

// =============================================================================
// Payload envelopes
// =============================================================================

/// Envelope body, serialized under its own key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBody {
    /// `utag` object captured from the page
    Utag(Value),
    /// Console entry
    Console(Value),
    /// Console bridge status
    Status(Value),
}

/// Collector envelope: `{source, url, captured_at, <body key>: ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorPayload {
    pub source: &'static str,
    pub url: String,
    pub captured_at: String,
    #[serde(flatten)]
    pub body: PayloadBody,
}

impl CollectorPayload {
    pub const UTAG_SOURCE: &'static str = "tealium-extension";
    pub const CONSOLE_SOURCE: &'static str = "tealium-extension-console";
    pub const STATUS_SOURCE: &'static str = "tealium-extension-status";

    fn new(source: &'static str, url: &str, body: PayloadBody) -> Self {
        Self {
            source,
            url: url.to_string(),
            captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            body,
        }
    }

    #[must_use]
    pub fn utag(url: &str, utag: Value) -> Self {
        Self::new(Self::UTAG_SOURCE, url, PayloadBody::Utag(utag))
    }

    #[must_use]
    pub fn console(url: &str, console: Value) -> Self {
        Self::new(Self::CONSOLE_SOURCE, url, PayloadBody::Console(console))
    }

    #[must_use]
    pub fn status(url: &str, status: Value) -> Self {
        Self::new(Self::STATUS_SOURCE, url, PayloadBody::Status(status))
    }

    /// JSON form posted to the collector
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted responses and records each call.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, DispatchError>>>,
        calls: Mutex<Vec<(Instant, Value)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, DispatchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Offset of each call from the first one
        fn call_offsets(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            let Some((first, _)) = calls.first() else {
                return Vec::new();
            };
            calls.iter().map(|(at, _)| at.duration_since(*first)).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_json(
            &self,
            _endpoint: &str,
            payload: &Value,
        ) -> Result<TransportResponse, DispatchError> {
            self.calls.lock().unwrap().push((Instant::now(), payload.clone()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DispatchError::Transport("script exhausted".into())))
        }
    }

    fn ok(body: &str) -> Result<TransportResponse, DispatchError> {
        Ok(TransportResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn client(transport: Arc<ScriptedTransport>) -> CollectorClient {
        CollectorClient::new("http://localhost:3005/", RetryPolicy::collector(), transport).unwrap()
    }

    #[test]
    fn classify_success_rules() {
        assert!(classify(&TransportResponse { status: 200, body: "{\"ok\":true}".into() }).is_ok());
        assert!(classify(&TransportResponse { status: 204, body: String::new() }).is_ok());
        assert!(classify(&TransportResponse { status: 200, body: "not json".into() }).is_ok());
        assert!(classify(&TransportResponse { status: 200, body: "[false]".into() }).is_ok());
        assert!(matches!(
            classify(&TransportResponse { status: 200, body: "{\"ok\":false,\"error\":\"full\"}".into() }),
            Err(DispatchError::Rejected(reason)) if reason == "full"
        ));
        assert!(matches!(
            classify(&TransportResponse { status: 503, body: "{\"ok\":true}".into() }),
            Err(DispatchError::Status(503))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fail_succeed_delivers_on_third_call() {
        let transport = ScriptedTransport::new(vec![
            Err(DispatchError::Transport("connection refused".into())),
            Ok(TransportResponse { status: 500, body: String::new() }),
            ok("{\"ok\":true}"),
        ]);
        let client = client(Arc::clone(&transport));

        let outcome = client.deliver_outcome(&json!({"a": 1})).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            transport.call_offsets(),
            [Duration::ZERO, Duration::from_millis(250), Duration::from_millis(750)]
        );
        assert_eq!(outcome.elapsed, Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_four_attempts() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));
        assert!(!client.deliver(&json!({})).await);
        assert_eq!(transport.calls(), 4);
        assert_eq!(transport.call_offsets().last(), Some(&Duration::from_millis(1750)));
    }

    #[tokio::test(start_paused = true)]
    async fn ok_false_body_is_retried() {
        let transport = ScriptedTransport::new(vec![ok("{\"ok\":false}"), ok("{}")]);
        let client = client(Arc::clone(&transport));
        assert!(client.deliver(&json!({})).await);
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let transport = ScriptedTransport::new(vec![]);
        let err = CollectorClient::new("localhost:3005", RetryPolicy::none(), transport).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidEndpoint(_)));
    }

    #[test]
    fn envelopes_match_collector_format() {
        let value = CollectorPayload::utag("https://shop.example/", json!({"id": "main"})).to_value();
        assert_eq!(value["source"], "tealium-extension");
        assert_eq!(value["url"], "https://shop.example/");
        assert_eq!(value["utag"], json!({"id": "main"}));
        assert!(value["captured_at"].as_str().unwrap().ends_with('Z'));

        let value = CollectorPayload::console("", json!({"args": []})).to_value();
        assert_eq!(value["source"], "tealium-extension-console");
        assert_eq!(value["console"], json!({"args": []}));

        let value = CollectorPayload::status("https://a/", json!({"ready": true})).to_value();
        assert_eq!(value["source"], "tealium-extension-status");
        assert_eq!(value["status"], json!({"ready": true}));
        assert_eq!(value.as_object().unwrap().len(), 4);
    }
}
