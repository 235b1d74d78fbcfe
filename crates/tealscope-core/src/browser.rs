//! Browser boundary.
//!
//! The engine talks to tabs only through [`Browser`]. A real extension host
//! binds it to the tabs/scripting APIs; the CLI uses [`HeadlessBrowser`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BrowserError;
use crate::protocol::TabRequest;

/// The focused tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: u64,
    pub url: String,
}

impl TabInfo {
    /// Stable key used for per-tab snapshot storage
    #[must_use]
    pub fn key(&self) -> String {
        tab_key(self.id)
    }

    /// Content scripts only run on http(s) pages
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

#[must_use]
pub fn tab_key(tab_id: u64) -> String {
    format!("tab-{tab_id}")
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Active tab of the focused window
    async fn active_tab(&self) -> Option<TabInfo>;

    /// Send a request to the tab's content script and await its response.
    async fn send_to_tab(&self, tab_id: u64, request: &TabRequest) -> Result<Value, BrowserError>;

    /// Inject the content script into the tab.
    async fn inject_content_script(&self, tab_id: u64) -> Result<(), BrowserError>;
}

/// Browser with at most one fixed tab and no content script
///
/// Every tab request fails with `ReceivingEndMissing`, and injection fails,
/// so handlers fall back to cached snapshots.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBrowser {
    tab: Option<TabInfo>,
}

impl HeadlessBrowser {
    #[must_use]
    pub fn new(tab: Option<TabInfo>) -> Self {
        Self { tab }
    }
}

#[async_trait]
impl Browser for HeadlessBrowser {
    async fn active_tab(&self) -> Option<TabInfo> {
        self.tab.clone()
    }

    async fn send_to_tab(&self, _tab_id: u64, _request: &TabRequest) -> Result<Value, BrowserError> {
        Err(BrowserError::ReceivingEndMissing)
    }

    async fn inject_content_script(&self, _tab_id: u64) -> Result<(), BrowserError> {
        Err(BrowserError::InjectionFailed(
            "no content script host in headless mode".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_key_and_support() {
        let tab = TabInfo {
            id: 7,
            url: "https://shop.example/".into(),
        };
        assert_eq!(tab.key(), "tab-7");
        assert!(tab.is_supported());
        assert!(
            !TabInfo {
                id: 1,
                url: "chrome://extensions".into()
            }
            .is_supported()
        );
    }

    #[tokio::test]
    async fn headless_browser_has_no_receiver() {
        let browser = HeadlessBrowser::new(Some(TabInfo {
            id: 3,
            url: "https://a/".into(),
        }));
        assert_eq!(browser.active_tab().await.map(|t| t.id), Some(3));
        assert_eq!(
            browser.send_to_tab(3, &TabRequest::GetUtag).await,
            Err(BrowserError::ReceivingEndMissing)
        );
        assert!(browser.inject_content_script(3).await.is_err());
        assert!(HeadlessBrowser::default().active_tab().await.is_none());
    }
}
