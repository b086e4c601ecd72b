//! Capability interface over the host browser.
//!
//! Orchestration, capture, execution and verification only ever talk to a
//! [`BrowserHost`]; `chrome::ChromeHost` is the real binding and tests use an
//! in-memory page.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of the tab owned by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabHandle {
    pub id: String,
    /// Group the agent's tabs are collected under, if the host supports it.
    pub group_id: Option<String>,
}

/// Scripts the agent injects into a page. Every script takes one JSON
/// argument and returns one JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageScript {
    /// Read-only page snapshot (see `dom`).
    Snapshot,
    /// `document.readyState`.
    ReadyState,
    Click,
    Type,
    CloseModal,
}

impl PageScript {
    pub fn name(self) -> &'static str {
        match self {
            PageScript::Snapshot => "snapshot",
            PageScript::ReadyState => "ready_state",
            PageScript::Click => "click",
            PageScript::Type => "type",
            PageScript::CloseModal => "close_modal",
        }
    }

    /// JavaScript function source; hosts call it as `(source)(args)`.
    pub fn source(self) -> &'static str {
        match self {
            PageScript::Snapshot => crate::dom::SNAPSHOT_JS,
            PageScript::ReadyState => "() => document.readyState",
            PageScript::Click => crate::hands::CLICK_JS,
            PageScript::Type => crate::hands::TYPE_JS,
            PageScript::CloseModal => crate::hands::CLOSE_MODAL_JS,
        }
    }
}

#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Creates a fresh tab for a new session.
    async fn open_tab(&self) -> anyhow::Result<TabHandle>;

    /// Looks up a previously recorded tab; `None` if it has been closed.
    async fn find_tab(&self, tab_id: &str) -> anyhow::Result<Option<TabHandle>>;

    async fn tab_url(&self, tab: &TabHandle) -> anyhow::Result<String>;

    async fn navigate(&self, tab: &TabHandle, url: &str) -> anyhow::Result<()>;

    /// Runs `script` in the tab's page context. Only serializable values cross
    /// the boundary.
    async fn run_in_page(
        &self,
        tab: &TabHandle,
        script: PageScript,
        args: Value,
    ) -> anyhow::Result<Value>;
}

/// Whether a URL points at a page scripts may be injected into.
pub fn is_scriptable_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_pages_are_scriptable() {
        assert!(is_scriptable_url("https://example.com/a"));
        assert!(is_scriptable_url("http://localhost:8080"));
        assert!(!is_scriptable_url("about:blank"));
        assert!(!is_scriptable_url("chrome://settings"));
        assert!(!is_scriptable_url("not a url"));
    }
}
