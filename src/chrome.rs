//! [`BrowserHost`] over a real Chrome via `headless_chrome`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::host::{BrowserHost, PageScript, TabHandle};

pub const DEFAULT_DEBUG_ENDPOINT: &str = "http://127.0.0.1:9222";

/// Group id stamped on every tab the agent opens.
pub const AGENT_TAB_GROUP: &str = "browser-pilot";

#[derive(Debug, Clone, Default)]
pub struct LaunchSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
}

/// Persistent browser connection. Created once, shared by every run.
pub struct ChromeHost {
    browser: Browser,
}

impl ChromeHost {
    /// Attaches to a Chrome started with `--remote-debugging-port`.
    pub async fn attach(endpoint: &str) -> Result<Self> {
        let ws_url = discover_debugger_url(endpoint).await?;
        let browser = tokio::task::spawn_blocking(move || Browser::connect(ws_url))
            .await
            .map_err(|e| anyhow!("attach task panicked: {}", e))??;
        info!(%endpoint, "attached to running chrome");
        Ok(Self { browser })
    }

    /// Launches Chrome with a persistent agent profile so logins survive
    /// restarts.
    pub async fn launch(settings: LaunchSettings) -> Result<Self> {
        let browser = tokio::task::spawn_blocking(move || launch_browser(&settings))
            .await
            .map_err(|e| anyhow!("browser launch panicked: {}", e))??;
        Ok(Self { browser })
    }

    /// Attach when a debugging Chrome is listening, launch otherwise.
    pub async fn attach_or_launch(endpoint: &str, settings: LaunchSettings) -> Result<Self> {
        match Self::attach(endpoint).await {
            Ok(host) => Ok(host),
            Err(e) => {
                warn!(%endpoint, error = %format!("{:#}", e), "could not attach, launching chrome");
                Self::launch(settings).await
            }
        }
    }

    fn tab(&self, id: &str) -> Result<Arc<Tab>> {
        let tabs = self.browser.get_tabs();
        let tabs = tabs.lock().map_err(|_| anyhow!("tab list lock poisoned"))?;
        tabs.iter()
            .find(|t| t.get_target_id().as_str() == id)
            .cloned()
            .ok_or_else(|| anyhow!("tab {} is no longer open", id))
    }
}

fn handle(tab: &Tab) -> TabHandle {
    TabHandle {
        id: tab.get_target_id().to_string(),
        group_id: Some(AGENT_TAB_GROUP.to_string()),
    }
}

#[async_trait]
impl BrowserHost for ChromeHost {
    async fn open_tab(&self) -> Result<TabHandle> {
        let browser = self.browser.clone();
        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser.new_tab()?;
            tab.navigate_to("about:blank")?;
            Ok(tab)
        })
        .await
        .map_err(|e| anyhow!("open tab task panicked: {}", e))??;
        let handle = handle(&tab);
        debug!(tab = %handle.id, "opened tab");
        Ok(handle)
    }

    async fn find_tab(&self, tab_id: &str) -> Result<Option<TabHandle>> {
        Ok(self.tab(tab_id).ok().map(|tab| handle(&tab)))
    }

    async fn tab_url(&self, tab: &TabHandle) -> Result<String> {
        Ok(self.tab(&tab.id)?.get_url())
    }

    async fn navigate(&self, tab: &TabHandle, url: &str) -> Result<()> {
        let tab = self.tab(&tab.id)?;
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            tab.navigate_to(&url)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("navigate task panicked: {}", e))?
    }

    async fn run_in_page(&self, tab: &TabHandle, script: PageScript, args: Value) -> Result<Value> {
        let tab = self.tab(&tab.id)?;
        // Stringify in the page so only plain JSON crosses the protocol.
        let expression = format!(
            "(async () => JSON.stringify(await ({})({})))()",
            script.source(),
            serde_json::to_string(&args)?
        );
        let name = script.name();
        let remote = tokio::task::spawn_blocking(move || tab.evaluate(&expression, true))
            .await
            .map_err(|e| anyhow!("{} script task panicked: {}", name, e))?
            .with_context(|| format!("{} script failed", name))?;

        match remote.value {
            Some(Value::String(text)) => serde_json::from_str(&text)
                .with_context(|| format!("{} script returned invalid JSON", name)),
            Some(other) => Ok(other),
            None => Ok(Value::Null),
        }
    }
}

/// Reads the browser websocket url from `<endpoint>/json/version`.
pub async fn discover_debugger_url(endpoint: &str) -> Result<String> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let version: Value = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .with_context(|| format!("no debugging chrome at {}", endpoint))?
        .json()
        .await?;
    version
        .get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| anyhow!("{} did not report a webSocketDebuggerUrl", url))
}

fn launch_browser(settings: &LaunchSettings) -> Result<Browser> {
    let chrome_path = match &settings.chrome_path {
        Some(path) => path.clone(),
        None => find_chrome()?,
    };
    let profile = match &settings.profile_dir {
        Some(dir) => dir.clone(),
        None => default_profile_dir()?,
    };
    std::fs::create_dir_all(&profile)
        .with_context(|| format!("cannot create profile dir {}", profile.display()))?;
    info!(chrome = %chrome_path.display(), profile = %profile.display(), headless = settings.headless, "launching chrome");

    let options = LaunchOptions {
        headless: settings.headless,
        path: Some(chrome_path),
        user_data_dir: Some(profile),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };
    Browser::new(options).map_err(|e| anyhow!("browser launch failed: {}", e))
}

fn default_profile_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("no local data directory"))?;
    Ok(base.join("browser-pilot").join("chrome-profile"))
}

fn find_chrome() -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("Chrome executable not found; pass --chrome-path"))
}
