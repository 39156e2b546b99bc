//! chromiumoxide-backed browser session.
//!
//! Elements are addressed by highlight index: a state capture injects an
//! indexing script that tags interactive elements with `data-pp-index`, and
//! interaction methods resolve `[data-pp-index="N"]` selectors.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AgentAttachments, AttachMode, BrowserError, BrowserProfile, BrowserResult,
    BrowserStateSummary, BrowserSession, Cookie, DomNode, SelectorMap, StateCaptureOptions,
    TabInfo, render_element_tree,
};
use crate::browser::launch::launch_browser;

const RECENT_EVENT_CAPACITY: usize = 20;

// Tags interactive elements with data-pp-index and returns their descriptors
// plus the visible page text used for stagnation fingerprints.
const INDEX_SCRIPT: &str = r##"(() => {
  const selectors = 'a, button, input, select, textarea, [role="button"], [role="link"], [role="menuitem"], [role="tab"], [onclick], [contenteditable="true"]';
  const nodes = [];
  const seen = new Set();
  let index = 1;
  const xpathOf = (el) => {
    const parts = [];
    for (let node = el; node && node.nodeType === Node.ELEMENT_NODE; node = node.parentNode) {
      let i = 1;
      for (let sib = node.previousElementSibling; sib; sib = sib.previousElementSibling) {
        if (sib.tagName === node.tagName) i += 1;
      }
      parts.unshift(node.tagName.toLowerCase() + '[' + i + ']');
    }
    return '//' + parts.join('/');
  };
  for (const el of document.querySelectorAll(selectors)) {
    if (seen.has(el)) continue;
    seen.add(el);
    const rect = el.getBoundingClientRect();
    if (rect.width === 0 || rect.height === 0) continue;
    el.setAttribute('data-pp-index', String(index));
    const attributes = {};
    for (const attr of el.attributes) {
      if (attr.name === 'data-pp-index') continue;
      attributes[attr.name] = attr.value;
    }
    nodes.push({
      index,
      tag: el.tagName.toLowerCase(),
      xpath: xpathOf(el),
      attributes,
      text: (el.innerText || el.value || '').slice(0, 120),
      ax_name: el.getAttribute('aria-label') || el.getAttribute('title') || null,
    });
    index += 1;
  }
  return { nodes, text: document.body ? document.body.innerText.slice(0, 4000) : '' };
})()"##;

#[derive(Debug, Deserialize)]
struct IndexedNode {
    index: u32,
    tag: String,
    xpath: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ax_name: Option<String>,
}

/// Launched browser, its CDP handler task, and the profile directory the
/// session created for it.
///
/// The handler MUST be aborted when the browser goes away, otherwise it runs
/// indefinitely against a dead websocket. The profile directory is removed
/// on drop; Chrome has released its locks by then because `Browser::drop`
/// kills the process.
struct BrowserHandle {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        self.handler.abort();
        if let Some(dir) = self.user_data_dir.take()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            warn!("Failed to clean up user data dir {}: {}", dir.display(), e);
        }
    }
}

#[derive(Default)]
struct TabRegistry {
    tabs: Vec<(String, Page)>,
    current: Option<String>,
}

impl TabRegistry {
    fn current_page(&self) -> Option<Page> {
        let id = self.current.as_ref()?;
        self.tabs
            .iter()
            .find(|(tab_id, _)| tab_id == id)
            .map(|(_, page)| page.clone())
    }
}

/// Default `BrowserSession` implementation over a locally launched Chromium
pub struct CdpSession {
    id: String,
    profile: BrowserProfile,
    headless: bool,
    disable_security: bool,
    handle: Mutex<Option<Arc<BrowserHandle>>>,
    tabs: Mutex<TabRegistry>,
    recent_events: std::sync::Mutex<VecDeque<String>>,
    attachments: AgentAttachments,
}

impl CdpSession {
    pub fn new(profile: BrowserProfile) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            profile,
            headless: true,
            disable_security: false,
            handle: Mutex::new(None),
            tabs: Mutex::new(TabRegistry::default()),
            recent_events: std::sync::Mutex::new(VecDeque::new()),
            attachments: AgentAttachments::new(true),
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_disable_security(mut self, disable_security: bool) -> Self {
        self.disable_security = disable_security;
        self
    }

    fn record_event(&self, event: impl Into<String>) {
        let mut events = self.recent_events.lock().expect("event log poisoned");
        if events.len() >= RECENT_EVENT_CAPACITY {
            events.pop_front();
        }
        events.push_back(event.into());
    }

    async fn current_page(&self) -> BrowserResult<Page> {
        self.tabs
            .lock()
            .await
            .current_page()
            .ok_or_else(|| BrowserError::Session("no page open; call start() first".into()))
    }

    async fn find_indexed_element(&self, index: u32) -> BrowserResult<Element> {
        let page = self.current_page().await?;
        let selector = format!("[data-pp-index=\"{index}\"]");
        page.find_element(selector.as_str())
            .await
            .map_err(|_| BrowserError::ElementNotFound(index))
    }

    async fn capture_state(
        &self,
        options: &StateCaptureOptions,
    ) -> BrowserResult<BrowserStateSummary> {
        if let Some(signal) = &options.signal
            && signal.is_cancelled()
        {
            return Err(BrowserError::Aborted);
        }

        let page = self.current_page().await?;
        let url = page
            .url()
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?
            .unwrap_or_else(|| "about:blank".to_string());

        let title = page
            .evaluate("document.title")
            .await
            .ok()
            .and_then(|r| r.value().and_then(|v| v.as_str().map(str::to_string)))
            .unwrap_or_default();

        let indexed = page
            .evaluate(INDEX_SCRIPT)
            .await
            .map_err(|e| BrowserError::Cdp(format!("element indexing failed: {e}")))?;

        let mut selector_map = SelectorMap::new();
        if let Some(value) = indexed.value()
            && let Some(nodes) = value.get("nodes")
        {
            let nodes: Vec<IndexedNode> =
                serde_json::from_value(nodes.clone()).unwrap_or_default();
            for node in nodes {
                selector_map.insert(node.index, build_dom_node(&node));
            }
        }

        let screenshot = if options.include_screenshot {
            match self.take_screenshot(false).await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Screenshot capture failed, continuing without: {e}");
                    None
                }
            }
        } else {
            None
        };

        let recent_events = if options.include_recent_events {
            let events = self.recent_events.lock().expect("event log poisoned");
            if events.is_empty() {
                None
            } else {
                Some(events.iter().cloned().collect::<Vec<_>>().join("\n"))
            }
        } else {
            None
        };

        let tabs = self.list_tabs().await;
        let element_tree = render_element_tree(&selector_map);

        Ok(BrowserStateSummary {
            url,
            title,
            tabs,
            selector_map,
            element_tree,
            screenshot,
            recent_events,
        })
    }

    async fn list_tabs(&self) -> Vec<TabInfo> {
        let registry = self.tabs.lock().await;
        let mut tabs = Vec::with_capacity(registry.tabs.len());
        for (tab_id, page) in &registry.tabs {
            let url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "about:blank".to_string());
            tabs.push(TabInfo {
                id: tab_id.clone(),
                url,
                title: String::new(),
            });
        }
        tabs
    }
}

fn build_dom_node(node: &IndexedNode) -> DomNode {
    let mut sorted: Vec<(&String, &String)> = node.attributes.iter().collect();
    sorted.sort();

    let mut exact = Sha256::new();
    exact.update(node.tag.as_bytes());
    exact.update(node.xpath.as_bytes());
    for (key, value) in &sorted {
        exact.update(key.as_bytes());
        exact.update(value.as_bytes());
    }

    let mut stable = Sha256::new();
    stable.update(node.tag.as_bytes());
    for key in ["id", "name", "aria-label", "placeholder", "type"] {
        if let Some(value) = node.attributes.get(key) {
            stable.update(key.as_bytes());
            stable.update(value.as_bytes());
        }
    }
    if let Some(text) = &node.text {
        stable.update(text.trim().as_bytes());
    }

    DomNode {
        tag: node.tag.clone(),
        xpath: node.xpath.clone(),
        attributes: node.attributes.clone(),
        exact_hash: hex::encode(&exact.finalize()[..16]),
        stable_hash: hex::encode(&stable.finalize()[..16]),
        ax_name: node.ax_name.clone(),
        text: node.text.clone(),
    }
}

#[async_trait]
impl BrowserSession for CdpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    async fn start(&self) -> BrowserResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        // The session owns the profile directory for its whole lifetime:
        // created here, removed when the browser handle drops.
        let profile_dir =
            std::env::temp_dir().join(format!("pagepilot_session_{}", &self.id[..8]));
        std::fs::create_dir_all(&profile_dir)
            .map_err(|e| BrowserError::Session(format!("cannot create profile dir: {e}")))?;

        let launched = launch_browser(self.headless, &profile_dir, self.disable_security).await;
        let (browser, handler) = match launched {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_dir_all(&profile_dir) {
                    warn!(
                        "Could not remove unused profile dir {}: {remove_err}",
                        profile_dir.display()
                    );
                }
                return Err(BrowserError::Session(e.to_string()));
            }
        };

        // From here the handle owns cleanup, so a failed first page still
        // tears down the browser, handler task, and profile directory.
        let new_handle = Arc::new(BrowserHandle {
            browser,
            handler,
            user_data_dir: Some(profile_dir),
        });

        let page = new_handle
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?;

        let tab_id = Uuid::new_v4().to_string();
        let mut registry = self.tabs.lock().await;
        registry.tabs.push((tab_id.clone(), page));
        registry.current = Some(tab_id);

        *handle = Some(new_handle);

        info!(session_id = %self.id, "Browser session started");
        Ok(())
    }

    async fn stop(&self) -> BrowserResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.take().is_some() {
            // Dropping the handle aborts the CDP handler task and removes the
            // user data directory; Browser::drop kills the Chrome process.
            info!(session_id = %self.id, "Browser session stopped");
        }
        self.tabs.lock().await.tabs.clear();
        Ok(())
    }

    async fn get_browser_state(
        &self,
        options: StateCaptureOptions,
    ) -> BrowserResult<BrowserStateSummary> {
        match self.capture_state(&options).await {
            Ok(state) => Ok(state),
            Err(BrowserError::Aborted) => Err(BrowserError::Aborted),
            Err(e) => {
                // One retry after a short settle covers transient CDP races
                // around navigation commits.
                debug!("State capture failed ({e}), retrying once");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                self.capture_state(&options).await
            }
        }
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let page = self.current_page().await?;
        Ok(page
            .url()
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn current_tab_id(&self) -> BrowserResult<Option<String>> {
        Ok(self.tabs.lock().await.current.clone())
    }

    async fn switch_to_tab(&self, tab_id: &str) -> BrowserResult<()> {
        let mut registry = self.tabs.lock().await;
        if !registry.tabs.iter().any(|(id, _)| id == tab_id) {
            return Err(BrowserError::TabNotFound(tab_id.to_string()));
        }
        registry.current = Some(tab_id.to_string());
        drop(registry);
        self.record_event(format!("Switched to tab {tab_id}"));
        Ok(())
    }

    async fn navigate(&self, url: &str, new_tab: bool) -> BrowserResult<()> {
        if new_tab {
            let handle = self.handle.lock().await;
            let handle = handle
                .as_ref()
                .ok_or_else(|| BrowserError::Session("session not started".into()))?
                .clone();
            let page = handle
                .browser
                .new_page(url)
                .await
                .map_err(|e| BrowserError::Cdp(e.to_string()))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| BrowserError::Cdp(e.to_string()))?;
            let tab_id = Uuid::new_v4().to_string();
            let mut registry = self.tabs.lock().await;
            registry.tabs.push((tab_id.clone(), page));
            registry.current = Some(tab_id);
        } else {
            let page = self.current_page().await?;
            page.goto(url)
                .await
                .map_err(|e| BrowserError::action(format!("navigation to {url} failed: {e}")))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| BrowserError::Cdp(e.to_string()))?;
        }
        self.record_event(format!("Navigated to {url}"));
        Ok(())
    }

    async fn go_back(&self) -> BrowserResult<()> {
        let page = self.current_page().await?;
        page.evaluate("history.back()")
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| BrowserError::Cdp(e.to_string()))?;
        self.record_event("Navigated back");
        Ok(())
    }

    async fn click_element(&self, index: u32) -> BrowserResult<()> {
        let element = self.find_indexed_element(index).await?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| BrowserError::action(format!("scroll into view failed: {e}")))?;
        let point = element.clickable_point().await.map_err(|e| {
            BrowserError::Action {
                message: format!("element {index} has no clickable point: {e}"),
                short_term_memory: Some(format!(
                    "Element {index} could not be clicked; it may be covered or hidden."
                )),
                long_term_memory: None,
            }
        })?;
        let page = self.current_page().await?;
        page.click(point)
            .await
            .map_err(|e| BrowserError::action(format!("click on element {index} failed: {e}")))?;
        self.record_event(format!("Clicked element {index}"));
        Ok(())
    }

    async fn input_text(&self, index: u32, text: &str, clear: bool) -> BrowserResult<()> {
        let element = self.find_indexed_element(index).await?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| BrowserError::action(format!("scroll into view failed: {e}")))?;
        // Click to focus; typing into an unfocused element silently no-ops.
        let point = element
            .clickable_point()
            .await
            .map_err(|e| BrowserError::action(format!("element {index} not focusable: {e}")))?;
        let page = self.current_page().await?;
        page.click(point)
            .await
            .map_err(|e| BrowserError::action(format!("focus click failed: {e}")))?;
        if clear {
            element
                .call_js_fn("function() { this.value = ''; }", false)
                .await
                .map_err(|e| BrowserError::action(format!("clearing element failed: {e}")))?;
        }
        element
            .type_str(text)
            .await
            .map_err(|e| BrowserError::action(format!("typing into element failed: {e}")))?;
        self.record_event(format!("Typed into element {index}"));
        Ok(())
    }

    async fn send_keys(&self, keys: &str) -> BrowserResult<()> {
        let page = self.current_page().await?;
        // Dispatches to the focused element; Enter additionally submits the
        // enclosing form, which is what callers almost always want.
        let script = format!(
            r#"(() => {{
  const key = {key:?};
  const el = document.activeElement || document.body;
  el.dispatchEvent(new KeyboardEvent('keydown', {{ key, bubbles: true }}));
  el.dispatchEvent(new KeyboardEvent('keyup', {{ key, bubbles: true }}));
  if (key === 'Enter' && el.form) {{ el.form.requestSubmit(); }}
  return true;
}})()"#,
            key = keys
        );
        page.evaluate(script)
            .await
            .map_err(|e| BrowserError::action(format!("send_keys failed: {e}")))?;
        self.record_event(format!("Sent keys {keys}"));
        Ok(())
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> BrowserResult<()> {
        let page = self.current_page().await?;
        page.evaluate(format!("window.scrollBy({dx}, {dy})"))
            .await
            .map_err(|e| BrowserError::action(format!("scroll failed: {e}")))?;
        self.record_event(format!("Scrolled by ({dx}, {dy})"));
        Ok(())
    }

    async fn take_screenshot(&self, full_page: bool) -> BrowserResult<String> {
        let page = self.current_page().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        let bytes = page
            .screenshot(params)
            .await
            .map_err(|e| BrowserError::Cdp(format!("screenshot failed: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    async fn page_markdown(&self) -> BrowserResult<String> {
        let page = self.current_page().await?;
        let html = page
            .content()
            .await
            .map_err(|e| BrowserError::Cdp(format!("content fetch failed: {e}")))?;
        Ok(html2md::parse_html(&html))
    }

    async fn get_cookies(&self) -> BrowserResult<Vec<Cookie>> {
        let page = self.current_page().await?;
        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| BrowserError::Cdp(format!("cookie fetch failed: {e}")))?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: Some(c.domain),
                path: Some(c.path),
            })
            .collect())
    }

    async fn downloaded_files(&self) -> Vec<String> {
        let Some(downloads_path) = &self.profile.downloads_path else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(downloads_path) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .map(|e| e.path().to_string_lossy().to_string())
            .collect();
        files.sort();
        files
    }

    fn claim_agent(&self, agent_id: &str, mode: AttachMode) -> BrowserResult<()> {
        self.attachments.claim(agent_id, mode)
    }

    fn release_agent(&self, agent_id: &str) {
        self.attachments.release(agent_id);
    }

    fn get_attached_agent_ids(&self) -> Vec<String> {
        self.attachments.attached_ids()
    }

    async fn clone_isolated(&self) -> BrowserResult<Arc<dyn BrowserSession>> {
        // Isolated clone shares nothing but the launch configuration; it
        // starts its own browser on demand.
        let clone = CdpSession::new(self.profile.clone())
            .with_headless(self.headless)
            .with_disable_security(self.disable_security);
        Ok(Arc::new(clone))
    }
}
