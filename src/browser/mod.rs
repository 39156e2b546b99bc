//! Browser session facade consumed by the agent core.
//!
//! The core never talks CDP directly; it sees an abstract session with state
//! capture, tab control and element interaction by highlight index. `cdp`
//! provides the chromiumoxide-backed default implementation.

mod cdp;
mod launch;

pub use cdp::CdpSession;
pub use launch::{find_browser_executable, launch_browser};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How an agent attaches to a browser session that may already be owned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Clone the session state into an isolated session when already owned
    #[default]
    Copy,
    /// Refuse to attach when already owned
    Strict,
    /// Share the session; steps are serialized via a process-wide lock
    Shared,
}

/// One open tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub url: String,
    pub title: String,
}

/// An interactive DOM node addressable by highlight index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub tag: String,
    pub xpath: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub exact_hash: String,
    pub stable_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ax_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl DomNode {
    /// One-line rendering used in the element tree shown to the LLM
    pub fn render(&self, index: u32) -> String {
        let mut attrs = String::new();
        for key in ["id", "name", "aria-label", "placeholder", "href", "role"] {
            if let Some(value) = self.attributes.get(key)
                && !value.is_empty()
            {
                attrs.push_str(&format!(" {key}=\"{value}\""));
            }
        }
        let text = self.text.as_deref().unwrap_or("").trim();
        let text: String = text.chars().take(80).collect();
        format!("[{index}]<{}{attrs}>{text}</{}>", self.tag, self.tag)
    }
}

/// Mapping from highlight index to the DOM node the LLM addresses by index
pub type SelectorMap = BTreeMap<u32, DomNode>;

/// Everything the agent perceives about the browser in one step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserStateSummary {
    pub url: String,
    pub title: String,
    pub tabs: Vec<TabInfo>,
    #[serde(default)]
    pub selector_map: SelectorMap,
    /// Textual rendering of the interactive element tree
    pub element_tree: String,
    /// Base64-encoded screenshot, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Recent browser event log (navigations, dialogs, downloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_events: Option<String>,
}

/// Options for a state capture
#[derive(Debug, Clone, Default)]
pub struct StateCaptureOptions {
    pub cache_clickable_elements_hashes: bool,
    pub include_screenshot: bool,
    pub include_recent_events: bool,
    pub signal: Option<CancellationToken>,
}

/// Descriptor of an element an action interacted with, kept in history so
/// replay can re-identify the element after the page changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomHistoryElement {
    pub tag: String,
    pub xpath: String,
    pub highlight_index: u32,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub exact_hash: String,
    pub stable_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ax_name: Option<String>,
}

impl DomHistoryElement {
    pub fn from_node(index: u32, node: &DomNode) -> Self {
        Self {
            tag: node.tag.clone(),
            xpath: node.xpath.clone(),
            highlight_index: index,
            attributes: node.attributes.clone(),
            exact_hash: node.exact_hash.clone(),
            stable_hash: node.stable_hash.clone(),
            ax_name: node.ax_name.clone(),
        }
    }
}

/// Browser state as recorded in agent history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserStateHistory {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub tabs: Vec<TabInfo>,
    /// One entry per executed action; `None` when the action touched no element
    #[serde(default)]
    pub interacted_element: Vec<Option<DomHistoryElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
}

/// Cookie as returned by the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Static configuration of a browser session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    /// Seconds to wait between consecutive actions of one step
    #[serde(default)]
    pub wait_between_actions: f64,
}

/// Errors surfaced by browser sessions and action handlers
#[derive(Error, Debug)]
pub enum BrowserError {
    /// An action failed; may carry structured memory for the LLM context
    #[error("{message}")]
    Action {
        message: String,
        short_term_memory: Option<String>,
        long_term_memory: Option<String>,
    },

    #[error("browser session error: {0}")]
    Session(String),

    #[error("element with highlight index {0} not found on current page")]
    ElementNotFound(u32),

    #[error("tab {0} not found")]
    TabNotFound(String),

    #[error("session already claimed by another agent")]
    AlreadyClaimed,

    #[error("shared attachment not supported by this session")]
    SharedUnsupported,

    #[error("browser call aborted")]
    Aborted,

    #[error("CDP error: {0}")]
    Cdp(String),
}

impl BrowserError {
    pub fn action(message: impl Into<String>) -> Self {
        BrowserError::Action {
            message: message.into(),
            short_term_memory: None,
            long_term_memory: None,
        }
    }

    pub fn short_term_memory(&self) -> Option<&str> {
        match self {
            BrowserError::Action {
                short_term_memory, ..
            } => short_term_memory.as_deref(),
            _ => None,
        }
    }

    pub fn long_term_memory(&self) -> Option<&str> {
        match self {
            BrowserError::Action {
                long_term_memory, ..
            } => long_term_memory.as_deref(),
            _ => None,
        }
    }
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Abstract browser session capability set consumed by the agent core and
/// by action handlers.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Stable session identifier (keys the shared step-lock table)
    fn id(&self) -> &str;

    fn profile(&self) -> &BrowserProfile;

    async fn start(&self) -> BrowserResult<()>;
    async fn stop(&self) -> BrowserResult<()>;

    /// Capture the current page state, recovering from transient CDP hiccups
    async fn get_browser_state(
        &self,
        options: StateCaptureOptions,
    ) -> BrowserResult<BrowserStateSummary>;

    async fn current_url(&self) -> BrowserResult<String>;
    async fn current_tab_id(&self) -> BrowserResult<Option<String>>;
    async fn switch_to_tab(&self, tab_id: &str) -> BrowserResult<()>;

    async fn navigate(&self, url: &str, new_tab: bool) -> BrowserResult<()>;
    async fn go_back(&self) -> BrowserResult<()>;
    async fn click_element(&self, index: u32) -> BrowserResult<()>;
    async fn input_text(&self, index: u32, text: &str, clear: bool) -> BrowserResult<()>;
    async fn send_keys(&self, keys: &str) -> BrowserResult<()>;
    async fn scroll_by(&self, dx: i64, dy: i64) -> BrowserResult<()>;

    /// Base64-encoded screenshot of the current page
    async fn take_screenshot(&self, full_page: bool) -> BrowserResult<String>;

    /// Markdown rendering of the current page content
    async fn page_markdown(&self) -> BrowserResult<String>;

    async fn get_cookies(&self) -> BrowserResult<Vec<Cookie>>;

    /// Files downloaded during this session, absolute paths
    async fn downloaded_files(&self) -> Vec<String>;

    /// Attach an agent; `Strict` fails when another agent is attached,
    /// `Shared` fails when the session does not support sharing.
    fn claim_agent(&self, agent_id: &str, mode: AttachMode) -> BrowserResult<()>;
    fn release_agent(&self, agent_id: &str);
    fn get_attached_agent_ids(&self) -> Vec<String>;

    /// Clone the session state into an isolated session (`Copy` mode)
    async fn clone_isolated(&self) -> BrowserResult<Arc<dyn BrowserSession>>;
}

/// Claim bookkeeping shared by session implementations
#[derive(Debug, Default)]
pub struct AgentAttachments {
    attached: std::sync::Mutex<Vec<String>>,
    supports_shared: bool,
}

impl AgentAttachments {
    pub fn new(supports_shared: bool) -> Self {
        Self {
            attached: std::sync::Mutex::new(Vec::new()),
            supports_shared,
        }
    }

    pub fn claim(&self, agent_id: &str, mode: AttachMode) -> BrowserResult<()> {
        let mut attached = self.attached.lock().expect("attachment lock poisoned");
        match mode {
            AttachMode::Strict if !attached.is_empty() => Err(BrowserError::AlreadyClaimed),
            AttachMode::Shared if !self.supports_shared => Err(BrowserError::SharedUnsupported),
            _ => {
                if !attached.iter().any(|a| a == agent_id) {
                    attached.push(agent_id.to_string());
                }
                Ok(())
            }
        }
    }

    pub fn release(&self, agent_id: &str) {
        let mut attached = self.attached.lock().expect("attachment lock poisoned");
        attached.retain(|a| a != agent_id);
    }

    pub fn attached_ids(&self) -> Vec<String> {
        self.attached
            .lock()
            .expect("attachment lock poisoned")
            .clone()
    }
}

// Process-wide step locks for shared-mode sessions, keyed by session id.
// Entries live as long as agents are attached to the session.
static SESSION_STEP_LOCKS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Lock serializing steps of all agents sharing the session
pub fn session_step_lock(session_id: &str) -> Arc<Mutex<()>> {
    SESSION_STEP_LOCKS
        .entry(session_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Drop the session's step lock once no agents remain attached
pub fn cleanup_session_step_lock(session_id: &str) {
    if SESSION_STEP_LOCKS.remove(session_id).is_some() {
        debug!(session_id, "Removed shared step lock");
    }
}

/// Render the selector map as the element tree text shown to the LLM
pub fn render_element_tree(selector_map: &SelectorMap) -> String {
    let mut lines = Vec::with_capacity(selector_map.len());
    for (index, node) in selector_map {
        lines.push(node.render(*index));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: &str) -> DomNode {
        DomNode {
            tag: tag.to_string(),
            xpath: format!("//{tag}[1]"),
            attributes: HashMap::new(),
            exact_hash: "e".into(),
            stable_hash: "s".into(),
            ax_name: None,
            text: Some("Click me".into()),
        }
    }

    #[test]
    fn strict_claim_refuses_second_agent() {
        let attachments = AgentAttachments::new(false);
        attachments.claim("agent-1", AttachMode::Strict).unwrap();
        let err = attachments
            .claim("agent-2", AttachMode::Strict)
            .expect_err("second strict claim must fail");
        assert!(matches!(err, BrowserError::AlreadyClaimed));

        attachments.release("agent-1");
        attachments
            .claim("agent-2", AttachMode::Strict)
            .expect("claim after release");
    }

    #[test]
    fn shared_claim_requires_support() {
        let attachments = AgentAttachments::new(false);
        let err = attachments
            .claim("agent-1", AttachMode::Shared)
            .expect_err("shared must be refused");
        assert!(matches!(err, BrowserError::SharedUnsupported));

        let sharing = AgentAttachments::new(true);
        sharing.claim("agent-1", AttachMode::Shared).unwrap();
        sharing.claim("agent-2", AttachMode::Shared).unwrap();
        assert_eq!(sharing.attached_ids().len(), 2);
    }

    #[test]
    fn step_lock_is_stable_per_session() {
        let a = session_step_lock("sess-lock-test");
        let b = session_step_lock("sess-lock-test");
        assert!(Arc::ptr_eq(&a, &b));
        cleanup_session_step_lock("sess-lock-test");
        let c = session_step_lock("sess-lock-test");
        assert!(!Arc::ptr_eq(&a, &c));
        cleanup_session_step_lock("sess-lock-test");
    }

    #[test]
    fn element_tree_renders_indices_in_order() {
        let mut map = SelectorMap::new();
        map.insert(2, node("a"));
        map.insert(1, node("button"));
        let tree = render_element_tree(&map);
        let lines: Vec<&str> = tree.lines().collect();
        assert!(lines[0].starts_with("[1]<button"));
        assert!(lines[1].starts_with("[2]<a"));
    }
}
