//! Stub browser session and scripted chat model for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use pagepilot::browser::{
    AgentAttachments, AttachMode, BrowserError, BrowserProfile, BrowserResult, BrowserSession,
    BrowserStateSummary, Cookie, DomNode, SelectorMap, StateCaptureOptions, TabInfo,
    render_element_tree,
};
use pagepilot::llm::{
    ChatInvokeResult, ChatInvokeUsage, ChatMessage, ChatModel, InvokeOptions, LlmError,
};

/// A DOM node for stub selector maps
pub fn stub_node(tag: &str, exact_hash: &str, stable_hash: &str, xpath: &str) -> DomNode {
    DomNode {
        tag: tag.to_string(),
        xpath: xpath.to_string(),
        attributes: HashMap::new(),
        exact_hash: exact_hash.to_string(),
        stable_hash: stable_hash.to_string(),
        ax_name: None,
        text: Some("stub".to_string()),
    }
}

/// In-memory browser session
pub struct StubBrowser {
    id: String,
    profile: BrowserProfile,
    pub url: Mutex<String>,
    pub tab: Mutex<Option<String>>,
    pub selector_map: Mutex<SelectorMap>,
    pub navigations: Mutex<Vec<(String, bool)>>,
    pub clicks: Mutex<Vec<u32>>,
    pub typed: Mutex<Vec<(u32, String)>>,
    pub markdown: Mutex<String>,
    attachments: AgentAttachments,
    started: AtomicBool,
}

impl StubBrowser {
    pub fn new() -> Self {
        Self {
            id: "stub-session".to_string(),
            profile: BrowserProfile::default(),
            url: Mutex::new("about:blank".to_string()),
            tab: Mutex::new(Some("tab-1".to_string())),
            selector_map: Mutex::new(SelectorMap::new()),
            navigations: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            typed: Mutex::new(Vec::new()),
            markdown: Mutex::new("# Stub page".to_string()),
            attachments: AgentAttachments::new(true),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_selector_map(self, map: SelectorMap) -> Self {
        *self.selector_map.lock().unwrap() = map;
        self
    }

    pub fn clicks(&self) -> Vec<u32> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<(String, bool)> {
        self.navigations.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserSession for StubBrowser {
    fn id(&self) -> &str {
        &self.id
    }

    fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    async fn start(&self) -> BrowserResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> BrowserResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_browser_state(
        &self,
        options: StateCaptureOptions,
    ) -> BrowserResult<BrowserStateSummary> {
        if let Some(signal) = &options.signal
            && signal.is_cancelled()
        {
            return Err(BrowserError::Aborted);
        }
        let url = self.url.lock().unwrap().clone();
        let selector_map = self.selector_map.lock().unwrap().clone();
        let element_tree = render_element_tree(&selector_map);
        Ok(BrowserStateSummary {
            url: url.clone(),
            title: "Stub".to_string(),
            tabs: vec![TabInfo {
                id: "tab-1".to_string(),
                url,
                title: "Stub".to_string(),
            }],
            selector_map,
            element_tree,
            screenshot: options
                .include_screenshot
                .then(|| "c3R1Yi1zY3JlZW5zaG90".to_string()),
            recent_events: options
                .include_recent_events
                .then(|| "navigated".to_string()),
        })
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn current_tab_id(&self) -> BrowserResult<Option<String>> {
        Ok(self.tab.lock().unwrap().clone())
    }

    async fn switch_to_tab(&self, tab_id: &str) -> BrowserResult<()> {
        *self.tab.lock().unwrap() = Some(tab_id.to_string());
        Ok(())
    }

    async fn navigate(&self, url: &str, new_tab: bool) -> BrowserResult<()> {
        self.navigations
            .lock()
            .unwrap()
            .push((url.to_string(), new_tab));
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn go_back(&self) -> BrowserResult<()> {
        Ok(())
    }

    async fn click_element(&self, index: u32) -> BrowserResult<()> {
        if !self.selector_map.lock().unwrap().contains_key(&index) {
            return Err(BrowserError::ElementNotFound(index));
        }
        self.clicks.lock().unwrap().push(index);
        Ok(())
    }

    async fn input_text(&self, index: u32, text: &str, _clear: bool) -> BrowserResult<()> {
        self.typed.lock().unwrap().push((index, text.to_string()));
        Ok(())
    }

    async fn send_keys(&self, _keys: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn scroll_by(&self, _dx: i64, _dy: i64) -> BrowserResult<()> {
        Ok(())
    }

    async fn take_screenshot(&self, _full_page: bool) -> BrowserResult<String> {
        Ok("c3R1Yi1zY3JlZW5zaG90".to_string())
    }

    async fn page_markdown(&self) -> BrowserResult<String> {
        Ok(self.markdown.lock().unwrap().clone())
    }

    async fn get_cookies(&self) -> BrowserResult<Vec<Cookie>> {
        Ok(Vec::new())
    }

    async fn downloaded_files(&self) -> Vec<String> {
        Vec::new()
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
        Ok(Arc::new(StubBrowser::new()))
    }
}

/// One scripted reply of the stub model
pub enum StubReply {
    Json(Value),
    Text(String),
    RateLimited,
    Http(u16),
}

/// Chat model that pops scripted replies, then repeats a default
pub struct StubLlm {
    name: String,
    replies: Mutex<VecDeque<StubReply>>,
    default: Value,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl StubLlm {
    pub fn new(name: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(VecDeque::new()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: StubReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Concatenated text of every message of the given call
    pub fn call_text(&self, call: usize) -> String {
        self.calls.lock().unwrap()[call]
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ChatModel for StubLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ainvoke(
        &self,
        messages: &[ChatMessage],
        _output_format: Option<&Value>,
        options: InvokeOptions,
    ) -> Result<ChatInvokeResult, LlmError> {
        if let Some(signal) = &options.signal
            && signal.is_cancelled()
        {
            return Err(LlmError::Aborted);
        }
        self.calls.lock().unwrap().push(messages.to_vec());

        let reply = self.replies.lock().unwrap().pop_front();
        let completion = match reply {
            Some(StubReply::Json(value)) => value,
            Some(StubReply::Text(text)) => Value::String(text),
            Some(StubReply::RateLimited) => {
                return Err(LlmError::RateLimit("too many requests".into()));
            }
            Some(StubReply::Http(status)) => {
                return Err(LlmError::Http {
                    status,
                    message: "upstream error".into(),
                });
            }
            None => self.default.clone(),
        };

        Ok(ChatInvokeResult {
            completion,
            usage: Some(ChatInvokeUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }
}

/// A `done` completion object
pub fn done_output(success: bool, text: &str) -> Value {
    serde_json::json!({
        "evaluation_previous_goal": "ok",
        "memory": "",
        "next_goal": "finish",
        "action": [{"done": {"success": success, "text": text}}],
    })
}
