//! Loop detection over recent action and page fingerprints.
//!
//! The detector has no authority to abort the agent; its only output is a
//! nudge message injected into the next LLM call.

use std::collections::VecDeque;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Actions that legitimately repeat and never count as a loop
const EXEMPT_ACTIONS: &[&str] = &["wait", "done", "go_back"];

const DEFAULT_WINDOW: usize = 4;

/// Sliding-window detector for repeated actions and stagnant pages
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    action_fingerprints: VecDeque<String>,
    page_fingerprints: VecDeque<String>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LoopDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            action_fingerprints: VecDeque::new(),
            page_fingerprints: VecDeque::new(),
        }
    }

    pub fn record_action(&mut self, name: &str, params: &Value) {
        if EXEMPT_ACTIONS.contains(&name) {
            return;
        }
        let fingerprint = format!("{name}:{}", canonical_json(params));
        push_bounded(&mut self.action_fingerprints, fingerprint, self.window);
    }

    pub fn record_page_state(&mut self, url: &str, dom_text: &str, element_count: usize) {
        let digest = Sha256::digest(dom_text.as_bytes());
        let fingerprint = format!("{url}|{}|{element_count}", hex::encode(&digest[..8]));
        push_bounded(&mut self.page_fingerprints, fingerprint, self.window);
    }

    /// Highest occurrence count of any single action fingerprint in the window
    pub fn max_repetition_count(&self) -> usize {
        let mut best = 0;
        for fingerprint in &self.action_fingerprints {
            let count = self
                .action_fingerprints
                .iter()
                .filter(|f| *f == fingerprint)
                .count();
            best = best.max(count);
        }
        best
    }

    /// Number of trailing page captures that showed no change
    pub fn consecutive_stagnant_pages(&self) -> usize {
        let Some(last) = self.page_fingerprints.back() else {
            return 0;
        };
        let run = self
            .page_fingerprints
            .iter()
            .rev()
            .take_while(|f| *f == last)
            .count();
        run.saturating_sub(1)
    }

    /// Nudge text when a loop is detected, `None` otherwise
    pub fn get_nudge_message(&self) -> Option<String> {
        if self.max_repetition_count() >= self.window {
            return Some(format!(
                "You have repeated the same action {} times without visible progress. \
                 Break the loop: interact with a different element, scroll to reveal new \
                 content, or reconsider your current goal.",
                self.max_repetition_count()
            ));
        }
        if self.consecutive_stagnant_pages() >= self.window {
            return Some(
                "The page has not changed across your last several actions. Your approach \
                 is not working; try a different element or navigate elsewhere."
                    .to_string(),
            );
        }
        None
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, value: String, capacity: usize) {
    if buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

/// JSON rendering with object keys sorted recursively, so fingerprints are
/// insensitive to parameter order
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}
