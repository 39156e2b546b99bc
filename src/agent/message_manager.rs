//! Message manager: builds and compacts the ordered LLM message stream.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::plan::Plan;
use crate::agent::prompts::render_state_message;
use crate::agent::views::{
    ActionResult, AgentOutput, AgentSettings, AgentStepInfo, CompactionSettings, Task,
    VisionDetailLevel,
};
use crate::browser::BrowserStateSummary;
use crate::llm::{ChatMessage, ChatModel, ContentPart, ImageUrl, InvokeOptions, LlmError};
use crate::utils::sensitive::{SensitiveData, redact_text};

/// Serializable snapshot of the message stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageManagerState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub context_messages: Vec<String>,
}

/// Ordered message stream: system prompt, task, then per-step state and
/// assistant turns, plus one-shot context nudges living only for the next
/// LLM call.
pub struct MessageManager {
    system_message: ChatMessage,
    task: Task,
    messages: Vec<ChatMessage>,
    context_messages: Vec<String>,
    sensitive_data: Option<SensitiveData>,
}

impl MessageManager {
    pub fn new(system_prompt: String, task: Task, sensitive_data: Option<SensitiveData>) -> Self {
        Self {
            system_message: ChatMessage::system(system_prompt),
            task,
            messages: Vec::new(),
            context_messages: Vec::new(),
            sensitive_data,
        }
    }

    /// Update the stream with the previous step's outcome. Transient context
    /// messages left over from an interrupted call are dropped here.
    pub fn prepare_step_state(
        &mut self,
        last_output: Option<&AgentOutput>,
        _last_result: Option<&[ActionResult]>,
    ) {
        self.context_messages.clear();
        if let Some(output) = last_output
            && let Ok(serialized) = serde_json::to_string(output)
        {
            self.messages.push(ChatMessage::assistant(serialized));
        }
    }

    /// Append the step's state message. Returns the text stored in history.
    pub fn create_state_messages(
        &mut self,
        browser_state: &BrowserStateSummary,
        last_results: Option<&[ActionResult]>,
        step_info: &AgentStepInfo,
        plan: &Plan,
        settings: &AgentSettings,
    ) -> String {
        let text = render_state_message(browser_state, last_results, step_info, plan, settings);

        let include_image =
            settings.use_vision.includes_state_images() && browser_state.screenshot.is_some();
        if include_image {
            let detail = match settings.vision_detail_level {
                VisionDetailLevel::Auto => "auto",
                VisionDetailLevel::Low => "low",
                VisionDetailLevel::High => "high",
            };
            let screenshot = browser_state.screenshot.clone().unwrap_or_default();
            self.messages.push(ChatMessage::user_parts(vec![
                ContentPart::Text { text: text.clone() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/png;base64,{screenshot}"),
                        detail: detail.to_string(),
                        media_type: Some("image/png".to_string()),
                    },
                },
            ]));
        } else {
            self.messages.push(ChatMessage::user(text.clone()));
        }

        text
    }

    /// One-shot nudge living only for the next LLM call
    pub fn add_context_message(&mut self, text: impl Into<String>) {
        self.context_messages.push(text.into());
    }

    pub fn context_messages(&self) -> &[String] {
        &self.context_messages
    }

    /// Drop the nudges after the LLM call consumed them
    pub fn clear_context_messages(&mut self) {
        self.context_messages.clear();
    }

    /// The full outgoing message list, sensitive values redacted
    pub fn messages_for_llm(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + self.context_messages.len() + 2);
        messages.push(self.system_message.clone());
        messages.push(ChatMessage::user(format!(
            "Your task: {}",
            self.task.text
        )));
        messages.extend(self.messages.iter().cloned());
        for context in &self.context_messages {
            messages.push(ChatMessage::user(context.clone()));
        }

        if let Some(sensitive) = &self.sensitive_data {
            for message in &mut messages {
                message.map_text(|t| redact_text(t, sensitive));
            }
        }
        messages
    }

    /// Append an arbitrary user message (replay prompts, re-prompt turns)
    pub fn add_user_message(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text.into()));
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Opportunistically summarize older turns into one condensed user
    /// message, preserving the system prompt, the task, and the most recent
    /// turns. Failures are logged and leave the stream untouched.
    pub async fn maybe_compact_messages(
        &mut self,
        llm: &dyn ChatModel,
        settings: &CompactionSettings,
    ) -> Result<(), LlmError> {
        if !settings.enabled || self.messages.len() <= settings.message_threshold {
            return Ok(());
        }
        let keep = settings.keep_recent_turns * 2;
        if self.messages.len() <= keep {
            return Ok(());
        }
        let split = self.messages.len() - keep;
        let old_messages = &self.messages[..split];

        let mut transcript = String::new();
        for message in old_messages {
            let role = match message.role {
                crate::llm::ChatRole::System => "system",
                crate::llm::ChatRole::User => "user",
                crate::llm::ChatRole::Assistant => "assistant",
                crate::llm::ChatRole::Tool => "tool",
            };
            transcript.push_str(&format!("[{role}] {}\n", message.text()));
        }

        let request = vec![
            ChatMessage::system(
                "Condense the following agent conversation into a compact summary. Keep: \
                 pages visited, actions taken with their outcomes, facts discovered, and \
                 anything still pending. Drop raw page dumps.",
            ),
            ChatMessage::user(transcript),
        ];

        debug!(
            compacting = split,
            keeping = keep,
            "Compacting message history"
        );
        match llm
            .ainvoke(&request, None, InvokeOptions {
                request_type: Some("compaction".to_string()),
                ..Default::default()
            })
            .await
        {
            Ok(result) => {
                let summary = result.completion_text();
                let mut compacted = Vec::with_capacity(keep + 1);
                compacted.push(ChatMessage::user(format!(
                    "[Summary of earlier steps]\n{summary}"
                )));
                compacted.extend(self.messages[split..].iter().cloned());
                self.messages = compacted;
                Ok(())
            }
            Err(e) => {
                warn!("Message compaction failed, keeping full history: {e}");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> MessageManagerState {
        MessageManagerState {
            messages: self.messages.clone(),
            context_messages: self.context_messages.clone(),
        }
    }

    pub fn restore_state(&mut self, state: MessageManagerState) {
        self.messages = state.messages;
        self.context_messages = state.context_messages;
    }
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("messages", &self.messages.len())
            .field("context_messages", &self.context_messages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sensitive::SensitiveEntry;

    fn manager() -> MessageManager {
        MessageManager::new("system".into(), Task::new("do the thing"), None)
    }

    #[test]
    fn context_messages_live_for_one_call() {
        let mut mm = manager();
        mm.add_context_message("nudge");
        let outgoing = mm.messages_for_llm();
        assert!(outgoing.iter().any(|m| m.text() == "nudge"));
        mm.clear_context_messages();
        let outgoing = mm.messages_for_llm();
        assert!(!outgoing.iter().any(|m| m.text() == "nudge"));
    }

    #[test]
    fn outgoing_messages_are_redacted() {
        let mut sensitive = SensitiveData::new();
        sensitive.insert("key".into(), SensitiveEntry::Value("s3cret".into()));
        let mut mm = MessageManager::new(
            "system".into(),
            Task::new("login with s3cret"),
            Some(sensitive),
        );
        mm.add_user_message("the password is s3cret");
        let outgoing = mm.messages_for_llm();
        for message in outgoing {
            assert!(!message.text().contains("s3cret"));
        }
    }

    #[test]
    fn vision_disabled_omits_image_parts() {
        let mut mm = manager();
        let state = BrowserStateSummary {
            screenshot: Some("AAAA".into()),
            ..Default::default()
        };
        let mut settings = AgentSettings::default();
        settings.use_vision = crate::agent::views::VisionMode::Disabled;
        mm.create_state_messages(
            &state,
            None,
            &AgentStepInfo {
                step_number: 1,
                max_steps: 5,
            },
            &Plan::default(),
            &settings,
        );
        assert!(mm.messages_for_llm().iter().all(|m| !m.has_images()));

        settings.use_vision = crate::agent::views::VisionMode::Enabled;
        mm.create_state_messages(
            &state,
            None,
            &AgentStepInfo {
                step_number: 2,
                max_steps: 5,
            },
            &Plan::default(),
            &settings,
        );
        assert!(mm.messages_for_llm().iter().any(|m| m.has_images()));
    }
}
