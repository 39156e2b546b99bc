//! LLM facade: structured-output chat invocation with cancellation support.
//!
//! The agent core only depends on the [`ChatModel`] trait; `openai` provides
//! a concrete client for OpenAI-compatible endpoints.

mod openai;

pub use openai::OpenAiChatModel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Message role in a chat conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Image reference inside a message part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default = "default_detail")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

fn default_detail() -> String {
    "auto".to_string()
}

/// One typed part of a multi-part message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message content: plain text or an ordered list of typed parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Concatenated text of all textual content (image parts skipped)
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Rewrite every textual fragment in place. Used for sensitive-data
    /// redaction and URL shortening before messages leave the process.
    pub fn map_text(&mut self, mut f: impl FnMut(&str) -> String) {
        match &mut self.content {
            MessageContent::Text(t) => *t = f(t),
            MessageContent::Parts(parts) => {
                for part in parts.iter_mut() {
                    if let ContentPart::Text { text } = part {
                        *text = f(text);
                    }
                }
            }
        }
    }

    /// Whether any part carries an image
    pub fn has_images(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        }
    }
}

/// Token accounting for a single invocation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatInvokeUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Result of a chat invocation. `completion` is a JSON object when an
/// output format was requested, otherwise a JSON string of free text.
#[derive(Debug, Clone)]
pub struct ChatInvokeResult {
    pub completion: Value,
    pub usage: Option<ChatInvokeUsage>,
}

impl ChatInvokeResult {
    /// The completion as text: the raw string for free-text completions,
    /// the serialized object otherwise.
    pub fn completion_text(&self) -> String {
        match &self.completion {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Per-call options threaded through to the provider
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Abort signal; implementations must give up promptly and surface
    /// [`LlmError::Aborted`] once cancelled.
    pub signal: Option<CancellationToken>,
    pub session_id: Option<String>,
    pub request_type: Option<String>,
}

/// Failure kinds surfaced by chat model implementations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("rate limited by provider: {0}")]
    RateLimit(String),

    #[error("provider HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("LLM call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("LLM call aborted")]
    Aborted,

    #[error("invalid LLM output: {0}")]
    InvalidOutput(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// Whether this failure should trigger a switch to the fallback model.
    /// Covers provider rate limits and the retryable/auth HTTP statuses.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            LlmError::RateLimit(_) => true,
            LlmError::Http { status, .. } => {
                matches!(status, 401 | 402 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}

/// Structured-output-capable chat model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier used for logging and token accounting
    fn name(&self) -> &str;

    /// Invoke the model. When `output_format` (a JSON schema) is provided the
    /// completion must be a JSON object conforming to it.
    async fn ainvoke(
        &self,
        messages: &[ChatMessage],
        output_format: Option<&Value>,
        options: InvokeOptions,
    ) -> Result<ChatInvokeResult, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_text_rewrites_all_text_parts() {
        let mut msg = ChatMessage::user_parts(vec![
            ContentPart::Text {
                text: "hello".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAA".into(),
                    detail: "auto".into(),
                    media_type: None,
                },
            },
            ContentPart::Text {
                text: "world".into(),
            },
        ]);
        msg.map_text(|t| t.to_uppercase());
        assert_eq!(msg.text(), "HELLO\nWORLD");
        assert!(msg.has_images());
    }

    #[test]
    fn fallback_eligibility_matches_listed_statuses() {
        for status in [401u16, 402, 429, 500, 502, 503, 504] {
            assert!(
                LlmError::Http {
                    status,
                    message: String::new()
                }
                .is_fallback_eligible(),
                "status {status} should be eligible"
            );
        }
        assert!(LlmError::RateLimit("slow down".into()).is_fallback_eligible());
        assert!(
            !LlmError::Http {
                status: 404,
                message: String::new()
            }
            .is_fallback_eligible()
        );
        assert!(!LlmError::Aborted.is_fallback_eligible());
    }

    #[test]
    fn message_content_roundtrips_through_json() {
        let msg = ChatMessage::user_parts(vec![ContentPart::Text {
            text: "state".into(),
        }]);
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: ChatMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }
}
