//! OpenAI-compatible chat completions client.
//!
//! Talks to any `/chat/completions` endpoint (OpenAI, vLLM, Ollama, LM
//! Studio, proxies). Provider failures are translated into the two failure
//! kinds the agent's fallback logic distinguishes: rate limits and provider
//! HTTP errors.

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    ChatInvokeResult, ChatInvokeUsage, ChatMessage, ChatModel, InvokeOptions, LlmError,
    MessageContent,
};

/// Client for an OpenAI-compatible chat completions endpoint
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u64,
}

impl OpenAiChatModel {
    pub fn new(api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: None,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn request_body(&self, messages: &[ChatMessage], output_format: Option<&Value>) -> Value {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let content = match &m.content {
                    MessageContent::Text(t) => Value::String(t.clone()),
                    MessageContent::Parts(parts) => {
                        serde_json::to_value(parts).unwrap_or(Value::Null)
                    }
                };
                json!({
                    "role": serde_json::to_value(m.role).unwrap_or(Value::Null),
                    "content": content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        if let Some(schema) = output_format {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "agent_output",
                    "strict": true,
                    "schema": schema,
                },
            });
        }

        body
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn ainvoke(
        &self,
        messages: &[ChatMessage],
        output_format: Option<&Value>,
        options: InvokeOptions,
    ) -> Result<ChatInvokeResult, LlmError> {
        if let Some(signal) = &options.signal
            && signal.is_cancelled()
        {
            return Err(LlmError::Aborted);
        }

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let body = self.request_body(messages, output_format);

        debug!(
            model = %self.model,
            request_type = options.request_type.as_deref().unwrap_or("agent"),
            "Sending chat completion request"
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(session_id) = &options.session_id {
            request = request.header("x-session-id", session_id.as_str());
        }

        let send = request.send();
        let response = match &options.signal {
            Some(signal) => {
                tokio::select! {
                    _ = signal.cancelled() => return Err(LlmError::Aborted),
                    resp = send => resp,
                }
            }
            None => send.await,
        }
        .map_err(|e| LlmError::Provider(format!("request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Provider(format!("failed to read response body: {e}")))?;

        if status == 429 {
            return Err(LlmError::RateLimit(text));
        }
        if status >= 400 {
            return Err(LlmError::Http {
                status,
                message: text,
            });
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidOutput(format!("non-JSON completion body: {e}")))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LlmError::InvalidOutput("completion missing choices[0].message.content".into())
            })?
            .to_string();

        let usage = parsed.get("usage").map(|u| ChatInvokeUsage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });

        let completion = if output_format.is_some() {
            match serde_json::from_str::<Value>(&content) {
                Ok(v @ Value::Object(_)) => v,
                Ok(other) => {
                    warn!("Structured completion was valid JSON but not an object");
                    other
                }
                // Leave raw text for the agent-side parser, which strips
                // think-tags and code fences before giving up.
                Err(_) => Value::String(content),
            }
        } else {
            Value::String(content)
        };

        Ok(ChatInvokeResult { completion, usage })
    }
}
