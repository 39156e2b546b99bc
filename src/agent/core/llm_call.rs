//! LLM invocation for the decide phase: URL shortening round-trip,
//! completion parsing, empty-action normalization, fallback model switch.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent::Agent;
use crate::agent::views::{ActionInvocation, AgentOutput};
use crate::agent::{AgentError, AgentResult};
use crate::llm::{ChatInvokeResult, ChatMessage, InvokeOptions, LlmError};
use crate::registry::ActionModel;
use crate::tools::synthetic_failed_done;
use crate::utils::url::{URL_SHORTENING_LIMIT, shorten_urls_in_text, unshorten_value};

const EMPTY_ACTION_REPROMPT: &str = "Your previous response contained no action. Respond again \
with at least one action from the allowed set, or use \"done\" if the task is finished.";

impl Agent {
    /// Ask the LLM for the step's output and normalize it against the
    /// allowed action set.
    pub(crate) async fn decide(
        &mut self,
        action_model: &ActionModel,
        signal: &CancellationToken,
    ) -> AgentResult<AgentOutput> {
        let schema = AgentOutput::output_schema(
            self.settings.flash_mode,
            self.settings.use_thinking,
            self.settings.planning_enabled(),
            action_model.available_actions(),
        );

        // Shorten long URLs in outgoing text, keeping the reverse map so the
        // parsed output can be restored verbatim.
        let mut messages = self.message_manager.messages_for_llm();
        let mut url_map: HashMap<String, String> = HashMap::new();
        for message in &mut messages {
            message.map_text(|text| {
                let (shortened, map) = shorten_urls_in_text(text, URL_SHORTENING_LIMIT);
                url_map.extend(map);
                shortened
            });
        }

        let result = self.invoke_llm(&messages, &schema, signal).await?;
        if let Some(usage) = &result.usage {
            self.usage.add(usage);
        }
        self.save_conversation(&messages, &result);

        let mut parsed = match &result.completion {
            Value::Object(_) => result.completion.clone(),
            _ => extract_json_payload(&result.completion_text())?,
        };
        unshorten_value(&mut parsed, &url_map);

        let mut output: AgentOutput = serde_json::from_value(parsed)
            .map_err(|e| AgentError::JsonParse(format!("agent output did not validate: {e}")))?;
        output.action.retain(|a| !a.is_empty());

        if output.action.is_empty() {
            warn!("LLM returned no actions; re-prompting once");
            output = self
                .reprompt_for_actions(&messages, &schema, &url_map, signal)
                .await
                .unwrap_or(output);
        }
        if output.action.is_empty() {
            output.action = vec![ActionInvocation::new(
                "done",
                synthetic_failed_done("No next action returned by LLM!"),
            )];
        }

        // done is only legal as the sole action of a step
        if output.action.len() > 1 && self.registry.resolve_name(&output.action[0].name) == "done"
        {
            warn!("done was combined with other actions; keeping only done");
            output.action.truncate(1);
        }

        if output.action.len() > self.settings.max_actions_per_step {
            warn!(
                "LLM returned {} actions, capping at {}",
                output.action.len(),
                self.settings.max_actions_per_step
            );
            output.action.truncate(self.settings.max_actions_per_step);
        }

        let mut validated = Vec::with_capacity(output.action.len());
        for invocation in &output.action {
            validated.push(self.registry.validate_invocation(invocation, action_model)?);
        }
        output.action = validated;

        self.message_manager.clear_context_messages();
        Ok(output)
    }

    /// One clarifying retry when the model returned only empty actions
    async fn reprompt_for_actions(
        &mut self,
        messages: &[ChatMessage],
        schema: &Value,
        url_map: &HashMap<String, String>,
        signal: &CancellationToken,
    ) -> Option<AgentOutput> {
        let mut retry_messages = messages.to_vec();
        retry_messages.push(ChatMessage::user(EMPTY_ACTION_REPROMPT));

        let result = match self.invoke_llm(&retry_messages, schema, signal).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Re-prompt failed: {e}");
                return None;
            }
        };
        if let Some(usage) = &result.usage {
            self.usage.add(usage);
        }

        let mut parsed = match &result.completion {
            Value::Object(_) => result.completion.clone(),
            _ => extract_json_payload(&result.completion_text()).ok()?,
        };
        unshorten_value(&mut parsed, url_map);

        let mut output: AgentOutput = serde_json::from_value(parsed).ok()?;
        output.action.retain(|a| !a.is_empty());
        (!output.action.is_empty()).then_some(output)
    }

    /// Invoke the active model under the LLM wall clock, switching
    /// permanently to the fallback model on eligible provider failures.
    pub(crate) async fn invoke_llm(
        &mut self,
        messages: &[ChatMessage],
        schema: &Value,
        signal: &CancellationToken,
    ) -> AgentResult<ChatInvokeResult> {
        let seconds = self.settings.llm_timeout;
        let timeout = Duration::from_secs(seconds);
        let options = InvokeOptions {
            signal: Some(signal.clone()),
            session_id: Some(self.session_id.clone()),
            request_type: Some("agent".to_string()),
        };

        let llm = self.active_llm();
        let first = match tokio::time::timeout(
            timeout,
            llm.ainvoke(messages, Some(schema), options.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                signal.cancel();
                return Err(AgentError::Llm(LlmError::Timeout { seconds }));
            }
        };

        match first {
            Ok(result) => Ok(result),
            Err(e) if e.is_fallback_eligible()
                && self.fallback_llm.is_some()
                && !self.using_fallback =>
            {
                warn!("Primary model failed ({e}); switching permanently to fallback model");
                self.using_fallback = true;
                let fallback = self.active_llm();
                info!(model = fallback.name(), "Fallback model registered for token accounting");
                match tokio::time::timeout(
                    timeout,
                    fallback.ainvoke(messages, Some(schema), options),
                )
                .await
                {
                    Ok(result) => result.map_err(AgentError::Llm),
                    Err(_) => {
                        signal.cancel();
                        Err(AgentError::Llm(LlmError::Timeout { seconds }))
                    }
                }
            }
            Err(e) => Err(AgentError::Llm(e)),
        }
    }

    /// Persist the step's outgoing messages and raw completion when
    /// conversation saving is configured
    fn save_conversation(&self, messages: &[ChatMessage], result: &ChatInvokeResult) {
        let Some(dir) = &self.settings.save_conversation_path else {
            return;
        };
        let path = dir.join(format!("conversation_step_{}.txt", self.state.n_steps));
        let mut contents = String::new();
        for message in messages {
            contents.push_str(&format!("--- {:?} ---\n{}\n\n", message.role, message.text()));
        }
        contents.push_str(&format!(
            "--- completion ---\n{}\n",
            result.completion_text()
        ));
        if let Err(e) = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, contents))
        {
            warn!("Failed to save conversation to {}: {e}", path.display());
        } else {
            debug!("Saved conversation to {}", path.display());
        }
    }
}

/// Parse an LLM completion into its JSON payload: strip `<think>` blocks,
/// unwrap an optional ```json fence, and isolate the first top-level JSON
/// object.
pub(crate) fn extract_json_payload(raw: &str) -> AgentResult<Value> {
    let mut text = raw.trim().to_string();
    while let (Some(start), Some(end)) = (text.find("<think>"), text.find("</think>")) {
        if end < start {
            break;
        }
        text.replace_range(start..end + "</think>".len(), "");
    }

    let trimmed = text.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        trimmed
    };

    let start = body
        .find('{')
        .ok_or_else(|| AgentError::JsonParse("no JSON object in LLM output".into()))?;
    let candidate = &body[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;
    for (i, ch) in candidate.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| AgentError::JsonParse("unterminated JSON object".into()))?;
    serde_json::from_str(&candidate[..=end])
        .map_err(|e| AgentError::JsonParse(format!("invalid JSON in LLM output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json() {
        let value = extract_json_payload(r#"{"action": [{"wait": {}}]}"#).unwrap();
        assert!(value["action"].is_array());
    }

    #[test]
    fn strips_think_blocks_and_fences() {
        let raw = "<think>let me reason...\nmore</think>\n```json\n{\"next_goal\": \"go\", \
                   \"action\": [{\"go_back\": {}}]}\n```";
        let value = extract_json_payload(raw).unwrap();
        assert_eq!(value["next_goal"], "go");
    }

    #[test]
    fn isolates_first_top_level_object() {
        let raw = "Sure! Here is the plan: {\"action\": [{\"wait\": {\"seconds\": 1}}]} trailing";
        let value = extract_json_payload(raw).unwrap();
        assert_eq!(value, json!({"action": [{"wait": {"seconds": 1}}]}));
    }

    #[test]
    fn handles_braces_inside_strings() {
        let raw = r#"{"memory": "saw {weird} text", "action": [{"wait": {}}]}"#;
        let value = extract_json_payload(raw).unwrap();
        assert_eq!(value["memory"], "saw {weird} text");
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(extract_json_payload("no json here at all").is_err());
        assert!(extract_json_payload("{\"unterminated\": true").is_err());
    }
}
