//! History replay: re-run a recorded history on the current browser session
//! with element re-identification and recovery heuristics.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::core::Agent;
use crate::agent::views::{ActionResult, AgentHistory, AgentHistoryList};
use crate::agent::{AgentError, AgentResult};
use crate::browser::{DomHistoryElement, SelectorMap, StateCaptureOptions};
use crate::llm::{ChatMessage, ChatModel, InvokeOptions};

const ELEMENT_WAIT_CAP: Duration = Duration::from_secs(15);
const ELEMENT_WAIT_POLL: Duration = Duration::from_secs(1);

/// Options for [`Agent::rerun_history`]
#[derive(Clone, Default)]
pub struct ReplayOptions {
    /// Retries per recorded step before giving up on it
    pub max_retries: Option<usize>,
    /// Skip steps whose recording already contained errors
    pub skip_failures: bool,
    /// Default delay between steps when no interval was recorded
    pub delay_between_actions: Option<f64>,
    /// Cap applied to recorded step intervals
    pub max_step_interval: Option<f64>,
    /// Minimum interactive elements to wait for before matching
    pub wait_for_elements: Option<usize>,
    pub summary_llm: Option<Arc<dyn ChatModel>>,
    pub ai_step_llm: Option<Arc<dyn ChatModel>>,
    pub signal: Option<CancellationToken>,
}

impl ReplayOptions {
    fn max_retries(&self) -> usize {
        self.max_retries.unwrap_or(3)
    }

    fn default_delay(&self) -> f64 {
        self.delay_between_actions.unwrap_or(2.0)
    }

    fn max_step_interval(&self) -> f64 {
        self.max_step_interval.unwrap_or(10.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Failed,
}

/// Structured verdict over a finished replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub summary: String,
    pub success: bool,
    pub completion_status: CompletionStatus,
}

/// A literal recorded value that can be substituted on replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayVariable {
    pub name: String,
    pub value: String,
    pub step: usize,
    pub action: String,
    pub field: String,
}

/// Identify substitutable literals in a recorded history: typed text and
/// navigated URLs.
pub fn detect_variables(history: &AgentHistoryList) -> Vec<ReplayVariable> {
    let mut variables = Vec::new();
    let mut text_count = 0usize;
    let mut url_count = 0usize;
    for (step, entry) in history.history.iter().enumerate() {
        let Some(output) = &entry.model_output else {
            continue;
        };
        for action in &output.action {
            match action.name.as_str() {
                "input_text" => {
                    if let Some(text) = action.params.get("text").and_then(Value::as_str) {
                        text_count += 1;
                        variables.push(ReplayVariable {
                            name: format!("text_{text_count}"),
                            value: text.to_string(),
                            step,
                            action: action.name.clone(),
                            field: "text".to_string(),
                        });
                    }
                }
                "go_to_url" => {
                    if let Some(url) = action.params.get("url").and_then(Value::as_str) {
                        url_count += 1;
                        variables.push(ReplayVariable {
                            name: format!("url_{url_count}"),
                            value: url.to_string(),
                            step,
                            action: action.name.clone(),
                            field: "url".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
    variables
}

/// Re-identify a recorded element in the current selector map. Fallback
/// chain: EXACT hash → STABLE hash → XPATH → AX name → attribute match.
pub fn find_matching_element(
    recorded: &DomHistoryElement,
    selector_map: &SelectorMap,
) -> Option<u32> {
    for (index, node) in selector_map {
        if node.exact_hash == recorded.exact_hash {
            return Some(*index);
        }
    }
    for (index, node) in selector_map {
        if node.stable_hash == recorded.stable_hash {
            return Some(*index);
        }
    }
    for (index, node) in selector_map {
        if !recorded.xpath.is_empty() && node.xpath == recorded.xpath {
            return Some(*index);
        }
    }
    if let Some(ax_name) = recorded.ax_name.as_deref().filter(|n| !n.is_empty()) {
        for (index, node) in selector_map {
            if node.ax_name.as_deref() == Some(ax_name) {
                return Some(*index);
            }
        }
    }
    for (index, node) in selector_map {
        let attribute_match = ["name", "id", "aria-label"].iter().any(|key| {
            match (recorded.attributes.get(*key), node.attributes.get(*key)) {
                (Some(a), Some(b)) => !a.is_empty() && a == b,
                _ => false,
            }
        });
        if attribute_match && node.tag == recorded.tag {
            return Some(*index);
        }
    }
    None
}

/// Heuristic: did this recorded step open a dropdown/menu?
fn step_opens_menu(step: &AgentHistory) -> bool {
    step.state
        .interacted_element
        .iter()
        .flatten()
        .any(|element| {
            if element.attributes.contains_key("aria-haspopup") {
                return true;
            }
            if element
                .attributes
                .get("aria-expanded")
                .is_some_and(|v| v == "false" || v == "true")
            {
                return true;
            }
            element.attributes.get("class").is_some_and(|class| {
                let class = class.to_lowercase();
                ["dropdown", "menu", "combobox", "select"]
                    .iter()
                    .any(|marker| class.contains(marker))
            })
        })
}

/// Key describing "same action type on the same element" for retry elision
fn action_element_key(step: &AgentHistory) -> Option<(String, String)> {
    let output = step.model_output.as_ref()?;
    let action = output.action.last()?;
    let element = step.state.interacted_element.last()?.as_ref()?;
    Some((action.name.clone(), element.exact_hash.clone()))
}

impl Agent {
    /// Replay a recorded history on the current browser session
    pub async fn rerun_history(
        &mut self,
        history: &AgentHistoryList,
        options: ReplayOptions,
    ) -> AgentResult<Vec<ActionResult>> {
        self.browser.start().await?;
        let mut all_results: Vec<ActionResult> = Vec::new();
        let mut last_replayed: Option<&AgentHistory> = None;

        for (i, step) in history.history.iter().enumerate() {
            if let Some(signal) = &options.signal
                && signal.is_cancelled()
            {
                return Err(AgentError::Aborted);
            }

            if i > 0 {
                let delay = step
                    .metadata
                    .map(|m| m.step_interval)
                    .filter(|interval| *interval > 0.0)
                    .map(|interval| interval.min(options.max_step_interval()))
                    .unwrap_or_else(|| options.default_delay());
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }

            if options.skip_failures && step.result.iter().any(|r| r.error.is_some()) {
                debug!("Skipping recorded step {i}: it had errors");
                continue;
            }
            if step.model_output.is_none() {
                continue;
            }

            // A step that repeats the action the previous step just executed
            // successfully is a recorded retry; executing it again would
            // double-apply the interaction.
            if let (Some(prev), Some(current_key)) = (last_replayed, action_element_key(step))
                && step.result.iter().all(|r| r.error.is_none())
                && action_element_key(prev) == Some(current_key.clone())
                && prev.result.iter().all(|r| r.error.is_none())
            {
                info!(
                    "Skipping recorded step {i}: redundant retry of {} on the same element",
                    current_key.0
                );
                continue;
            }

            let mut attempt = 0usize;
            loop {
                match self.replay_step(step, last_replayed, &options).await {
                    Ok(mut results) => {
                        all_results.append(&mut results);
                        break;
                    }
                    Err(e) if e.is_abort() => return Err(e),
                    Err(e) if attempt < options.max_retries() => {
                        attempt += 1;
                        warn!(
                            "Replay of step {i} failed (attempt {attempt}/{}): {e}",
                            options.max_retries()
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => {
                        if options.skip_failures {
                            warn!("Giving up on step {i}: {e}");
                            all_results.push(ActionResult::failure(e.to_string()));
                            break;
                        }
                        return Err(e);
                    }
                }
            }

            last_replayed = Some(step);
        }

        let summary = self.summarize_replay(&all_results, &options).await;
        if let Some(summary) = summary {
            all_results.push(ActionResult {
                is_done: Some(true),
                success: Some(summary.success),
                extracted_content: Some(summary.summary.clone()),
                include_in_memory: true,
                metadata: Some(HashMap::from([(
                    "completion_status".to_string(),
                    serde_json::to_value(summary.completion_status).unwrap_or(Value::Null),
                )])),
                ..Default::default()
            });
        }

        Ok(all_results)
    }

    /// Load a saved history, substitute recorded variables, and replay it
    pub async fn load_and_rerun(
        &mut self,
        path: impl AsRef<Path>,
        variables: &HashMap<String, String>,
        options: ReplayOptions,
    ) -> AgentResult<Vec<ActionResult>> {
        let mut history = AgentHistoryList::load_from_file(path)?;

        if !variables.is_empty() {
            let detected = detect_variables(&history);
            for variable in detected {
                let Some(replacement) = variables.get(&variable.name) else {
                    continue;
                };
                if let Some(entry) = history.history.get_mut(variable.step)
                    && let Some(output) = entry.model_output.as_mut()
                {
                    for action in output.action.iter_mut() {
                        if action.name == variable.action
                            && action.params.get(&variable.field).and_then(Value::as_str)
                                == Some(variable.value.as_str())
                            && let Some(params) = action.params.as_object_mut()
                        {
                            params.insert(
                                variable.field.clone(),
                                Value::String(replacement.clone()),
                            );
                        }
                    }
                }
            }
        }

        self.rerun_history(&history, options).await
    }

    async fn replay_step(
        &mut self,
        step: &AgentHistory,
        prev_step: Option<&AgentHistory>,
        options: &ReplayOptions,
    ) -> AgentResult<Vec<ActionResult>> {
        let output = step
            .model_output
            .as_ref()
            .ok_or_else(|| AgentError::StepFailed("recorded step has no model output".into()))?;

        let signal = options
            .signal
            .clone()
            .unwrap_or_else(CancellationToken::new);
        let mut results = Vec::new();

        for (action_index, action) in output.action.iter().enumerate() {
            let resolved = self.registry.resolve_name(&action.name);

            // Extract actions depend on LLM context that no longer exists;
            // synthesize an AI step over the live page instead.
            if resolved == "extract_structured_data" {
                let query = action
                    .params
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or("Summarize the page");
                results.push(self.replay_ai_step(query, options, &signal).await?);
                continue;
            }

            let mut action = action.clone();
            if let Some(recorded_index) = action.params.get("index").and_then(Value::as_u64) {
                let recorded_element = step
                    .state
                    .interacted_element
                    .get(action_index)
                    .and_then(|e| e.as_ref());

                if let Some(recorded_element) = recorded_element {
                    let new_index = self
                        .locate_recorded_element(recorded_element, prev_step, options, &signal)
                        .await?;
                    if u64::from(new_index) != recorded_index {
                        debug!(
                            "Element migrated from index {recorded_index} to {new_index}; \
                             rewriting action"
                        );
                        action.params["index"] = json!(new_index);
                    }
                }
            }

            let context = self.action_context(&signal);
            let result = self
                .registry
                .execute_action(&action.name, action.params.clone(), context)
                .await
                .map_err(|e| match e {
                    crate::browser::BrowserError::Aborted => AgentError::Aborted,
                    other => AgentError::Browser(other),
                })?;
            if let Some(error) = &result.error {
                return Err(AgentError::StepFailed(error.clone()));
            }
            results.push(result);
        }

        Ok(results)
    }

    /// Find the recorded element in the live page, reopening a menu the
    /// previous step had opened when necessary.
    async fn locate_recorded_element(
        &mut self,
        recorded: &DomHistoryElement,
        prev_step: Option<&AgentHistory>,
        options: &ReplayOptions,
        signal: &CancellationToken,
    ) -> AgentResult<u32> {
        let selector_map = self.capture_selector_map(options, signal).await?;
        if let Some(index) = find_matching_element(recorded, &selector_map) {
            return Ok(index);
        }

        if let Some(prev) = prev_step
            && step_opens_menu(prev)
        {
            info!("Element not found; re-executing previous step to reopen its menu");
            if let Some(prev_output) = &prev.model_output {
                for action in &prev_output.action {
                    let context = self.action_context(signal);
                    let _ = self
                        .registry
                        .execute_action(&action.name, action.params.clone(), context)
                        .await;
                }
            }
            let selector_map = self.capture_selector_map(options, signal).await?;
            if let Some(index) = find_matching_element(recorded, &selector_map) {
                return Ok(index);
            }
        }

        Err(AgentError::StepFailed(format!(
            "could not re-identify element <{}> at recorded index {}",
            recorded.tag, recorded.highlight_index
        )))
    }

    /// Capture the selector map, optionally waiting (bounded) for a minimum
    /// number of interactive elements to appear.
    async fn capture_selector_map(
        &self,
        options: &ReplayOptions,
        signal: &CancellationToken,
    ) -> AgentResult<SelectorMap> {
        let capture = StateCaptureOptions {
            cache_clickable_elements_hashes: true,
            include_screenshot: false,
            include_recent_events: false,
            signal: Some(signal.clone()),
        };

        let mut state = self.browser.get_browser_state(capture.clone()).await?;
        if let Some(minimum) = options.wait_for_elements {
            let deadline = tokio::time::Instant::now() + ELEMENT_WAIT_CAP;
            while state.selector_map.len() < minimum && tokio::time::Instant::now() < deadline {
                if signal.is_cancelled() {
                    return Err(AgentError::Aborted);
                }
                tokio::time::sleep(ELEMENT_WAIT_POLL).await;
                state = self.browser.get_browser_state(capture.clone()).await?;
            }
        }
        Ok(state.selector_map)
    }

    /// Markdown extraction plus LLM answer, standing in for a recorded
    /// extract action
    async fn replay_ai_step(
        &self,
        query: &str,
        options: &ReplayOptions,
        signal: &CancellationToken,
    ) -> AgentResult<ActionResult> {
        let markdown = self.browser.page_markdown().await?;
        let llm = options
            .ai_step_llm
            .clone()
            .unwrap_or_else(|| self.active_llm());

        let prompt = format!(
            "Answer this query using the page content below.\n\nQuery: {query}\n\nPage \
             content:\n{markdown}"
        );
        let result = llm
            .ainvoke(
                &[ChatMessage::user(prompt)],
                None,
                InvokeOptions {
                    signal: Some(signal.clone()),
                    request_type: Some("replay_ai_step".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(AgentError::Llm)?;

        Ok(ActionResult {
            extracted_content: Some(result.completion_text()),
            include_in_memory: true,
            include_extracted_content_only_once: true,
            ..Default::default()
        })
    }

    /// Structured summary over the aggregated replay results
    async fn summarize_replay(
        &self,
        results: &[ActionResult],
        options: &ReplayOptions,
    ) -> Option<ReplaySummary> {
        let llm = options.summary_llm.clone().unwrap_or_else(|| self.active_llm());
        let schema = json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "success": {"type": "boolean"},
                "completion_status": {"enum": ["complete", "partial", "failed"]},
            },
            "required": ["summary", "success", "completion_status"],
            "additionalProperties": false,
        });

        let mut transcript = format!("Replayed task: {}\n\nResults:\n", self.task.text);
        for (i, result) in results.iter().enumerate() {
            if let Some(content) = &result.extracted_content {
                transcript.push_str(&format!("{i}: {content}\n"));
            }
            if let Some(error) = &result.error {
                transcript.push_str(&format!("{i} failed: {error}\n"));
            }
        }

        match llm
            .ainvoke(
                &[
                    ChatMessage::system(
                        "Summarize this replayed browser automation run and judge whether it \
                         completed.",
                    ),
                    ChatMessage::user(transcript),
                ],
                Some(&schema),
                InvokeOptions {
                    request_type: Some("replay_summary".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(result) => match serde_json::from_value(result.completion.clone()) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Replay summary did not validate: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("Replay summary call failed: {e}");
                None
            }
        }
    }
}
