//! Agent data model: settings, runtime state, LLM output, results, history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::agent::loop_detect::LoopDetector;
use crate::agent::message_manager::MessageManagerState;
use crate::agent::plan::Plan;
use crate::browser::{AttachMode, BrowserStateHistory};
use crate::filesystem::FileSystemState;
use crate::utils::sensitive::{SensitiveData, redact_value};

/// Task text, augmented at construction with the stringified output schema
/// when a structured-output contract is present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            output_schema: None,
        }
    }

    pub fn with_output_schema(text: impl Into<String>, schema: Value) -> Self {
        let text = format!(
            "{}\n\nThe final answer must conform to this JSON schema:\n{}",
            text.into(),
            schema
        );
        Self {
            text,
            output_schema: Some(schema),
        }
    }
}

/// Vision mode: `true`, `false`, or `"auto"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VisionModeRepr", into = "VisionModeRepr")]
pub enum VisionMode {
    Enabled,
    Disabled,
    Auto,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum VisionModeRepr {
    Flag(bool),
    Mode(String),
}

impl From<VisionModeRepr> for VisionMode {
    fn from(repr: VisionModeRepr) -> Self {
        match repr {
            VisionModeRepr::Flag(true) => VisionMode::Enabled,
            VisionModeRepr::Flag(false) => VisionMode::Disabled,
            VisionModeRepr::Mode(s) if s.eq_ignore_ascii_case("auto") => VisionMode::Auto,
            VisionModeRepr::Mode(_) => VisionMode::Enabled,
        }
    }
}

impl From<VisionMode> for VisionModeRepr {
    fn from(mode: VisionMode) -> Self {
        match mode {
            VisionMode::Enabled => VisionModeRepr::Flag(true),
            VisionMode::Disabled => VisionModeRepr::Flag(false),
            VisionMode::Auto => VisionModeRepr::Mode("auto".to_string()),
        }
    }
}

impl VisionMode {
    /// Whether state messages include screenshot image parts
    pub fn includes_state_images(&self) -> bool {
        matches!(self, VisionMode::Enabled | VisionMode::Auto)
    }

    /// Whether the screenshot action is exposed in the registry. Only
    /// `"auto"` removes it; `false` keeps the action and merely drops image
    /// parts from state messages.
    pub fn exposes_screenshot_action(&self) -> bool {
        !matches!(self, VisionMode::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionDetailLevel {
    Auto,
    Low,
    High,
}

/// Message-compaction settings. The dedicated compaction model, when any, is
/// wired on the agent builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Compact once the message list exceeds this many messages
    pub message_threshold: usize,
    /// Most recent turns that are never compacted away
    pub keep_recent_turns: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            message_threshold: 40,
            keep_recent_turns: 6,
        }
    }
}

/// Configuration options for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub use_vision: VisionMode,
    pub vision_detail_level: VisionDetailLevel,
    pub include_recent_events: bool,
    pub max_actions_per_step: usize,
    pub use_thinking: bool,
    /// Disables thinking and planning and switches to the compact output shape
    pub flash_mode: bool,
    pub use_judge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,
    pub max_failures: u32,
    /// Grants one extra done-only step past the failure cap
    pub final_response_after_failure: bool,
    /// Hard per-step wall clock in seconds, enforced via the abort signal
    pub step_timeout: u64,
    /// LLM call wall clock in seconds
    pub llm_timeout: u64,
    pub message_compaction: CompactionSettings,
    pub loop_detection_window: usize,
    pub loop_detection_enabled: bool,
    /// Consecutive failures after which a replan nudge is injected
    pub planning_replan_on_stall: u32,
    /// Steps without a plan after which an exploration nudge is injected
    pub planning_exploration_limit: u32,
    pub session_attachment_mode: AttachMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_conversation_path: Option<PathBuf>,
    pub generate_gif: bool,
    pub include_tool_call_examples: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            use_vision: VisionMode::Enabled,
            vision_detail_level: VisionDetailLevel::Auto,
            include_recent_events: false,
            max_actions_per_step: 4,
            use_thinking: true,
            flash_mode: false,
            use_judge: false,
            ground_truth: None,
            max_failures: 3,
            final_response_after_failure: true,
            step_timeout: 180,
            llm_timeout: 90,
            message_compaction: CompactionSettings::default(),
            loop_detection_window: 4,
            loop_detection_enabled: true,
            planning_replan_on_stall: 2,
            planning_exploration_limit: 6,
            session_attachment_mode: AttachMode::Copy,
            save_conversation_path: None,
            generate_gif: false,
            include_tool_call_examples: false,
        }
    }
}

impl AgentSettings {
    /// Planning is available unless flash mode turned it off
    pub fn planning_enabled(&self) -> bool {
        !self.flash_mode
    }
}

/// One action invocation: a mapping with exactly one key (the action name)
/// whose value is the parameter record
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    pub name: String,
    pub params: Value,
}

impl ActionInvocation {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// True for the `{}` shape some models emit when they have no action
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl Serialize for ActionInvocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.params)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActionInvocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InvocationVisitor;

        impl<'de> Visitor<'de> for InvocationVisitor {
            type Value = ActionInvocation;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map with exactly one action-name key")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let first = access.next_entry::<String, Value>()?;
                let Some((name, params)) = first else {
                    // Empty `{}` parses as the empty invocation; the
                    // normalization pass decides whether to re-prompt.
                    return Ok(ActionInvocation {
                        name: String::new(),
                        params: Value::Object(serde_json::Map::new()),
                    });
                };
                if access.next_entry::<String, Value>()?.is_some() {
                    return Err(serde::de::Error::custom(
                        "action invocation must contain exactly one action",
                    ));
                }
                Ok(ActionInvocation { name, params })
            }
        }

        deserializer.deserialize_map(InvocationVisitor)
    }
}

/// LLM response for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_previous_goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_goal: Option<String>,
    /// Plan item the agent believes it is working on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan_item: Option<u32>,
    /// Full plan replacement, ordered step texts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_update: Option<Vec<String>>,
    #[serde(default)]
    pub action: Vec<ActionInvocation>,
}

impl AgentOutput {
    /// JSON schema for the structured-output call. The shape variant is keyed
    /// by flash mode / use_thinking / done-only enforcement; variants differ
    /// only in which textual fields are permitted and which action subset is
    /// allowed.
    pub fn output_schema(
        flash_mode: bool,
        use_thinking: bool,
        planning: bool,
        allowed_actions: &[String],
    ) -> Value {
        let action_item = json!({
            "type": "object",
            "description": "One action: exactly one key naming the action, value is its parameters",
            "propertyNames": {"enum": allowed_actions},
            "minProperties": 1,
            "maxProperties": 1,
        });

        let mut properties = serde_json::Map::new();
        let mut required = vec![];

        if !flash_mode {
            if use_thinking {
                properties.insert("thinking".into(), json!({"type": ["string", "null"]}));
            }
            properties.insert(
                "evaluation_previous_goal".into(),
                json!({"type": ["string", "null"]}),
            );
            properties.insert("memory".into(), json!({"type": ["string", "null"]}));
            properties.insert("next_goal".into(), json!({"type": ["string", "null"]}));
            if planning {
                properties.insert(
                    "current_plan_item".into(),
                    json!({"type": ["integer", "null"]}),
                );
                properties.insert(
                    "plan_update".into(),
                    json!({"type": ["array", "null"], "items": {"type": "string"}}),
                );
            }
        }

        properties.insert(
            "action".into(),
            json!({"type": "array", "items": action_item, "minItems": 1}),
        );
        required.push(json!("action"));

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// LLM judgement of the finished trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgementResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub verdict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub impossible_task: bool,
    #[serde(default)]
    pub reached_captcha: bool,
}

/// Inline image attached to an action result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub name: String,
    /// Base64-encoded payload
    pub data: String,
}

/// Result of executing one action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
    /// Whether this result is repeated in later state messages
    #[serde(default)]
    pub include_in_memory: bool,
    #[serde(default)]
    pub include_extracted_content_only_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_term_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgement: Option<JudgementResult>,
}

impl ActionResult {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            extracted_content: Some(text.into()),
            include_in_memory: true,
            ..Default::default()
        }
    }

    pub fn done(success: bool, text: impl Into<String>) -> Self {
        Self {
            is_done: Some(true),
            success: Some(success),
            extracted_content: Some(text.into()),
            include_in_memory: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Step number and budget handed to the step executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStepInfo {
    pub step_number: u32,
    pub max_steps: u32,
}

impl AgentStepInfo {
    pub fn is_last_step(&self) -> bool {
        self.step_number >= self.max_steps
    }
}

/// Timing of a single step (seconds since the Unix epoch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step_start_time: f64,
    pub step_end_time: f64,
    pub step_number: u32,
    /// Elapsed seconds of the previous step
    pub step_interval: f64,
}

impl StepMetadata {
    pub fn duration_seconds(&self) -> f64 {
        self.step_end_time - self.step_start_time
    }
}

/// Aggregated token accounting over the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageSummary {
    pub fn add(&mut self, usage: &crate::llm::ChatInvokeUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }
}

/// Mutable state owned by one agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    /// 1-based; incremented on successful finalize
    pub n_steps: u32,
    pub consecutive_failures: u32,
    pub paused: bool,
    pub stopped: bool,
    pub follow_up_task: bool,
    pub session_initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model_output: Option<AgentOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Vec<ActionResult>>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_generation_step: Option<u32>,
    #[serde(skip, default)]
    pub loop_detector: LoopDetector,
    #[serde(default)]
    pub message_manager_state: MessageManagerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system_state: Option<FileSystemState>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            agent_id: Uuid::new_v4().to_string(),
            n_steps: 1,
            consecutive_failures: 0,
            paused: false,
            stopped: false,
            follow_up_task: false,
            session_initialized: false,
            last_model_output: None,
            last_result: None,
            plan: Plan::default(),
            plan_generation_step: None,
            loop_detector: LoopDetector::default(),
            message_manager_state: MessageManagerState::default(),
            file_system_state: None,
        }
    }
}

/// One recorded step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<AgentOutput>,
    #[serde(default)]
    pub result: Vec<ActionResult>,
    #[serde(default)]
    pub state: BrowserStateHistory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StepMetadata>,
    /// The state message shown to the LLM for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_message: Option<String>,
}

/// Append-only run history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHistoryList {
    #[serde(default)]
    pub history: Vec<AgentHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
}

impl AgentHistoryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, mut step: AgentHistory) {
        if step.timestamp.is_none() {
            step.timestamp = Some(chrono::Utc::now());
        }
        self.history.push(step);
    }

    pub fn number_of_steps(&self) -> usize {
        self.history.len()
    }

    fn last_done_result(&self) -> Option<&ActionResult> {
        self.history
            .last()
            .and_then(|h| h.result.last())
            .filter(|r| r.is_done == Some(true))
    }

    pub fn is_done(&self) -> bool {
        self.last_done_result().is_some()
    }

    /// Success of the final done result, ANDed with the judge verdict when a
    /// full judge ran
    pub fn is_successful(&self) -> Option<bool> {
        let done = self.last_done_result()?;
        let success = done.success?;
        match &done.judgement {
            Some(judgement) => Some(success && judgement.verdict),
            None => Some(success),
        }
    }

    pub fn final_result(&self) -> Option<String> {
        self.last_done_result()
            .and_then(|r| r.extracted_content.clone())
    }

    pub fn has_errors(&self) -> bool {
        self.history
            .iter()
            .any(|h| h.result.iter().any(|r| r.error.is_some()))
    }

    pub fn errors(&self) -> Vec<String> {
        self.history
            .iter()
            .flat_map(|h| h.result.iter().filter_map(|r| r.error.clone()))
            .collect()
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.history
            .iter()
            .filter_map(|h| h.metadata.as_ref())
            .map(|m| m.duration_seconds())
            .sum()
    }

    /// Serialize to pretty JSON, redacting sensitive values when a map is
    /// supplied
    pub fn to_json(&self, sensitive: Option<&SensitiveData>) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(sensitive) = sensitive {
            redact_value(&mut value, sensitive);
        }
        serde_json::to_string_pretty(&value)
    }

    pub fn save_to_file(
        &self,
        path: impl AsRef<Path>,
        sensitive: Option<&SensitiveData>,
    ) -> std::io::Result<()> {
        let json = self
            .to_json(sensitive)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| std::io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_invocation_requires_single_key() {
        let ok: ActionInvocation =
            serde_json::from_value(json!({"click_element": {"index": 5}})).expect("single key");
        assert_eq!(ok.name, "click_element");
        assert_eq!(ok.params["index"], 5);

        let empty: ActionInvocation = serde_json::from_value(json!({})).expect("empty map");
        assert!(empty.is_empty());

        let err = serde_json::from_value::<ActionInvocation>(
            json!({"click_element": {}, "done": {}}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn action_invocation_serializes_as_single_entry_map() {
        let inv = ActionInvocation::new("wait", json!({"seconds": 2}));
        let value = serde_json::to_value(&inv).expect("serialize");
        assert_eq!(value, json!({"wait": {"seconds": 2}}));
    }

    #[test]
    fn vision_mode_accepts_bool_and_auto() {
        let enabled: VisionMode = serde_json::from_str("true").unwrap();
        assert_eq!(enabled, VisionMode::Enabled);
        let auto: VisionMode = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, VisionMode::Auto);
        assert!(!auto.exposes_screenshot_action());
        let disabled: VisionMode = serde_json::from_str("false").unwrap();
        assert!(disabled.exposes_screenshot_action());
        assert!(!disabled.includes_state_images());
    }

    #[test]
    fn output_schema_variants_gate_fields() {
        let actions = vec!["done".to_string()];
        let flash = AgentOutput::output_schema(true, true, true, &actions);
        assert!(flash["properties"].get("thinking").is_none());
        assert!(flash["properties"].get("next_goal").is_none());

        let thinking = AgentOutput::output_schema(false, true, true, &actions);
        assert!(thinking["properties"].get("thinking").is_some());
        assert!(thinking["properties"].get("plan_update").is_some());

        let no_thinking = AgentOutput::output_schema(false, false, false, &actions);
        assert!(no_thinking["properties"].get("thinking").is_none());
        assert!(no_thinking["properties"].get("plan_update").is_none());
        assert_eq!(
            no_thinking["properties"]["action"]["items"]["propertyNames"]["enum"],
            json!(["done"])
        );
    }

    #[test]
    fn successful_requires_judge_agreement() {
        let mut list = AgentHistoryList::new();
        let mut step = AgentHistory::default();
        let mut done = ActionResult::done(true, "finished");
        done.judgement = Some(JudgementResult {
            verdict: false,
            ..Default::default()
        });
        step.result.push(done);
        list.add_step(step);
        assert!(list.is_done());
        assert_eq!(list.is_successful(), Some(false));
    }

    #[test]
    fn history_roundtrips_and_redacts() {
        let mut list = AgentHistoryList::new();
        let mut step = AgentHistory::default();
        step.model_output = Some(AgentOutput {
            next_goal: Some("log in with hunter2".into()),
            action: vec![ActionInvocation::new(
                "input_text",
                json!({"index": 3, "text": "hunter2"}),
            )],
            ..Default::default()
        });
        step.result.push(ActionResult::content("typed"));
        list.add_step(step);

        let mut sensitive = SensitiveData::new();
        sensitive.insert(
            "password".into(),
            crate::utils::sensitive::SensitiveEntry::Value("hunter2".into()),
        );

        let json = list.to_json(Some(&sensitive)).expect("serialize");
        assert!(!json.contains("hunter2"));
        assert!(json.contains("<secret>password</secret>"));

        let plain = list.to_json(None).expect("serialize");
        let back: AgentHistoryList = serde_json::from_str(&plain).expect("deserialize");
        assert_eq!(
            back.history[0].model_output.as_ref().unwrap().action[0].name,
            "input_text"
        );
    }
}
