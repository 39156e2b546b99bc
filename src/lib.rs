//! Autonomous browser-automation agent.
//!
//! Drives a Chromium browser to complete a natural-language task by looping
//! perceive → decide (LLM structured output) → act (typed action registry),
//! with failure accounting, plan maintenance, loop detection, message
//! compaction, history recording and replay.

pub mod agent;
pub mod browser;
pub mod events;
pub mod filesystem;
pub mod llm;
pub mod logging;
pub mod registry;
pub mod tools;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::agent::views::AgentSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub browser: BrowserLaunchConfig,

    #[serde(default)]
    pub agent: AgentSettings,
}

/// LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Model switched to permanently after provider failures
    #[serde(default)]
    pub fallback_model: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

/// Browser launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserLaunchConfig {
    /// Run browser in headless mode
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Disable web security features (Same-Origin Policy, etc.)
    /// WARNING: only enable for trusted content
    #[serde(default)]
    pub disable_security: bool,

    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u64 {
    4096
}
fn default_headless() -> bool {
    true
}
fn default_window_width() -> u32 {
    1280
}
fn default_window_height() -> u32 {
    720
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            browser: BrowserLaunchConfig::default(),
            agent: AgentSettings::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            fallback_model: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for BrowserLaunchConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            disable_security: false,
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

/// Load config from `config.yaml` in the working directory, falling back to
/// defaults when absent
pub fn load_yaml_config() -> anyhow::Result<Config> {
    let config_path = PathBuf::from("config.yaml");

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

pub use agent::views::{
    ActionInvocation, ActionResult, AgentHistory, AgentHistoryList, AgentOutput, AgentState,
    AgentStepInfo, JudgementResult, StepMetadata, Task, UsageSummary, VisionMode,
};
pub use agent::{
    Agent, AgentBuilder, AgentControlHandle, AgentError, AgentResult, ReplayOptions, SkillService,
};
pub use browser::{
    AttachMode, BrowserError, BrowserProfile, BrowserSession, BrowserStateSummary, CdpSession,
    DomHistoryElement, DomNode, SelectorMap,
};
pub use events::{AgentEvent, EventBus};
pub use llm::{ChatMessage, ChatModel, LlmError, OpenAiChatModel};
pub use registry::{ActionContext, ActionRegistry, RegisterOptions, RegistryError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_parse_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").expect("empty config parses");
        assert!(config.browser.headless);
        assert_eq!(config.browser.window.width, 1280);
        assert_eq!(config.llm.api_base, "https://api.openai.com/v1");
        assert!(config.llm.fallback_model.is_none());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let yaml = "browser:\n  headless: false\nllm:\n  model: local-model\n";
        let config: Config = serde_yaml::from_str(yaml).expect("partial config parses");
        assert!(!config.browser.headless);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.temperature, 0.7);
    }
}
