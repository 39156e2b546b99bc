//! Autonomous browser-automation agent.

pub mod core;
pub mod loop_detect;
pub mod message_manager;
pub mod plan;
pub mod prompts;
pub mod replay;
pub mod views;

pub use core::{Agent, AgentBuilder, AgentControlHandle};
pub use replay::{ReplayOptions, ReplayVariable};

use async_trait::async_trait;
use thiserror::Error;

use crate::browser::{BrowserError, Cookie};
use crate::llm::LlmError;
use crate::registry::{ActionRegistry, RegistryError};

/// Error type for agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("step timed out after {0} seconds")]
    StepTimeout(u64),

    #[error("agent stopped")]
    Stopped,

    #[error("agent aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AgentError {
    /// Abort-kind errors are propagated unchanged and never folded into
    /// failure accounting.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            AgentError::Aborted
                | AgentError::Stopped
                | AgentError::Llm(LlmError::Aborted)
                | AgentError::Browser(BrowserError::Aborted)
        )
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Dynamic skill-backed actions and their availability info
#[async_trait]
pub trait SkillService: Send + Sync {
    /// Register skill-backed actions into the registry (called once per run)
    async fn register_actions(&self, registry: &mut ActionRegistry) -> AgentResult<()>;

    /// Info about skills currently unavailable, e.g. which cookies are
    /// missing. Injected as a context nudge when present.
    async fn unavailable_skill_info(&self, cookies: &[Cookie]) -> Option<String>;

    async fn close(&self);
}
