//! Agent core: run controller, step executor, LLM invocation, action
//! sequencing. The implementation is split across focused files sharing the
//! `Agent` struct.

mod actions;
mod agent;
mod llm_call;
mod step;

pub use agent::{Agent, AgentBuilder, AgentControlHandle, DoneCallback, StepCallback};
