//! Agent event bus.
//!
//! Fire-and-forget broadcast of lifecycle events; the core never depends on
//! subscribers being present.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    CreateAgentSession {
        session_id: String,
        agent_id: String,
    },
    CreateAgentTask {
        task_id: String,
        agent_id: String,
        task: String,
    },
    CreateAgentStep {
        agent_id: String,
        step: u32,
        url: String,
        actions: Vec<String>,
    },
    UpdateAgentTask {
        task_id: String,
        agent_id: String,
        done: bool,
        success: Option<bool>,
    },
    CreateAgentOutputFile {
        agent_id: String,
        path: String,
    },
}

/// Broadcast bus for agent events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
    stopped: Arc<AtomicBool>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self {
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; silently dropped when nobody listens or the bus stopped
    pub fn emit(&self, event: AgentEvent) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        trace!(?event, "Emitting agent event");
        let _ = self.sender.send(event);
    }

    /// Stop delivering events (run teardown)
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
