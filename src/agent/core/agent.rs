//! Agent struct, run controller, pause/resume/stop, judging, cleanup.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::message_manager::MessageManager;
use crate::agent::prompts::SystemPrompt;
use crate::agent::views::{
    ActionInvocation, ActionResult, AgentHistory, AgentHistoryList, AgentOutput, AgentSettings,
    AgentState, AgentStepInfo, JudgementResult, StepMetadata, Task, UsageSummary,
};
use crate::agent::{AgentError, AgentResult, SkillService};
use crate::browser::{
    AttachMode, BrowserSession, BrowserStateHistory, cleanup_session_step_lock,
};
use crate::events::{AgentEvent, EventBus};
use crate::filesystem::AgentFileSystem;
use crate::llm::{ChatMessage, ChatModel, InvokeOptions};
use crate::registry::ActionRegistry;
use crate::tools::register_default_actions;
use crate::utils::now_seconds;
use crate::utils::sensitive::SensitiveData;
use crate::utils::url::extract_start_url;

pub type StepCallback = Arc<dyn Fn(&AgentState, &AgentHistoryList) + Send + Sync>;
pub type DoneCallback = Arc<dyn Fn(&AgentHistoryList) + Send + Sync>;
pub type GifRenderer = Arc<dyn Fn(&AgentHistoryList) -> Option<PathBuf> + Send + Sync>;
pub type RaiseCheck = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Cross-task pause/stop latches shared with control handles and the
/// interrupt handler
pub(crate) struct AgentControl {
    paused: AtomicBool,
    stopped: AtomicBool,
    resume: Notify,
    pub(crate) token: CancellationToken,
}

impl AgentControl {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            resume: Notify::new(),
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    /// Stop is sticky and always resolves a pending pause
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.token.cancel();
        self.resume.notify_waiters();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_resume(&self) {
        self.resume.notified().await;
    }
}

/// Cloneable handle for controlling a running agent from another task
#[derive(Clone)]
pub struct AgentControlHandle(Arc<AgentControl>);

impl AgentControlHandle {
    pub fn pause(&self) {
        self.0.pause();
    }

    pub fn resume(&self) {
        self.0.resume();
    }

    pub fn stop(&self) {
        self.0.stop();
    }

    pub fn is_paused(&self) -> bool {
        self.0.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_stopped()
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    task: Task,
    llm: Arc<dyn ChatModel>,
    browser: Arc<dyn BrowserSession>,
    settings: AgentSettings,
    fallback_llm: Option<Arc<dyn ChatModel>>,
    compaction_llm: Option<Arc<dyn ChatModel>>,
    page_extraction_llm: Option<Arc<dyn ChatModel>>,
    judge_llm: Option<Arc<dyn ChatModel>>,
    sensitive_data: Option<SensitiveData>,
    initial_actions: Option<Vec<ActionInvocation>>,
    skill_service: Option<Arc<dyn SkillService>>,
    context: Option<Arc<dyn Any + Send + Sync>>,
    registry: Option<ActionRegistry>,
    file_system_state: Option<crate::filesystem::FileSystemState>,
    available_file_paths: Vec<String>,
    follow_up_task: bool,
    gif_renderer: Option<GifRenderer>,
    raise_check: Option<RaiseCheck>,
    events: Option<EventBus>,
}

impl AgentBuilder {
    pub fn new(task: Task, llm: Arc<dyn ChatModel>, browser: Arc<dyn BrowserSession>) -> Self {
        Self {
            task,
            llm,
            browser,
            settings: AgentSettings::default(),
            fallback_llm: None,
            compaction_llm: None,
            page_extraction_llm: None,
            judge_llm: None,
            sensitive_data: None,
            initial_actions: None,
            skill_service: None,
            context: None,
            registry: None,
            file_system_state: None,
            available_file_paths: Vec::new(),
            follow_up_task: false,
            gif_renderer: None,
            raise_check: None,
            events: None,
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_fallback_llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.fallback_llm = Some(llm);
        self
    }

    pub fn with_compaction_llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.compaction_llm = Some(llm);
        self
    }

    pub fn with_page_extraction_llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.page_extraction_llm = Some(llm);
        self
    }

    pub fn with_judge_llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.judge_llm = Some(llm);
        self
    }

    pub fn with_sensitive_data(mut self, sensitive_data: SensitiveData) -> Self {
        self.sensitive_data = Some(sensitive_data);
        self
    }

    pub fn with_initial_actions(mut self, actions: Vec<ActionInvocation>) -> Self {
        self.initial_actions = Some(actions);
        self
    }

    pub fn with_skill_service(mut self, service: Arc<dyn SkillService>) -> Self {
        self.skill_service = Some(service);
        self
    }

    pub fn with_context(mut self, context: Arc<dyn Any + Send + Sync>) -> Self {
        self.context = Some(context);
        self
    }

    /// Use a pre-seeded registry instead of the default action set
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_file_system_state(mut self, state: crate::filesystem::FileSystemState) -> Self {
        self.file_system_state = Some(state);
        self
    }

    pub fn with_available_file_paths(mut self, paths: Vec<String>) -> Self {
        self.available_file_paths = paths;
        self
    }

    /// Marks this run as a follow-up on an existing session; suppresses the
    /// start-URL bootstrap.
    pub fn follow_up_task(mut self, follow_up: bool) -> Self {
        self.follow_up_task = follow_up;
        self
    }

    pub fn with_gif_renderer(mut self, renderer: GifRenderer) -> Self {
        self.gif_renderer = Some(renderer);
        self
    }

    /// External check polled before each step; returning a message fails the
    /// run with it.
    pub fn with_raise_check(mut self, check: RaiseCheck) -> Self {
        self.raise_check = Some(check);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Claim the browser session per the attachment mode and assemble the
    /// agent.
    pub async fn build(self) -> AgentResult<Agent> {
        let mut state = AgentState::default();
        state.follow_up_task = self.follow_up_task;
        state.loop_detector =
            crate::agent::loop_detect::LoopDetector::new(self.settings.loop_detection_window);
        let agent_id = state.agent_id.clone();
        let task_id = Uuid::new_v4().to_string();

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let mut registry = ActionRegistry::new();
                register_default_actions(&mut registry, &self.settings)?;
                registry
            }
        };

        let browser = match self.settings.session_attachment_mode {
            AttachMode::Copy => {
                if self.browser.get_attached_agent_ids().is_empty() {
                    self.browser.claim_agent(&agent_id, AttachMode::Copy)?;
                    self.browser
                } else {
                    info!("Browser session already owned; cloning into an isolated session");
                    let clone = self.browser.clone_isolated().await?;
                    clone.claim_agent(&agent_id, AttachMode::Copy)?;
                    clone
                }
            }
            AttachMode::Strict => {
                self.browser.claim_agent(&agent_id, AttachMode::Strict)?;
                self.browser
            }
            AttachMode::Shared => {
                self.browser.claim_agent(&agent_id, AttachMode::Shared)?;
                self.browser
            }
        };

        let file_system = match &self.file_system_state {
            Some(fs_state) => AgentFileSystem::from_state(fs_state)?,
            None => AgentFileSystem::new(&task_id)?,
        };

        let system_prompt = SystemPrompt {
            action_description: registry.get_prompt_description(None),
            max_actions_per_step: self.settings.max_actions_per_step,
            flash_mode: self.settings.flash_mode,
            use_thinking: self.settings.use_thinking,
            include_tool_call_examples: self.settings.include_tool_call_examples,
            ..Default::default()
        }
        .build();

        let message_manager = MessageManager::new(
            system_prompt,
            self.task.clone(),
            self.sensitive_data.clone(),
        );

        Ok(Agent {
            task: self.task,
            task_id,
            session_id: browser.id().to_string(),
            llm: self.llm,
            fallback_llm: self.fallback_llm,
            using_fallback: false,
            compaction_llm: self.compaction_llm,
            page_extraction_llm: self.page_extraction_llm,
            judge_llm: self.judge_llm,
            browser,
            registry,
            settings: self.settings,
            state,
            history: AgentHistoryList::new(),
            message_manager,
            events: self.events.unwrap_or_default(),
            file_system: Arc::new(Mutex::new(file_system)),
            sensitive_data: self.sensitive_data,
            available_file_paths: self.available_file_paths,
            initial_actions: self.initial_actions,
            skill_service: self.skill_service,
            context: self.context,
            gif_renderer: self.gif_renderer,
            raise_check: self.raise_check,
            control: Arc::new(AgentControl::new()),
            pinned_tab: None,
            usage: UsageSummary::default(),
            last_step_duration: 0.0,
            skills_registered: false,
            closed: false,
        })
    }
}

/// Autonomous browser-automation agent
pub struct Agent {
    pub(crate) task: Task,
    pub(crate) task_id: String,
    pub(crate) session_id: String,
    pub(crate) llm: Arc<dyn ChatModel>,
    pub(crate) fallback_llm: Option<Arc<dyn ChatModel>>,
    pub(crate) using_fallback: bool,
    pub(crate) compaction_llm: Option<Arc<dyn ChatModel>>,
    pub(crate) page_extraction_llm: Option<Arc<dyn ChatModel>>,
    pub(crate) judge_llm: Option<Arc<dyn ChatModel>>,
    pub(crate) browser: Arc<dyn BrowserSession>,
    pub(crate) registry: ActionRegistry,
    pub(crate) settings: AgentSettings,
    pub(crate) state: AgentState,
    pub(crate) history: AgentHistoryList,
    pub(crate) message_manager: MessageManager,
    pub(crate) events: EventBus,
    pub(crate) file_system: Arc<Mutex<AgentFileSystem>>,
    pub(crate) sensitive_data: Option<SensitiveData>,
    pub(crate) available_file_paths: Vec<String>,
    pub(crate) initial_actions: Option<Vec<ActionInvocation>>,
    pub(crate) skill_service: Option<Arc<dyn SkillService>>,
    pub(crate) context: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) gif_renderer: Option<GifRenderer>,
    pub(crate) raise_check: Option<RaiseCheck>,
    pub(crate) control: Arc<AgentControl>,
    pub(crate) pinned_tab: Option<String>,
    pub(crate) usage: UsageSummary,
    pub(crate) last_step_duration: f64,
    skills_registered: bool,
    closed: bool,
}

impl Agent {
    pub fn builder(
        task: Task,
        llm: Arc<dyn ChatModel>,
        browser: Arc<dyn BrowserSession>,
    ) -> AgentBuilder {
        AgentBuilder::new(task, llm, browser)
    }

    pub fn control(&self) -> AgentControlHandle {
        AgentControlHandle(self.control.clone())
    }

    pub fn pause(&self) {
        info!("Agent paused");
        self.control.pause();
    }

    pub fn resume(&self) {
        info!("Agent resumed");
        self.control.resume();
    }

    pub fn stop(&self) {
        info!("Agent stop requested");
        self.control.stop();
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn history(&self) -> &AgentHistoryList {
        &self.history
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_using_fallback_llm(&self) -> bool {
        self.using_fallback
    }

    /// The model currently answering agent steps
    pub(crate) fn active_llm(&self) -> Arc<dyn ChatModel> {
        if self.using_fallback
            && let Some(fallback) = &self.fallback_llm
        {
            return fallback.clone();
        }
        self.llm.clone()
    }

    /// Run the agent until done, stopped, failed, or out of steps
    pub async fn run(&mut self, max_steps: u32) -> AgentResult<AgentHistoryList> {
        self.run_with_hooks(max_steps, None, None, None).await
    }

    /// Run with optional per-step and done callbacks
    pub async fn run_with_hooks(
        &mut self,
        max_steps: u32,
        on_step_start: Option<StepCallback>,
        on_step_end: Option<StepCallback>,
        on_done: Option<DoneCallback>,
    ) -> AgentResult<AgentHistoryList> {
        // Second interrupt forces exit; the first toggles pause/resume.
        let control = self.control.clone();
        let events = self.events.clone();
        let interrupt_task = tokio::spawn(async move {
            let mut interrupts = 0u32;
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupts += 1;
                if interrupts == 1 {
                    if control.is_paused() {
                        control.resume();
                    } else {
                        warn!("Interrupt received; pausing agent (interrupt again to exit)");
                        control.pause();
                    }
                } else {
                    error!("Second interrupt; forcing exit");
                    control.stop();
                    events.stop();
                    std::process::exit(130);
                }
            }
        });

        let outcome = self.run_loop(max_steps, on_step_start, on_step_end, on_done).await;
        interrupt_task.abort();
        self.finish_run().await;

        match outcome {
            Ok(()) => Ok(self.history.clone()),
            Err(e) => Err(e),
        }
    }

    async fn run_loop(
        &mut self,
        max_steps: u32,
        on_step_start: Option<StepCallback>,
        on_step_end: Option<StepCallback>,
        on_done: Option<DoneCallback>,
    ) -> AgentResult<()> {
        if max_steps == 0 {
            self.history.add_step(AgentHistory {
                result: vec![ActionResult::failure("max_steps must be at least 1")],
                ..Default::default()
            });
            return Ok(());
        }

        if !self.state.session_initialized {
            self.events.emit(AgentEvent::CreateAgentSession {
                session_id: self.session_id.clone(),
                agent_id: self.state.agent_id.clone(),
            });
            self.state.session_initialized = true;
        }
        self.events.emit(AgentEvent::CreateAgentTask {
            task_id: self.task_id.clone(),
            agent_id: self.state.agent_id.clone(),
            task: self.task.text.clone(),
        });

        if !self.control.is_stopped() {
            self.browser.start().await?;
        }

        if !self.skills_registered {
            if let Some(skills) = self.skill_service.clone() {
                skills.register_actions(&mut self.registry).await?;
            }
            self.skills_registered = true;
        }

        self.execute_initial_actions().await?;

        let failure_budget =
            self.settings.max_failures + u32::from(self.settings.final_response_after_failure);

        while self.state.n_steps <= max_steps {
            while self.control.is_paused() && !self.control.is_stopped() {
                debug!("Agent paused, waiting for resume");
                self.control.wait_resume().await;
            }
            if self.control.is_stopped() {
                info!("Agent stopped before step {}", self.state.n_steps);
                break;
            }
            if self.state.consecutive_failures >= failure_budget {
                error!(
                    "Stopping after {} consecutive failures",
                    self.state.consecutive_failures
                );
                break;
            }
            if let Some(check) = &self.raise_check
                && let Some(message) = check()
            {
                return Err(AgentError::StepFailed(message));
            }

            self.state.paused = self.control.is_paused();
            self.state.stopped = self.control.is_stopped();

            if let Some(hook) = &on_step_start {
                hook(&self.state, &self.history);
            }

            let step_info = AgentStepInfo {
                step_number: self.state.n_steps,
                max_steps,
            };
            let step_token = self.control.token.child_token();
            let step_timeout = Duration::from_secs(self.settings.step_timeout);

            match tokio::time::timeout(step_timeout, self.step(step_info, &step_token)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_abort() => {
                    if self.control.is_stopped() {
                        info!("Step aborted by stop request");
                    } else {
                        warn!("Step aborted mid-flight: {e}");
                    }
                    break;
                }
                Ok(Err(e)) => {
                    error!("Step {} failed fatally: {e}", self.state.n_steps);
                    return Err(e);
                }
                Err(_) => {
                    step_token.cancel();
                    let message = format!(
                        "Step {} timed out after {} seconds",
                        self.state.n_steps, self.settings.step_timeout
                    );
                    error!("{message}");
                    self.history.add_step(AgentHistory {
                        result: vec![ActionResult::failure(&message)],
                        ..Default::default()
                    });
                    break;
                }
            }

            if let Some(hook) = &on_step_end {
                hook(&self.state, &self.history);
            }

            if self.history.is_done() {
                self.log_completion();
                if self.settings.use_judge {
                    self.run_full_judge().await;
                }
                if let Some(hook) = &on_done {
                    hook(&self.history);
                }
                return Ok(());
            }
        }

        if !self.history.is_done() && self.state.n_steps > max_steps {
            warn!("Failed to complete task in maximum steps");
            self.history.add_step(AgentHistory {
                result: vec![ActionResult::failure(
                    "Failed to complete task in maximum steps",
                )],
                ..Default::default()
            });
        }

        Ok(())
    }

    /// Bootstrap actions before the main loop. Without explicit initial
    /// actions, at most one URL extracted from the task becomes a
    /// `go_to_url`. Recorded as history step 0.
    async fn execute_initial_actions(&mut self) -> AgentResult<()> {
        if self.control.is_stopped() {
            return Ok(());
        }

        let mut actions = self.initial_actions.clone().unwrap_or_default();
        if actions.is_empty()
            && !self.state.follow_up_task
            && let Some(url) = extract_start_url(&self.task.text)
        {
            info!(url = %url, "Bootstrapping navigation from task text");
            actions.push(ActionInvocation::new(
                "go_to_url",
                json!({"url": url, "new_tab": false}),
            ));
        }
        if actions.is_empty() {
            return Ok(());
        }

        let start = now_seconds();
        let token = self.control.token.child_token();
        let results = self.multi_act(&actions, &token).await?;
        let url = self.browser.current_url().await.unwrap_or_default();

        self.state.last_result = Some(results.clone());
        self.history.add_step(AgentHistory {
            timestamp: None,
            model_output: Some(AgentOutput {
                action: actions,
                ..Default::default()
            }),
            result: results,
            state: BrowserStateHistory {
                url,
                ..Default::default()
            },
            metadata: Some(StepMetadata {
                step_start_time: start,
                step_end_time: now_seconds(),
                step_number: 0,
                step_interval: 0.0,
            }),
            state_message: None,
        });
        Ok(())
    }

    fn log_completion(&self) {
        let success = self.history.is_successful();
        info!(
            success = ?success,
            steps = self.state.n_steps - 1,
            "Task completed: {}",
            self.history.final_result().unwrap_or_default()
        );
    }

    /// Judge the finished trace with the LLM and attach the verdict to the
    /// final done result. Failures are logged and leave the history as-is.
    async fn run_full_judge(&mut self) {
        let llm = self.judge_llm.clone().unwrap_or_else(|| self.active_llm());
        let schema = json!({
            "type": "object",
            "properties": {
                "reasoning": {"type": ["string", "null"]},
                "verdict": {"type": "boolean"},
                "failure_reason": {"type": ["string", "null"]},
                "impossible_task": {"type": "boolean"},
                "reached_captcha": {"type": "boolean"},
            },
            "required": ["verdict"],
            "additionalProperties": false,
        });

        let mut transcript = format!("Task: {}\n\n", self.task.text);
        if let Some(ground_truth) = &self.settings.ground_truth {
            transcript.push_str(&format!("Ground truth: {ground_truth}\n\n"));
        }
        for (i, step) in self.history.history.iter().enumerate() {
            if let Some(output) = &step.model_output {
                if let Some(goal) = &output.next_goal {
                    transcript.push_str(&format!("Step {i} goal: {goal}\n"));
                }
                let names: Vec<&str> =
                    output.action.iter().map(|a| a.name.as_str()).collect();
                transcript.push_str(&format!("Step {i} actions: {}\n", names.join(", ")));
            }
            for result in &step.result {
                if let Some(content) = &result.extracted_content {
                    transcript.push_str(&format!("Step {i} result: {content}\n"));
                }
                if let Some(err) = &result.error {
                    transcript.push_str(&format!("Step {i} error: {err}\n"));
                }
            }
        }

        let messages = vec![
            ChatMessage::system(
                "You are judging whether a browser agent actually completed its task. \
                 Review the trace and return your verdict.",
            ),
            ChatMessage::user(transcript),
        ];

        match llm
            .ainvoke(
                &messages,
                Some(&schema),
                InvokeOptions {
                    session_id: Some(self.session_id.clone()),
                    request_type: Some("judge".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(result) => {
                if let Some(usage) = &result.usage {
                    self.usage.add(usage);
                }
                match serde_json::from_value::<JudgementResult>(result.completion.clone()) {
                    Ok(judgement) => {
                        info!(verdict = judgement.verdict, "Judge verdict recorded");
                        if let Some(step) = self.history.history.last_mut()
                            && let Some(done) = step.result.last_mut()
                        {
                            done.judgement = Some(judgement);
                        }
                    }
                    Err(e) => warn!("Judge returned an unparseable verdict: {e}"),
                }
            }
            Err(e) => warn!("Judge call failed: {e}"),
        }
    }

    /// End-of-run bookkeeping: usage summary, task update event, optional
    /// GIF artifact, event-bus stop, session close.
    async fn finish_run(&mut self) {
        self.history.usage = Some(self.usage);

        self.events.emit(AgentEvent::UpdateAgentTask {
            task_id: self.task_id.clone(),
            agent_id: self.state.agent_id.clone(),
            done: self.history.is_done(),
            success: self.history.is_successful(),
        });

        if self.settings.generate_gif
            && let Some(renderer) = &self.gif_renderer
            && let Some(path) = renderer(&self.history)
        {
            self.events.emit(AgentEvent::CreateAgentOutputFile {
                agent_id: self.state.agent_id.clone(),
                path: path.to_string_lossy().to_string(),
            });
        }

        self.events.stop();
        self.close().await;
    }

    /// Idempotent teardown honoring session claim counts
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.browser.release_agent(&self.state.agent_id);
        if self.browser.get_attached_agent_ids().is_empty() {
            if let Err(e) = self.browser.stop().await {
                warn!("Browser stop failed during close: {e}");
            }
            cleanup_session_step_lock(self.browser.id());
        } else {
            debug!("Other agents still attached; leaving browser session running");
        }

        if let Some(skills) = &self.skill_service {
            skills.close().await;
        }
    }
}
