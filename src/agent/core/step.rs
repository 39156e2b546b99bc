//! One agent step: prepare → decide → act → post-process → finalize.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::agent::Agent;
use crate::agent::views::{
    ActionResult, AgentHistory, AgentOutput, AgentStepInfo, StepMetadata,
};
use crate::agent::{AgentError, AgentResult};
use crate::browser::{
    AttachMode, BrowserError, BrowserStateHistory, BrowserStateSummary, DomHistoryElement,
    StateCaptureOptions, session_step_lock,
};
use crate::events::AgentEvent;
use crate::utils::now_seconds;

const DONE_ONLY_NUDGE: &str = "You must now finish: respond with a single \"done\" action. Set \
success=true only if the task is fully complete, otherwise success=false with what you found.";

const REPLAN_NUDGE: &str = "Your recent steps kept failing. Re-evaluate the plan: update it with \
plan_update if the current approach cannot work.";

const EXPLORATION_NUDGE: &str = "You have explored for a while without a plan. Write one now via \
plan_update: short, concrete steps towards the task.";

const BUDGET_NUDGE: &str = "You have used most of your step budget. Focus on completing the task \
directly; skip optional exploration.";

impl Agent {
    /// Execute one step under `signal`. Decision and action failures are
    /// accounted and recorded; only abort-kind errors escape.
    pub(crate) async fn step(
        &mut self,
        step_info: AgentStepInfo,
        signal: &CancellationToken,
    ) -> AgentResult<()> {
        let step_start = now_seconds();
        let shared = self.settings.session_attachment_mode == AttachMode::Shared;
        let _step_guard = if shared {
            Some(session_step_lock(self.browser.id()).lock_owned().await)
        } else {
            None
        };

        if shared {
            self.restore_pinned_tab().await;
        }

        if signal.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        // (a) prepare: capture browser state
        let capture_options = StateCaptureOptions {
            cache_clickable_elements_hashes: true,
            include_screenshot: self.settings.use_vision.includes_state_images(),
            include_recent_events: self.settings.include_recent_events,
            signal: Some(signal.clone()),
        };
        let browser_state = match self.browser.get_browser_state(capture_options).await {
            Ok(state) => state,
            Err(BrowserError::Aborted) => return Err(AgentError::Aborted),
            Err(e) => {
                self.record_failed_step(
                    step_start,
                    step_info.step_number,
                    format!("Browser state capture failed: {e}"),
                )
                .await?;
                return Ok(());
            }
        };

        if shared {
            self.pinned_tab = self.browser.current_tab_id().await.ok().flatten();
        }

        // Screenshot persistence is best-effort; a failed write never fails
        // the step.
        let screenshot_path = match &browser_state.screenshot {
            Some(data) => {
                let fs = self.file_system.lock().await;
                match fs.save_screenshot(self.state.n_steps, data).await {
                    Ok(path) => Some(path.to_string_lossy().to_string()),
                    Err(e) => {
                        warn!("Failed to store step screenshot: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        // Refresh the action catalog for the current page
        let mut action_model = self
            .registry
            .create_action_model(None, Some(&browser_state.url));

        if let Some(skills) = self.skill_service.clone() {
            let cookies = self.browser.get_cookies().await.unwrap_or_default();
            if let Some(info) = skills.unavailable_skill_info(&cookies).await {
                self.message_manager.add_context_message(info);
            }
        }

        let last_output = self.state.last_model_output.clone();
        let last_result = self.state.last_result.clone();
        self.message_manager
            .prepare_step_state(last_output.as_ref(), last_result.as_deref());

        if self.settings.message_compaction.enabled {
            let compaction_llm = self
                .compaction_llm
                .clone()
                .unwrap_or_else(|| self.active_llm());
            let _ = self
                .message_manager
                .maybe_compact_messages(
                    compaction_llm.as_ref(),
                    &self.settings.message_compaction,
                )
                .await;
        }

        let state_message = self.message_manager.create_state_messages(
            &browser_state,
            last_result.as_deref(),
            &step_info,
            &self.state.plan,
            &self.settings,
        );

        self.inject_planning_nudges(&step_info);

        if self.settings.loop_detection_enabled {
            self.state.loop_detector.record_page_state(
                &browser_state.url,
                &browser_state.element_tree,
                browser_state.selector_map.len(),
            );
            if let Some(nudge) = self.state.loop_detector.get_nudge_message() {
                debug!("Injecting loop-detector nudge");
                self.message_manager.add_context_message(nudge);
            }
        }

        let done_only = step_info.is_last_step()
            || self.state.consecutive_failures >= self.settings.max_failures;
        if done_only {
            self.message_manager.add_context_message(DONE_ONLY_NUDGE);
            action_model = self
                .registry
                .create_action_model(Some(&["done".to_string()]), Some(&browser_state.url));
        }

        // (b) decide
        let output = match self.decide(&action_model, signal).await {
            Ok(output) => output,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                warn!("Step {} decision failed: {e}", self.state.n_steps);
                self.state.consecutive_failures += 1;
                self.state.last_model_output = None;
                let failure = vec![ActionResult::failure(e.to_string())];
                self.state.last_result = Some(failure.clone());
                self.finalize_step(
                    step_start,
                    step_info.step_number,
                    None,
                    failure,
                    &browser_state,
                    screenshot_path,
                    Some(state_message),
                )
                .await?;
                return Ok(());
            }
        };

        // (c) act
        let results = match self.multi_act(&output.action, signal).await {
            Ok(results) => results,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                warn!("Step {} action execution failed: {e}", self.state.n_steps);
                self.state.consecutive_failures += 1;
                let failure = vec![ActionResult::failure(e.to_string())];
                self.state.last_model_output = Some(output.clone());
                self.state.last_result = Some(failure.clone());
                self.finalize_step(
                    step_start,
                    step_info.step_number,
                    Some(output),
                    failure,
                    &browser_state,
                    screenshot_path,
                    Some(state_message),
                )
                .await?;
                return Ok(());
            }
        };

        // (d) post-process
        let downloads = self.browser.downloaded_files().await;
        for file in downloads {
            if !self.available_file_paths.contains(&file) {
                debug!(file = %file, "New downloaded file available");
                self.available_file_paths.push(file);
            }
        }

        if self.state.plan.update_from_output(&output) {
            self.state.plan_generation_step = Some(self.state.n_steps);
        }

        if self.settings.loop_detection_enabled {
            for action in &output.action {
                self.state
                    .loop_detector
                    .record_action(&action.name, &action.params);
            }
        }

        if results.len() == 1 && results[0].error.is_some() {
            self.state.consecutive_failures += 1;
        } else {
            self.state.consecutive_failures = 0;
        }

        self.state.last_model_output = Some(output.clone());
        self.state.last_result = Some(results.clone());

        // (e) finalize
        self.finalize_step(
            step_start,
            step_info.step_number,
            Some(output),
            results,
            &browser_state,
            screenshot_path,
            Some(state_message),
        )
        .await
    }

    async fn restore_pinned_tab(&mut self) {
        if let Some(pinned) = self.pinned_tab.clone() {
            let current = self.browser.current_tab_id().await.ok().flatten();
            if current.as_deref() != Some(pinned.as_str()) {
                debug!(tab = %pinned, "Restoring pinned tab after drift");
                if let Err(e) = self.browser.switch_to_tab(&pinned).await {
                    warn!("Failed to restore pinned tab: {e}");
                }
            }
        }
    }

    /// REPLAN, EXPLORATION, then BUDGET, each at most once per step
    fn inject_planning_nudges(&mut self, step_info: &AgentStepInfo) {
        if self.settings.planning_enabled() {
            if !self.state.plan.is_empty()
                && self.state.consecutive_failures >= self.settings.planning_replan_on_stall
            {
                self.message_manager.add_context_message(REPLAN_NUDGE);
            } else if self.state.plan.is_empty()
                && self.state.n_steps >= self.settings.planning_exploration_limit
            {
                self.message_manager.add_context_message(EXPLORATION_NUDGE);
            }
        }

        let used = f64::from(step_info.step_number);
        let max = f64::from(step_info.max_steps);
        if max > 0.0 && used / max >= 0.75 && !step_info.is_last_step() {
            self.message_manager.add_context_message(BUDGET_NUDGE);
        }
    }

    /// Record a step that failed before producing model output
    async fn record_failed_step(
        &mut self,
        step_start: f64,
        step_number: u32,
        message: String,
    ) -> AgentResult<()> {
        warn!("{message}");
        self.state.consecutive_failures += 1;
        let failure = vec![ActionResult::failure(&message)];
        self.state.last_model_output = None;
        self.state.last_result = Some(failure.clone());
        self.finalize_step(
            step_start,
            step_number,
            None,
            failure,
            &BrowserStateSummary::default(),
            None,
            None,
        )
        .await
    }

    /// (e) finalize: metadata, history entry with mapped DOM descriptors,
    /// file-system persistence, step event, `n_steps` increment.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finalize_step(
        &mut self,
        step_start: f64,
        step_number: u32,
        output: Option<AgentOutput>,
        results: Vec<ActionResult>,
        browser_state: &BrowserStateSummary,
        screenshot_path: Option<String>,
        state_message: Option<String>,
    ) -> AgentResult<()> {
        let step_end = now_seconds();
        let metadata = StepMetadata {
            step_start_time: step_start,
            step_end_time: step_end,
            step_number,
            step_interval: self.last_step_duration,
        };
        self.last_step_duration = step_end - step_start;

        let interacted_element: Vec<Option<DomHistoryElement>> = output
            .as_ref()
            .map(|o| {
                o.action
                    .iter()
                    .map(|action| {
                        action
                            .params
                            .get("index")
                            .and_then(Value::as_u64)
                            .and_then(|index| {
                                let index = index as u32;
                                browser_state
                                    .selector_map
                                    .get(&index)
                                    .map(|node| DomHistoryElement::from_node(index, node))
                            })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let action_names: Vec<String> = output
            .as_ref()
            .map(|o| o.action.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default();

        self.history.add_step(AgentHistory {
            timestamp: None,
            model_output: output,
            result: results,
            state: BrowserStateHistory {
                url: browser_state.url.clone(),
                title: browser_state.title.clone(),
                tabs: browser_state.tabs.clone(),
                interacted_element,
                screenshot_path,
            },
            metadata: Some(metadata),
            state_message,
        });

        {
            let fs = self.file_system.lock().await;
            self.state.file_system_state = Some(fs.state());
        }
        self.state.message_manager_state = self.message_manager.state();

        self.events.emit(AgentEvent::CreateAgentStep {
            agent_id: self.state.agent_id.clone(),
            step: step_number,
            url: browser_state.url.clone(),
            actions: action_names,
        });

        self.state.n_steps += 1;
        Ok(())
    }
}
