//! Sequential action execution for one step.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::agent::Agent;
use crate::agent::views::{ActionInvocation, ActionResult};
use crate::agent::{AgentError, AgentResult};
use crate::browser::BrowserError;
use crate::registry::ActionContext;

impl Agent {
    pub(crate) fn action_context(&self, signal: &CancellationToken) -> ActionContext {
        ActionContext {
            browser_session: self.browser.clone(),
            page_extraction_llm: self
                .page_extraction_llm
                .clone()
                .or_else(|| Some(self.active_llm())),
            extraction_schema: self.task.output_schema.clone(),
            sensitive_data: self.sensitive_data.clone(),
            available_file_paths: self.available_file_paths.clone(),
            file_system: self.file_system.clone(),
            signal: Some(signal.clone()),
            context: self.context.clone(),
        }
    }

    /// Run the step's actions in order. The sequence stops early when:
    /// an embedded `done` appears past index 0 (without running it), an
    /// action flagged `terminates_sequence` ran, the page URL or active tab
    /// changed, or a result carried `is_done` or `error`.
    pub(crate) async fn multi_act(
        &mut self,
        actions: &[ActionInvocation],
        signal: &CancellationToken,
    ) -> AgentResult<Vec<ActionResult>> {
        let mut results = Vec::with_capacity(actions.len());
        let total = actions.len();
        let wait_between = self.browser.profile().wait_between_actions;

        let mut url_before = self.browser.current_url().await.ok();
        let mut tab_before = self.browser.current_tab_id().await.ok().flatten();

        for (i, action) in actions.iter().enumerate() {
            if signal.is_cancelled() {
                return Err(AgentError::Aborted);
            }
            if i > 0 && wait_between > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait_between)).await;
            }

            let resolved = self.registry.resolve_name(&action.name);
            if resolved == "done" && i > 0 {
                info!("Embedded done after index 0 terminates the sequence early");
                break;
            }

            debug!(action = %resolved, index = i, "Executing action");
            let context = self.action_context(signal);
            let result = self
                .registry
                .execute_action(&action.name, action.params.clone(), context)
                .await
                .map_err(|e| match e {
                    BrowserError::Aborted => AgentError::Aborted,
                    other => AgentError::Browser(other),
                })?;

            let is_done = result.is_done == Some(true);
            let has_error = result.error.is_some();
            results.push(result);

            if is_done || has_error {
                break;
            }
            if self.registry.terminates_sequence(&resolved) {
                break;
            }

            // The LLM addressed elements of the page it last observed; once
            // the page or the focused tab changed it must re-observe.
            let url_after = self.browser.current_url().await.ok();
            let tab_after = self.browser.current_tab_id().await.ok().flatten();
            if i + 1 < total && (url_after != url_before || tab_after != tab_before) {
                info!("Page state changed after action; stopping sequence for re-observation");
                break;
            }
            url_before = url_after;
            tab_before = tab_after;
        }

        Ok(results)
    }
}
