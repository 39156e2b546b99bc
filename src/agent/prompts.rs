//! System prompt and per-step state message rendering.

use crate::agent::plan::Plan;
use crate::agent::views::{ActionResult, AgentSettings, AgentStepInfo};
use crate::browser::BrowserStateSummary;

/// System prompt configuration
#[derive(Debug, Clone, Default)]
pub struct SystemPrompt {
    pub action_description: String,
    pub max_actions_per_step: usize,
    pub override_system_message: Option<String>,
    pub extend_system_message: Option<String>,
    pub flash_mode: bool,
    pub use_thinking: bool,
    pub include_tool_call_examples: bool,
}

impl SystemPrompt {
    pub fn build(&self) -> String {
        if let Some(message) = &self.override_system_message {
            return message.clone();
        }

        let mut prompt = String::from(
            "You are an autonomous browser automation agent. You are given a task, and on \
             every step the current browser state: URL, title, open tabs, and the \
             interactive elements of the page, each addressable by its numeric index.\n\n",
        );

        prompt.push_str("Available actions:\n");
        prompt.push_str(&self.action_description);
        prompt.push('\n');

        prompt.push_str(&format!(
            "\nRespond with a single JSON object. Provide at most {} actions per step, \
             executed in order. Stop describing actions once the page will change, because \
             you must observe the new state first.\n",
            self.max_actions_per_step
        ));

        if self.flash_mode {
            prompt.push_str("Return only the \"action\" array.\n");
        } else if self.use_thinking {
            prompt.push_str(
                "Fill \"thinking\" with your reasoning, \"evaluation_previous_goal\" with an \
                 assessment of the last step, \"memory\" with facts worth keeping, and \
                 \"next_goal\" with your immediate goal.\n",
            );
        } else {
            prompt.push_str(
                "Fill \"evaluation_previous_goal\", \"memory\" and \"next_goal\" with short \
                 statements about progress.\n",
            );
        }

        prompt.push_str(
            "\nRules:\n\
             - Interact with elements only via their numeric index.\n\
             - The \"done\" action must be the only action of its step. Use it once the task \
               is complete, with success=true, or when you cannot proceed, with success=false.\n\
             - If a page is not what you expected, navigate or go back instead of retrying \
               the same interaction.\n",
        );

        if self.include_tool_call_examples {
            prompt.push_str(
                "\nExample action list:\n\
                 [{\"go_to_url\": {\"url\": \"https://example.com\", \"new_tab\": false}},\n \
                 {\"click_element\": {\"index\": 12}}]\n",
            );
        }

        if let Some(extension) = &self.extend_system_message {
            prompt.push('\n');
            prompt.push_str(extension);
        }

        prompt
    }
}

/// Render one step's browser state message shown to the LLM
pub fn render_state_message(
    browser_state: &BrowserStateSummary,
    last_results: Option<&[ActionResult]>,
    step_info: &AgentStepInfo,
    plan: &Plan,
    settings: &AgentSettings,
) -> String {
    let mut message = String::new();

    message.push_str(&format!(
        "Current URL: {}\nPage title: {}\n",
        browser_state.url, browser_state.title
    ));

    if !browser_state.tabs.is_empty() {
        message.push_str("Open tabs:\n");
        for tab in &browser_state.tabs {
            message.push_str(&format!("- {} ({})\n", tab.id, tab.url));
        }
    }

    message.push_str("\nInteractive elements:\n");
    if browser_state.element_tree.is_empty() {
        message.push_str("(no interactive elements found)\n");
    } else {
        message.push_str(&browser_state.element_tree);
        message.push('\n');
    }

    if settings.include_recent_events
        && let Some(events) = &browser_state.recent_events
    {
        message.push_str("\nRecent browser events:\n");
        message.push_str(events);
        message.push('\n');
    }

    if let Some(results) = last_results {
        let remembered: Vec<&ActionResult> =
            results.iter().filter(|r| r.include_in_memory).collect();
        if !remembered.is_empty() {
            message.push_str("\nResults of your previous actions:\n");
            for (i, result) in remembered.iter().enumerate() {
                if let Some(content) = &result.extracted_content {
                    message.push_str(&format!("Action {}: {}\n", i + 1, content));
                }
                if let Some(error) = &result.error {
                    message.push_str(&format!("Action {} failed: {}\n", i + 1, error));
                }
            }
        }
    }

    if !plan.is_empty() {
        message.push_str("\nCurrent plan:\n");
        message.push_str(&plan.render());
        message.push('\n');
    }

    message.push_str(&format!(
        "\nStep {} of {}.\n",
        step_info.step_number, step_info.max_steps
    ));

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::views::AgentSettings;

    #[test]
    fn override_replaces_everything() {
        let prompt = SystemPrompt {
            override_system_message: Some("custom".into()),
            ..Default::default()
        };
        assert_eq!(prompt.build(), "custom");
    }

    #[test]
    fn state_message_includes_memory_filtered_results() {
        let state = BrowserStateSummary {
            url: "https://example.com".into(),
            title: "Example".into(),
            element_tree: "[1]<button>Go</button>".into(),
            ..Default::default()
        };
        let results = vec![
            ActionResult {
                extracted_content: Some("kept".into()),
                include_in_memory: true,
                ..Default::default()
            },
            ActionResult {
                extracted_content: Some("dropped".into()),
                include_in_memory: false,
                ..Default::default()
            },
        ];
        let message = render_state_message(
            &state,
            Some(&results),
            &AgentStepInfo {
                step_number: 2,
                max_steps: 10,
            },
            &Plan::default(),
            &AgentSettings::default(),
        );
        assert!(message.contains("kept"));
        assert!(!message.contains("dropped"));
        assert!(message.contains("Step 2 of 10"));
    }

    #[test]
    fn state_message_renders_plan_markers() {
        let mut plan = Plan::default();
        plan.replace(vec!["first".into(), "second".into()]);
        let state = BrowserStateSummary::default();
        let message = render_state_message(
            &state,
            None,
            &AgentStepInfo {
                step_number: 1,
                max_steps: 5,
            },
            &plan,
            &AgentSettings::default(),
        );
        assert!(message.contains("[>] first"));
        assert!(message.contains("[ ] second"));
    }
}
