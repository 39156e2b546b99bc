//! Built-in actions registered into the action registry.
//!
//! Each action is a typed parameter struct plus an async handler over the
//! browser session facade.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::agent::views::{ActionResult, AgentSettings};
use crate::browser::BrowserError;
use crate::llm::{ChatMessage, InvokeOptions};
use crate::registry::{ActionContext, ActionRegistry, RegisterOptions, RegistryError};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GoToUrlParams {
    pub url: String,
    #[serde(default)]
    pub new_tab: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct NoParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WaitParams {
    /// Seconds to wait; defaults to 3
    #[serde(default)]
    pub seconds: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ClickElementParams {
    /// Highlight index of the element to click
    pub index: u32,
}

fn default_clear() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InputTextParams {
    /// Highlight index of the input element
    pub index: u32,
    pub text: String,
    /// Clear the field before typing
    #[serde(default = "default_clear")]
    pub clear: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
    Left,
    Right,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ScrollParams {
    #[serde(default)]
    pub direction: ScrollDirection,
    /// Pixels to scroll; defaults to 500, clamped to [1, 10000]
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SendKeysParams {
    /// Key or key name to dispatch to the focused element, e.g. "Enter"
    pub keys: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SwitchTabParams {
    pub tab_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExtractParams {
    /// What to extract from the current page
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TakeScreenshotParams {
    #[serde(default)]
    pub full_page: bool,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DoneParams {
    /// Whether the task was completed successfully
    #[serde(default = "default_success")]
    pub success: bool,
    /// Final answer or completion summary
    pub text: String,
    /// File paths to attach to the final result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_to_display: Option<Vec<String>>,
}

/// Register the default action set. `take_screenshot` is omitted only when
/// `use_vision == "auto"`.
pub fn register_default_actions(
    registry: &mut ActionRegistry,
    settings: &AgentSettings,
) -> Result<(), RegistryError> {
    registry.register::<GoToUrlParams, _, _>(
        "go_to_url",
        "Navigate to a URL, optionally in a new tab",
        RegisterOptions::default(),
        |params: GoToUrlParams, ctx: ActionContext| async move {
            ctx.browser_session
                .navigate(&params.url, params.new_tab)
                .await?;
            Ok(ActionResult::content(format!(
                "Navigated to {}",
                params.url
            )))
        },
    )?;

    registry.register::<NoParams, _, _>(
        "go_back",
        "Go back in browser history",
        RegisterOptions::default(),
        |_params: NoParams, ctx: ActionContext| async move {
            ctx.browser_session.go_back().await?;
            Ok(ActionResult::content("Navigated back"))
        },
    )?;

    registry.register::<WaitParams, _, _>(
        "wait",
        "Wait for the page to settle before continuing",
        RegisterOptions::default(),
        |params: WaitParams, ctx: ActionContext| async move {
            let seconds = params.seconds.unwrap_or(3.0).clamp(0.1, 30.0);
            let sleep = tokio::time::sleep(Duration::from_secs_f64(seconds));
            match &ctx.signal {
                Some(signal) => {
                    tokio::select! {
                        _ = signal.cancelled() => return Err(BrowserError::Aborted),
                        _ = sleep => {}
                    }
                }
                None => sleep.await,
            }
            Ok(ActionResult::content(format!("Waited {seconds} seconds")))
        },
    )?;

    registry.register::<ClickElementParams, _, _>(
        "click_element",
        "Click an interactive element by its highlight index",
        RegisterOptions::default(),
        |params: ClickElementParams, ctx: ActionContext| async move {
            ctx.browser_session.click_element(params.index).await?;
            Ok(ActionResult::content(format!(
                "Clicked element {}",
                params.index
            )))
        },
    )?;

    registry.register::<InputTextParams, _, _>(
        "input_text",
        "Type text into an input element by its highlight index",
        RegisterOptions::default(),
        |params: InputTextParams, ctx: ActionContext| async move {
            ctx.browser_session
                .input_text(params.index, &params.text, params.clear)
                .await?;
            Ok(ActionResult::content(format!(
                "Typed into element {}",
                params.index
            )))
        },
    )?;

    registry.register::<ScrollParams, _, _>(
        "scroll",
        "Scroll the page in a direction",
        RegisterOptions::default(),
        |params: ScrollParams, ctx: ActionContext| async move {
            let amount = params.amount.unwrap_or(500);
            let clamped = amount.clamp(1, 10_000);
            if clamped != amount {
                warn!("Scroll amount {amount} out of range [1, 10000], clamped to {clamped}");
            }
            let (dx, dy) = match params.direction {
                ScrollDirection::Down => (0, clamped),
                ScrollDirection::Up => (0, -clamped),
                ScrollDirection::Left => (-clamped, 0),
                ScrollDirection::Right => (clamped, 0),
            };
            ctx.browser_session.scroll_by(dx, dy).await?;
            Ok(ActionResult::content(format!("Scrolled by ({dx}, {dy})")))
        },
    )?;

    registry.register::<SendKeysParams, _, _>(
        "send_keys",
        "Send a keyboard key to the focused element, e.g. Enter or Escape",
        RegisterOptions::default(),
        |params: SendKeysParams, ctx: ActionContext| async move {
            ctx.browser_session.send_keys(&params.keys).await?;
            Ok(ActionResult::content(format!("Sent keys {}", params.keys)))
        },
    )?;

    registry.register::<SwitchTabParams, _, _>(
        "switch_tab",
        "Switch to another open tab by its id",
        RegisterOptions {
            terminates_sequence: true,
            ..Default::default()
        },
        |params: SwitchTabParams, ctx: ActionContext| async move {
            ctx.browser_session.switch_to_tab(&params.tab_id).await?;
            Ok(ActionResult::content(format!(
                "Switched to tab {}",
                params.tab_id
            )))
        },
    )?;

    registry.register::<ExtractParams, _, _>(
        "extract_structured_data",
        "Extract content from the current page answering a query",
        RegisterOptions::default(),
        |params: ExtractParams, ctx: ActionContext| async move {
            let markdown = ctx.browser_session.page_markdown().await?;
            let url = ctx
                .browser_session
                .current_url()
                .await
                .unwrap_or_else(|_| "the current page".to_string());

            let Some(llm) = &ctx.page_extraction_llm else {
                // Without an extraction model, return the raw markdown.
                return Ok(ActionResult {
                    extracted_content: Some(markdown),
                    include_in_memory: true,
                    include_extracted_content_only_once: true,
                    long_term_memory: Some(format!("Extracted page content from {url}")),
                    ..Default::default()
                });
            };

            let mut prompt = format!(
                "Answer the query using only the page content below.\n\nQuery: {}\n\n",
                params.query
            );
            if let Some(schema) = &ctx.extraction_schema {
                prompt.push_str(&format!(
                    "Return JSON conforming to this schema:\n{schema}\n\n"
                ));
            }
            prompt.push_str(&format!("Page content of {url}:\n{markdown}"));

            let result = llm
                .ainvoke(
                    &[ChatMessage::user(prompt)],
                    ctx.extraction_schema.as_ref(),
                    InvokeOptions {
                        signal: ctx.signal.clone(),
                        request_type: Some("extraction".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| BrowserError::action(format!("extraction failed: {e}")))?;

            Ok(ActionResult {
                extracted_content: Some(result.completion_text()),
                include_in_memory: true,
                include_extracted_content_only_once: true,
                long_term_memory: Some(format!(
                    "Extracted data from {url} for query: {}",
                    params.query
                )),
                ..Default::default()
            })
        },
    )?;

    if settings.use_vision.exposes_screenshot_action() {
        registry.register::<TakeScreenshotParams, _, _>(
            "take_screenshot",
            "Capture a screenshot of the current page",
            RegisterOptions::default(),
            |params: TakeScreenshotParams, ctx: ActionContext| async move {
                let data = ctx
                    .browser_session
                    .take_screenshot(params.full_page)
                    .await?;
                Ok(ActionResult {
                    extracted_content: Some("Captured screenshot".into()),
                    images: Some(vec![crate::agent::views::ImageData {
                        name: "screenshot.png".into(),
                        data,
                    }]),
                    include_in_memory: true,
                    ..Default::default()
                })
            },
        )?;
    }

    registry.register::<DoneParams, _, _>(
        "done",
        "Mark the task as finished with the final answer",
        RegisterOptions {
            terminates_sequence: true,
            ..Default::default()
        },
        |params: DoneParams, ctx: ActionContext| async move {
            let attachments = params.files_to_display.map(|files| {
                files
                    .into_iter()
                    .filter(|f| {
                        ctx.available_file_paths.iter().any(|p| p == f)
                            || std::path::Path::new(f).exists()
                    })
                    .collect::<Vec<_>>()
            });
            Ok(ActionResult {
                is_done: Some(true),
                success: Some(params.success),
                extracted_content: Some(params.text),
                include_in_memory: true,
                attachments,
                ..Default::default()
            })
        },
    )?;

    registry.register_alias("navigate", "go_to_url");
    registry.register_alias("extract", "extract_structured_data");

    Ok(())
}

/// Canonical parameters for a synthetic failed done action
pub fn synthetic_failed_done(text: &str) -> serde_json::Value {
    json!({"success": false, "text": text})
}
