//! Replay of recorded histories: element migration, retry elision,
//! persistence round-trips.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use common::{StubBrowser, StubLlm, StubReply, stub_node};
use pagepilot::agent::ReplayOptions;
use pagepilot::agent::views::{
    ActionInvocation, ActionResult, AgentHistory, AgentHistoryList, AgentOutput, AgentSettings,
};
use pagepilot::browser::{BrowserStateHistory, DomHistoryElement};
use pagepilot::filesystem::FileSystemState;
use pagepilot::utils::sensitive::{SensitiveData, SensitiveEntry};
use pagepilot::{Agent, Task};

fn replay_summary() -> serde_json::Value {
    json!({"summary": "replayed fine", "success": true, "completion_status": "complete"})
}

fn recorded_click_step(index: u32, exact: &str, stable: &str) -> AgentHistory {
    AgentHistory {
        model_output: Some(AgentOutput {
            action: vec![ActionInvocation::new(
                "click_element",
                json!({"index": index}),
            )],
            ..Default::default()
        }),
        result: vec![ActionResult::content(format!("Clicked element {index}"))],
        state: BrowserStateHistory {
            url: "https://app.test/".into(),
            interacted_element: vec![Some(DomHistoryElement {
                tag: "button".into(),
                xpath: "//button[1]".into(),
                highlight_index: index,
                attributes: HashMap::new(),
                exact_hash: exact.into(),
                stable_hash: stable.into(),
                ax_name: None,
            })],
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn build_agent(
    browser: Arc<StubBrowser>,
    llm: Arc<StubLlm>,
    dir: &tempfile::TempDir,
) -> Agent {
    Agent::builder(Task::new("replayed task"), llm, browser)
        .with_settings(AgentSettings {
            use_vision: pagepilot::VisionMode::Disabled,
            ..Default::default()
        })
        .with_file_system_state(FileSystemState {
            base_dir: dir.path().join("task"),
            files: HashMap::new(),
        })
        .build()
        .await
        .expect("build agent")
}

#[tokio::test]
async fn replay_rewrites_index_when_element_migrated() {
    let dir = tempfile::tempdir().unwrap();
    // The recorded element sat at index 12; on the live page the same
    // element (EXACT hash matches) is now index 7.
    let mut map = pagepilot::SelectorMap::new();
    map.insert(7, stub_node("button", "exact-abc", "stable-abc", "//button[3]"));
    map.insert(9, stub_node("a", "other", "other", "//a[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));
    let llm = Arc::new(StubLlm::new("primary", replay_summary()));

    let mut history = AgentHistoryList::new();
    history.add_step(recorded_click_step(12, "exact-abc", "stable-abc"));

    let mut agent = build_agent(browser.clone(), llm, &dir).await;
    let results = agent
        .rerun_history(&history, ReplayOptions::default())
        .await
        .expect("replay");

    assert_eq!(browser.clicks(), vec![7]);
    let done = results.last().expect("summary result");
    assert_eq!(done.is_done, Some(true));
    assert_eq!(done.success, Some(true));
}

#[tokio::test]
async fn replay_skips_redundant_retry_of_same_element() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = pagepilot::SelectorMap::new();
    map.insert(3, stub_node("button", "exact-abc", "stable-abc", "//button[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));
    let llm = Arc::new(StubLlm::new("primary", replay_summary()));

    let mut history = AgentHistoryList::new();
    history.add_step(recorded_click_step(3, "exact-abc", "stable-abc"));
    history.add_step(recorded_click_step(3, "exact-abc", "stable-abc"));

    let mut agent = build_agent(browser.clone(), llm, &dir).await;
    let options = ReplayOptions {
        delay_between_actions: Some(0.01),
        ..Default::default()
    };
    agent.rerun_history(&history, options).await.expect("replay");

    assert_eq!(browser.clicks().len(), 1, "second identical step is elided");
}

#[tokio::test]
async fn replay_skips_recorded_failures_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = pagepilot::SelectorMap::new();
    map.insert(4, stub_node("button", "exact-1", "stable-1", "//button[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));
    let llm = Arc::new(StubLlm::new("primary", replay_summary()));

    let mut failed_step = recorded_click_step(4, "exact-1", "stable-1");
    failed_step.result = vec![ActionResult::failure("element vanished")];

    let mut history = AgentHistoryList::new();
    history.add_step(failed_step);

    let mut agent = build_agent(browser.clone(), llm, &dir).await;
    let options = ReplayOptions {
        skip_failures: true,
        ..Default::default()
    };
    agent.rerun_history(&history, options).await.expect("replay");

    assert!(browser.clicks().is_empty());
}

#[tokio::test]
async fn replay_turns_extract_actions_into_ai_steps() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    *browser.markdown.lock().unwrap() = "# Products\nWidget: $5".to_string();

    let llm = Arc::new(StubLlm::new("primary", replay_summary()));
    llm.push(StubReply::Text("The widget costs $5".into()));

    let mut history = AgentHistoryList::new();
    history.add_step(AgentHistory {
        model_output: Some(AgentOutput {
            action: vec![ActionInvocation::new(
                "extract_structured_data",
                json!({"query": "What does the widget cost?"}),
            )],
            ..Default::default()
        }),
        result: vec![ActionResult::content("recorded extraction")],
        ..Default::default()
    });

    let mut agent = build_agent(browser, llm.clone(), &dir).await;
    let results = agent
        .rerun_history(&history, ReplayOptions::default())
        .await
        .expect("replay");

    assert!(
        results
            .iter()
            .any(|r| r.extracted_content.as_deref() == Some("The widget costs $5"))
    );
    // The AI step received the live page content, not the recorded one
    assert!(llm.call_text(0).contains("Widget: $5"));
}

#[test]
fn history_save_load_roundtrips_and_redacts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    let mut history = AgentHistoryList::new();
    history.add_step(AgentHistory {
        model_output: Some(AgentOutput {
            next_goal: Some("log in".into()),
            action: vec![ActionInvocation::new(
                "input_text",
                json!({"index": 2, "text": "hunter2", "clear": true}),
            )],
            ..Default::default()
        }),
        result: vec![ActionResult::content("typed password")],
        ..Default::default()
    });

    let mut sensitive = SensitiveData::new();
    sensitive.insert(
        "password".into(),
        SensitiveEntry::Value("hunter2".into()),
    );

    history
        .save_to_file(&path, Some(&sensitive))
        .expect("save with redaction");
    let raw = std::fs::read_to_string(&path).expect("read file");
    assert!(!raw.contains("hunter2"), "secret must not appear verbatim");
    assert!(raw.contains("<secret>password</secret>"));

    // Round-trip without redaction is byte-stable modulo key order
    let plain_path = dir.path().join("plain.json");
    history.save_to_file(&plain_path, None).expect("save");
    let loaded = AgentHistoryList::load_from_file(&plain_path).expect("load");
    assert_eq!(
        serde_json::to_value(&loaded.history[0].model_output).unwrap(),
        serde_json::to_value(&history.history[0].model_output).unwrap(),
    );
    assert_eq!(loaded.history.len(), history.history.len());
}

#[test]
fn detected_variables_are_substituted_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    let mut history = AgentHistoryList::new();
    history.add_step(AgentHistory {
        model_output: Some(AgentOutput {
            action: vec![ActionInvocation::new(
                "input_text",
                json!({"index": 1, "text": "alice", "clear": true}),
            )],
            ..Default::default()
        }),
        ..Default::default()
    });
    history.save_to_file(&path, None).expect("save");

    let variables = pagepilot::agent::replay::detect_variables(&history);
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].name, "text_1");
    assert_eq!(variables[0].value, "alice");
}

#[tokio::test]
async fn load_and_rerun_substitutes_variables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    let mut history = AgentHistoryList::new();
    history.add_step(AgentHistory {
        model_output: Some(AgentOutput {
            action: vec![ActionInvocation::new(
                "input_text",
                json!({"index": 1, "text": "alice", "clear": true}),
            )],
            ..Default::default()
        }),
        result: vec![ActionResult::content("typed")],
        ..Default::default()
    });
    history.save_to_file(&path, None).expect("save");

    let mut map = pagepilot::SelectorMap::new();
    map.insert(1, stub_node("input", "e", "s", "//input[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));
    let llm = Arc::new(StubLlm::new("primary", replay_summary()));

    let mut agent = build_agent(browser.clone(), llm, &dir).await;
    let mut variables = HashMap::new();
    variables.insert("text_1".to_string(), "bob".to_string());
    agent
        .load_and_rerun(&path, &variables, ReplayOptions::default())
        .await
        .expect("load and rerun");

    let typed = browser.typed.lock().unwrap().clone();
    assert_eq!(typed, vec![(1, "bob".to_string())]);
}
