//! End-to-end runs of the agent loop against stub browser and LLM.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use common::{StubBrowser, StubLlm, StubReply, done_output, stub_node};
use pagepilot::agent::views::AgentSettings;
use pagepilot::filesystem::FileSystemState;
use pagepilot::{Agent, Task};

fn test_settings() -> AgentSettings {
    AgentSettings {
        use_vision: pagepilot::VisionMode::Disabled,
        loop_detection_window: 3,
        ..Default::default()
    }
}

fn temp_fs_state(dir: &tempfile::TempDir) -> FileSystemState {
    FileSystemState {
        base_dir: dir.path().join("task"),
        files: HashMap::new(),
    }
}

#[tokio::test]
async fn start_url_is_extracted_from_task() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(true, "booked")));

    let mut agent = Agent::builder(
        Task::new("Find the cheapest flight on https://example.com/search"),
        llm.clone(),
        browser.clone(),
    )
    .with_settings(test_settings())
    .with_file_system_state(temp_fs_state(&dir))
    .build()
    .await
    .expect("build agent");

    let history = agent.run(10).await.expect("run");

    assert_eq!(
        browser.navigations(),
        vec![("https://example.com/search".to_string(), false)]
    );

    // Step 0 records exactly the bootstrap navigation
    let step0 = &history.history[0];
    assert_eq!(step0.metadata.unwrap().step_number, 0);
    let actions = &step0.model_output.as_ref().unwrap().action;
    assert_eq!(actions.len(), 1);
    assert_eq!(
        serde_json::to_value(&actions[0]).unwrap(),
        json!({"go_to_url": {"url": "https://example.com/search", "new_tab": false}})
    );

    assert!(history.is_done());
    assert_eq!(history.is_successful(), Some(true));
}

#[tokio::test]
async fn negated_url_is_not_bootstrapped() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(true, "done")));

    let mut agent = Agent::builder(
        Task::new("Never go to http://evil.test, use search instead"),
        llm,
        browser.clone(),
    )
    .with_settings(test_settings())
    .with_file_system_state(temp_fs_state(&dir))
    .build()
    .await
    .expect("build agent");

    let history = agent.run(10).await.expect("run");

    assert!(browser.navigations().is_empty());
    // No synthetic step 0: the first entry is the first real step
    assert_eq!(history.history[0].metadata.unwrap().step_number, 1);
}

#[tokio::test]
async fn max_failures_grants_one_done_only_recovery_step() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(false, "gave up")));
    llm.push(StubReply::Text("definitely not json".into()));
    llm.push(StubReply::Text("still not json".into()));

    let settings = AgentSettings {
        max_failures: 2,
        final_response_after_failure: true,
        ..test_settings()
    };

    let mut agent = Agent::builder(Task::new("impossible task"), llm.clone(), browser)
        .with_settings(settings)
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(10).await.expect("run");

    // Two unparseable replies then a recovery step restricted to done
    assert_eq!(llm.call_count(), 3);
    assert!(history.history[0].result[0].error.is_some());
    assert!(history.history[1].result[0].error.is_some());
    assert!(
        llm.call_text(2).contains("You must now finish"),
        "done-only enforcement message must be present in the recovery call"
    );
    assert!(history.is_done());
    assert_eq!(history.is_successful(), Some(false));
    assert!(agent.state().consecutive_failures <= 3);
}

#[tokio::test]
async fn provider_failure_switches_permanently_to_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let primary = Arc::new(StubLlm::new("primary", done_output(true, "unused")));
    primary.push(StubReply::RateLimited);
    let fallback = Arc::new(StubLlm::new("fallback", done_output(true, "finished")));

    let mut agent = Agent::builder(Task::new("simple task"), primary.clone(), browser)
        .with_settings(test_settings())
        .with_fallback_llm(fallback.clone())
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(5).await.expect("run");

    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
    assert!(agent.is_using_fallback_llm());
    assert!(history.is_done());
    assert_eq!(history.is_successful(), Some(true));
}

#[tokio::test]
async fn repeated_actions_trigger_loop_nudge_by_step_four() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = pagepilot::SelectorMap::new();
    map.insert(5, stub_node("button", "h-exact", "h-stable", "//button[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));

    let click_forever = json!({
        "evaluation_previous_goal": "clicking",
        "memory": "",
        "next_goal": "keep clicking",
        "action": [{"click_element": {"index": 5}}],
    });
    let llm = Arc::new(StubLlm::new("primary", click_forever));

    let settings = AgentSettings {
        loop_detection_window: 3,
        ..test_settings()
    };

    let mut agent = Agent::builder(Task::new("click around"), llm.clone(), browser)
        .with_settings(settings)
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let _ = agent.run(6).await.expect("run");

    assert!(llm.call_count() >= 4);
    assert!(
        !llm.call_text(2).contains("Break the loop"),
        "nudge must not fire before the window fills"
    );
    assert!(
        llm.call_text(3).contains("Break the loop"),
        "by step 4 the loop-detector nudge must be injected"
    );
}

#[tokio::test]
async fn zero_max_steps_terminates_with_error_item() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(true, "unused")));

    let mut agent = Agent::builder(Task::new("anything"), llm.clone(), browser)
        .with_settings(test_settings())
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(0).await.expect("run");

    assert_eq!(history.history.len(), 1);
    assert!(history.history[0].result[0].error.is_some());
    assert!(!history.is_done());
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn non_done_at_max_steps_marks_run_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = pagepilot::SelectorMap::new();
    map.insert(5, stub_node("button", "h-exact", "h-stable", "//button[1]"));
    let browser = Arc::new(StubBrowser::new().with_selector_map(map));

    let click_forever = json!({
        "evaluation_previous_goal": "",
        "memory": "",
        "next_goal": "",
        "action": [{"click_element": {"index": 5}}],
    });
    let llm = Arc::new(StubLlm::new("primary", click_forever));

    let settings = AgentSettings {
        loop_detection_enabled: false,
        max_failures: 10,
        ..test_settings()
    };

    let mut agent = Agent::builder(Task::new("never finishes"), llm, browser)
        .with_settings(settings)
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(2).await.expect("run");

    assert!(!history.is_done());
    let last = history.history.last().unwrap();
    assert_eq!(
        last.result[0].error.as_deref(),
        Some("Failed to complete task in maximum steps")
    );
}

#[tokio::test]
async fn n_steps_matches_recorded_history() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(true, "ok")));
    llm.push(StubReply::Json(json!({
        "evaluation_previous_goal": "",
        "memory": "",
        "next_goal": "wait a moment",
        "action": [{"wait": {"seconds": 0.1}}],
    })));

    let mut agent = Agent::builder(Task::new("two step task"), llm, browser)
        .with_settings(test_settings())
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(10).await.expect("run");

    let real_steps = history
        .history
        .iter()
        .filter(|h| h.metadata.map(|m| m.step_number > 0).unwrap_or(true))
        .count();
    assert_eq!(agent.state().n_steps as usize, real_steps + 1);

    // Every recorded done action is the sole action of its step
    for entry in &history.history {
        if let Some(output) = &entry.model_output
            && output.action.iter().any(|a| a.name == "done")
        {
            assert_eq!(output.action.len(), 1);
        }
    }
}

#[tokio::test]
async fn usage_is_aggregated_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(StubBrowser::new());
    let llm = Arc::new(StubLlm::new("primary", done_output(true, "ok")));

    let mut agent = Agent::builder(Task::new("count tokens"), llm, browser)
        .with_settings(test_settings())
        .with_file_system_state(temp_fs_state(&dir))
        .build()
        .await
        .expect("build agent");

    let history = agent.run(3).await.expect("run");
    let usage = history.usage.expect("usage summary recorded");
    assert_eq!(usage.total_tokens, 15);
    assert_eq!(usage.prompt_tokens, 10);
}
