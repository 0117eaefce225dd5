//! ReAct 端到端：LLM planner（Mock 脚本）+ 内置技能 + 失败循环检测

use std::sync::Arc;

use hive::audit::MemoryAudit;
use hive::config::AppConfig;
use hive::llm::MockLlmClient;
use hive::react::{OperatorStatus, Termination};
use hive::skills::ErrorClass;
use hive::{Hive, HiveBuilder};
use tokio_util::sync::CancellationToken;

fn hive_with(dir: &std::path::Path, llm: Arc<MockLlmClient>, audit: Arc<MemoryAudit>) -> Hive {
    let mut config = AppConfig::default();
    config.app.state_dir = dir.join("run");
    config.skills.workspace_root = dir.join("workspace");
    config.skills.approval_db = dir.join("run/approvals.db");
    std::fs::create_dir_all(&config.skills.workspace_root).unwrap();
    HiveBuilder::new(config)
        .with_llm(llm)
        .with_audit(audit)
        .build()
        .unwrap()
}

#[tokio::test]
async fn repeated_failing_read_stops_by_third_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted([
        "Let me read the notes.\n```json\n{\"thought\": \"read the notes\", \"action\": \"fs_read\", \"actionInput\": {\"path\": \"notes.md\"}}\n```",
    ]));
    let audit = Arc::new(MemoryAudit::new());
    let hive = hive_with(dir.path(), llm.clone(), audit.clone());

    let outcome = hive
        .operator("test")
        .run("summarize notes.md", &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, OperatorStatus::Failed);
    assert!(matches!(outcome.termination, Termination::FailureLoop { .. }));
    assert!(outcome.iterations <= 3);
    assert_eq!(llm.calls(), outcome.iterations);
    for step in outcome.scratchpad.steps() {
        assert_eq!(step.action, "fs_read");
        assert_eq!(step.error_class, Some(ErrorClass::ExecutionError));
    }
    assert!(outcome.answer.contains("summarize notes.md"));
    assert_eq!(audit.count("skill_executed"), outcome.iterations);
    assert_eq!(audit.count("react_finished"), 1);

    // 后续轮次的 prompt 带有先前的观察
    let prompt = llm.last_prompt().unwrap();
    assert!(prompt.iter().any(|m| m.content.contains("Hint:")));
}

#[tokio::test]
async fn observed_listing_then_answer_completes() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted([
        r#"{"thought": "see what is there", "action": "fs_list", "actionInput": {}}"#,
        r#"{"thought": "done", "action": "conversational_response", "actionInput": {"answer": "todo.md is the only file"}}"#,
    ]));
    let audit = Arc::new(MemoryAudit::new());
    let hive = hive_with(dir.path(), llm.clone(), audit.clone());
    std::fs::write(dir.path().join("workspace/todo.md"), "- ship it").unwrap();

    let outcome = hive
        .operator("test")
        .run("what is in the workspace?", &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, OperatorStatus::Complete);
    assert_eq!(outcome.answer, "todo.md is the only file");
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.scratchpad.steps()[0].observation.contains("todo.md"));
    assert_eq!(audit.count("skill_executed"), 1);
}

#[tokio::test]
async fn cancelled_run_is_partial() {
    let dir = tempfile::tempdir().unwrap();
    let hive = hive_with(
        dir.path(),
        Arc::new(MockLlmClient::new()),
        Arc::new(MemoryAudit::new()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = hive.operator("test").run("anything", &cancel).await;
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_eq!(outcome.status, OperatorStatus::Partial);
}
