//! 审批端到端：低信任写文件 -> 排队 -> 重启后审批 -> 恰好执行一次

use std::sync::Arc;

use hive::approval::{ApprovalError, ApprovalQueue, ApprovalStatus};
use hive::audit::MemoryAudit;
use hive::config::AppConfig;
use hive::skills::{DecideOutcome, SkillError, SkillOutcome, TrustLevel};
use hive::HiveBuilder;
use serde_json::json;

fn config_in(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.state_dir = dir.join("run");
    config.skills.workspace_root = dir.join("workspace");
    config.skills.approval_db = dir.join("run/approvals.db");
    config.llm.provider = "mock".to_string();
    std::fs::create_dir_all(&config.skills.workspace_root).unwrap();
    config
}

#[tokio::test]
async fn queued_write_survives_restart_and_executes_once() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("workspace/notes/plan.md");

    let queue_id = {
        let audit = Arc::new(MemoryAudit::new());
        let hive = HiveBuilder::new(config_in(dir.path()))
            .with_audit(audit.clone())
            .build()
            .unwrap();
        let outcome = hive
            .executor
            .execute_as(
                "fs_write",
                json!({"path": "notes/plan.md", "content": "1. ship"}),
                TrustLevel::Observe,
                false,
                "agent:organizer",
            )
            .await
            .unwrap();
        let SkillOutcome::AwaitingApproval { queue_id } = outcome else {
            panic!("expected the write to be queued, got {:?}", outcome);
        };
        assert!(!target.exists());
        assert_eq!(audit.count("skill_awaiting_approval"), 1);
        assert_eq!(audit.count("skill_executed"), 0);
        queue_id
    };

    // 新进程：同一个数据库
    let audit = Arc::new(MemoryAudit::new());
    let hive = HiveBuilder::new(config_in(dir.path()))
        .with_audit(audit.clone())
        .build()
        .unwrap();
    let pending = hive.executor.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queue_id);
    assert_eq!(pending[0].requested_by, "agent:organizer");
    assert_eq!(pending[0].inputs["path"], "notes/plan.md");

    match hive.executor.decide(&queue_id, true, "cli:alice").await.unwrap() {
        DecideOutcome::Executed { item, result } => {
            assert_eq!(item.status, ApprovalStatus::Approved);
            assert_eq!(item.decided_by.as_deref(), Some("cli:alice"));
            assert!(result.is_ok());
        }
        other => panic!("expected execution, got {:?}", other),
    }
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "1. ship");
    assert_eq!(audit.count("skill_executed"), 1);
    assert!(hive.approvals.get(&queue_id).unwrap().result.is_some());

    // 重复决定不会再次执行
    let again = hive.executor.decide(&queue_id, true, "cli:bob").await;
    assert!(matches!(
        again,
        Err(SkillError::Approval(ApprovalError::AlreadyDecided { .. }))
    ));
    assert_eq!(audit.count("skill_executed"), 1);
    assert!(hive.executor.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_and_expired_items_never_run() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(MemoryAudit::new());
    let hive = HiveBuilder::new(config_in(dir.path()))
        .with_audit(audit.clone())
        .with_approvals(Arc::new(ApprovalQueue::in_memory().unwrap()))
        .build()
        .unwrap();

    let mut ids = Vec::new();
    for name in ["a.md", "b.md"] {
        match hive
            .executor
            .execute("fs_write", json!({"path": name, "content": "x"}), TrustLevel::Suggest, false)
            .await
            .unwrap()
        {
            SkillOutcome::AwaitingApproval { queue_id } => ids.push(queue_id),
            other => panic!("expected queueing, got {:?}", other),
        }
    }

    match hive.executor.decide(&ids[0], false, "cli:alice").await.unwrap() {
        DecideOutcome::Rejected(item) => assert_eq!(item.status, ApprovalStatus::Rejected),
        other => panic!("expected rejection, got {:?}", other),
    }
    let next_day = chrono::Utc::now() + chrono::Duration::hours(25);
    let expired = hive
        .executor
        .expire_stale(std::time::Duration::from_secs(86_400), next_day)
        .unwrap();
    assert_eq!(expired, vec![ids[1].clone()]);
    assert!(matches!(
        hive.executor.decide(&ids[1], true, "cli:alice").await,
        Err(SkillError::Approval(ApprovalError::AlreadyDecided { .. }))
    ));

    assert!(!dir.path().join("workspace/a.md").exists());
    assert!(!dir.path().join("workspace/b.md").exists());
    assert_eq!(audit.count("skill_executed"), 0);
    assert_eq!(audit.count("approval_expired"), 1);
}
