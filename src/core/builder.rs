//! 组件装配：由 AppConfig 构建审计、技能注册表与执行器、审批队列、锁管理器、调度器与 ReAct 操作器
//!
//! CLI 的各个子命令共享同一套装配逻辑。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::approval::{ApprovalError, ApprovalQueue};
use crate::audit::{AuditCategory, AuditEvent, AuditSink, FanoutAudit, JsonlAudit, TracingAudit};
use crate::config::AppConfig;
use crate::core::shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager};
use crate::llm::{LlmClient, MockLlmClient};
use crate::react::{LlmPlanner, Planner, ReactOperator};
use crate::scheduler::{
    Clock, FileActivitySource, LockManager, ProcessLauncher, Scheduler, SchedulerCleanup, SchedulerOptions,
    SystemClock, TickHook,
};
use crate::skills::{register_builtin, SkillExecutor, SkillRegistry, TrustLevel};

/// 两次 prune 之间的最小间隔
const PRUNE_INTERVAL_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to open approval queue: {0}")]
    Approval(#[from] ApprovalError),

    #[error("failed to open audit file {path}: {source}")]
    AuditFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown llm provider '{0}' (expected openai or mock)")]
    UnknownProvider(String),
}

pub struct HiveBuilder {
    config: AppConfig,
    audit: Option<Arc<dyn AuditSink>>,
    approvals: Option<Arc<ApprovalQueue>>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            audit: None,
            approvals: None,
            llm: None,
        }
    }

    /// 替换默认审计 sink（tracing + 可选 NDJSON 文件）
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalQueue>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> Result<Hive, BuildError> {
        let config = self.config;

        let audit = match self.audit {
            Some(audit) => audit,
            None => {
                let mut fanout = FanoutAudit::new().with(Arc::new(TracingAudit));
                if let Some(path) = &config.audit.file {
                    let file = JsonlAudit::open(path).map_err(|source| BuildError::AuditFile {
                        path: path.clone(),
                        source,
                    })?;
                    fanout = fanout.with(Arc::new(file));
                }
                Arc::new(fanout)
            }
        };

        let approvals = match self.approvals {
            Some(queue) => queue,
            None => Arc::new(ApprovalQueue::open(&config.skills.approval_db)?),
        };

        let registry = Arc::new(SkillRegistry::new());
        register_builtin(
            &registry,
            config.skills.allowed(),
            config.skills.command_whitelist.clone(),
            config.skills.timeout_secs,
        );
        let executor = Arc::new(SkillExecutor::new(
            registry.clone(),
            approvals.clone(),
            audit.clone(),
            Duration::from_secs(config.skills.timeout_secs.max(1)),
        ));

        let locks = Arc::new(
            LockManager::new(config.app.state_dir.join("locks")).with_signature(config.launcher.signature.clone()),
        );

        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm(&config)?,
        };

        Ok(Hive {
            config,
            audit,
            registry,
            approvals,
            executor,
            locks,
            llm,
        })
    }
}

fn create_llm(config: &AppConfig) -> Result<Arc<dyn LlmClient>, BuildError> {
    match config.llm.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        #[cfg(feature = "openai")]
        "openai" => Ok(Arc::new(crate::llm::OpenAiClient::new(
            config.llm.base_url.as_deref(),
            &config.llm.model,
            None,
        ))),
        other => Err(BuildError::UnknownProvider(other.to_string())),
    }
}

/// 装配好的应用
pub struct Hive {
    pub config: AppConfig,
    pub audit: Arc<dyn AuditSink>,
    pub registry: Arc<SkillRegistry>,
    pub approvals: Arc<ApprovalQueue>,
    pub executor: Arc<SkillExecutor>,
    pub locks: Arc<LockManager>,
    pub llm: Arc<dyn LlmClient>,
}

impl Hive {
    pub fn operator(&self, actor: &str) -> ReactOperator {
        self.operator_with_trust(actor, self.config.skills.trust_level)
    }

    pub fn operator_with_trust(&self, actor: &str, trust: TrustLevel) -> ReactOperator {
        let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(self.llm.clone()));
        ReactOperator::new(
            planner,
            self.executor.clone(),
            self.audit.clone(),
            self.config.react.to_react_config(trust, actor),
        )
    }

    pub fn approval_maintenance(&self) -> Arc<ApprovalMaintenance> {
        Arc::new(ApprovalMaintenance::new(
            self.executor.clone(),
            self.audit.clone(),
            Duration::from_secs(self.config.skills.approval_ttl_secs),
            Duration::from_secs(self.config.skills.approval_retention_days * 86_400),
        ))
    }

    /// 默认启动程序为当前可执行文件（`hive agent {agent}`）
    pub fn launcher(&self) -> ProcessLauncher {
        let program = self
            .config
            .launcher
            .program
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("hive"));
        ProcessLauncher::new(
            program.to_string_lossy().into_owned(),
            self.config.launcher.args.clone(),
            self.config.scheduler.default_run_timeout_secs,
        )
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        let section = &self.config.scheduler;
        let options = SchedulerOptions {
            tick: Duration::from_secs(section.tick_secs.max(1)),
            backoff_base: Duration::from_secs(section.backoff_base_secs),
            backoff_max: Duration::from_secs(section.backoff_max_secs),
            agents_file: Some(section.agents_file.clone()),
            state_dir: Some(self.config.app.state_dir.clone()),
        };
        let mut scheduler = Scheduler::new(
            options,
            self.locks.clone(),
            Arc::new(self.launcher()),
            self.audit.clone(),
        )
        .with_hook(self.approval_maintenance());
        if let Some(path) = &section.activity_file {
            scheduler = scheduler.with_activity(Arc::new(FileActivitySource::new(path.clone())));
        }
        Arc::new(scheduler)
    }

    /// 关闭协调器：先停调度器，再清理审批队列
    pub fn shutdown_coordinator(&self, manager: Arc<ShutdownManager>, scheduler: Arc<Scheduler>) -> ShutdownCoordinator {
        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_secs);
        let mut coordinator = ShutdownCoordinator::new(manager)
            .with_timeout(grace + Duration::from_secs(5))
            .with_audit(self.audit.clone());
        coordinator.register(SchedulerCleanup::new(scheduler, grace));
        coordinator.register(ApprovalPruneCleanup(self.approval_maintenance()));
        coordinator
    }
}

/// 审批队列维护：每个 tick 过期超时的待审批项，至多每小时清理一次过期终态项
pub struct ApprovalMaintenance {
    executor: Arc<SkillExecutor>,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
    retention: Duration,
    last_prune: Mutex<Option<DateTime<Utc>>>,
    /// 关闭时 prune 使用；tick 时以 tick 的 now 为准
    clock: Arc<dyn Clock>,
}

impl ApprovalMaintenance {
    pub fn new(executor: Arc<SkillExecutor>, audit: Arc<dyn AuditSink>, ttl: Duration, retention: Duration) -> Self {
        Self {
            executor,
            audit,
            ttl,
            retention,
            last_prune: Mutex::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, ApprovalError> {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let removed = self.executor.approvals().prune(now - retention)?;
        *self.last_prune.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
        if removed > 0 {
            self.audit.audit(
                AuditEvent::new(AuditCategory::Approval, "approvals_pruned")
                    .details(json!({ "removed": removed, "retentionSecs": self.retention.as_secs() })),
            );
        }
        Ok(removed)
    }
}

impl TickHook for ApprovalMaintenance {
    fn on_tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.executor.expire_stale(self.ttl, now) {
            tracing::warn!(error = %e, "Approval expiry failed");
        }
        let due = self
            .last_prune
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map(|last| (now - last).num_seconds() >= PRUNE_INTERVAL_SECS)
            .unwrap_or(true);
        if due {
            if let Err(e) = self.prune(now) {
                tracing::warn!(error = %e, "Approval prune failed");
            }
        }
    }
}

struct ApprovalPruneCleanup(Arc<ApprovalMaintenance>);

#[async_trait::async_trait]
impl ShutdownCleanup for ApprovalPruneCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.prune(self.0.now())?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "approval_prune"
    }
}
