//! 优雅关闭
//!
//! ShutdownManager 监听 Ctrl+C / SIGTERM 并取消全局 token；
//! ShutdownCoordinator 在取消后依次执行清理任务（停止调度器、清理审批队列等），每个任务有超时。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditCategory, AuditEvent, AuditLevel, AuditSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 主任务自行结束
    Finished,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::UserInitiated => "user_initiated",
            ShutdownReason::Signal => "signal",
            ShutdownReason::Finished => "finished",
        }
    }
}

#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 全局取消 token（调度循环、配置监听与 ReAct 运行都挂在它下面）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(reason = reason.as_str(), "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与（unix 下）SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 单个清理任务的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupResult {
    Ok,
    Failed(String),
    TimedOut,
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            timeout: Duration::from_secs(30),
            audit: None,
        }
    }

    /// 每个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 按注册顺序执行
    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Arc::new(task));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupResult)> {
        tracing::info!(tasks = self.tasks.len(), "Running shutdown cleanup");
        let mut results = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            let name = task.name();
            let result = match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => CleanupResult::Ok,
                Ok(Err(e)) => CleanupResult::Failed(e.to_string()),
                Err(_) => CleanupResult::TimedOut,
            };
            match &result {
                CleanupResult::Ok => tracing::info!(task = name, "Cleanup finished"),
                CleanupResult::Failed(e) => tracing::warn!(task = name, error = %e, "Cleanup failed"),
                CleanupResult::TimedOut => {
                    tracing::warn!(task = name, secs = self.timeout.as_secs(), "Cleanup timed out")
                }
            }
            if let Some(audit) = &self.audit {
                let (level, outcome) = match &result {
                    CleanupResult::Ok => (AuditLevel::Info, "ok".to_string()),
                    CleanupResult::Failed(e) => (AuditLevel::Warn, e.clone()),
                    CleanupResult::TimedOut => (AuditLevel::Warn, "timed out".to_string()),
                };
                audit.audit(
                    AuditEvent::new(AuditCategory::Scheduler, "shutdown_cleanup")
                        .level(level)
                        .details(json!({ "task": name, "outcome": outcome })),
                );
            }
            results.push((name, result));
        }
        results
    }
}
