//! Agent 进程启动：spawn(agent) -> exit code
//!
//! 调度器只依赖 AgentLauncher 这一不透明契约；ProcessLauncher 以子进程运行 agent，
//! 超出墙钟预算即 kill。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::scheduler::spec::AgentSpec;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to spawn agent '{agent}': {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent '{agent}' exceeded its {secs}s wall-clock budget")]
    TimedOut { agent: String, secs: u64 },

    #[error("failed to wait for agent '{agent}': {source}")]
    Wait {
        agent: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// 进程根本没有启动起来
    pub fn is_spawn(&self) -> bool {
        matches!(self, LaunchError::Spawn { .. })
    }
}

/// 启动一次 agent 运行并等待其结束
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// `on_spawn` 在拿到子进程 pid 后立即调用（用于更新锁记录与运行表）
    async fn spawn(
        &self,
        spec: &AgentSpec,
        on_spawn: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<i32, LaunchError>;
}

/// 子进程启动器
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    default_timeout: Duration,
}

impl ProcessLauncher {
    /// `args` 中的 `{agent}` 替换为 agent id
    pub fn new(program: impl Into<String>, args: Vec<String>, default_timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            args,
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    /// 实际执行的 argv：agent 自带 command 优先
    pub fn argv(&self, spec: &AgentSpec) -> Vec<String> {
        if let Some(command) = &spec.command {
            return command.clone();
        }
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.replace("{agent}", &spec.id)))
            .collect()
    }

    fn budget(&self, spec: &AgentSpec) -> Duration {
        spec.max_runtime_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn spawn(
        &self,
        spec: &AgentSpec,
        on_spawn: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<i32, LaunchError> {
        let argv = self.argv(spec);
        let Some((program, args)) = argv.split_first() else {
            return Err(LaunchError::Spawn {
                agent: spec.id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut child = Command::new(program)
            .args(args)
            .env("HIVE_AGENT_ID", &spec.id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                agent: spec.id.clone(),
                source,
            })?;

        if let Some(pid) = child.id() {
            tracing::info!(agent = %spec.id, pid, program = %program, "Agent process spawned");
            on_spawn(pid);
        }

        let budget = self.budget(spec);
        match tokio::time::timeout(budget, child.wait()).await {
            Ok(Ok(status)) => Ok(status.code().unwrap_or(-1)),
            Ok(Err(source)) => Err(LaunchError::Wait {
                agent: spec.id.clone(),
                source,
            }),
            Err(_) => {
                tracing::warn!(agent = %spec.id, budget_secs = budget.as_secs(), "Agent exceeded wall-clock budget, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(agent = %spec.id, "Failed to kill agent process: {}", e);
                }
                Err(LaunchError::TimedOut {
                    agent: spec.id.clone(),
                    secs: budget.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::spec::Trigger;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec_with(command: &[&str]) -> AgentSpec {
        let mut spec = AgentSpec::new("organizer", Trigger::Manual);
        spec.command = Some(command.iter().map(|s| s.to_string()).collect());
        spec
    }

    #[test]
    fn test_argv_substitutes_agent_id() {
        let launcher = ProcessLauncher::new("hive", vec!["agent".into(), "{agent}".into()], 60);
        let spec = AgentSpec::new("organizer", Trigger::Manual);
        assert_eq!(launcher.argv(&spec), vec!["hive", "agent", "organizer"]);

        let custom = spec_with(&["python3", "organize.py"]);
        assert_eq!(launcher.argv(&custom), vec!["python3", "organize.py"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_exit_code_and_pid() {
        let launcher = ProcessLauncher::new("unused", vec![], 30);
        let spec = spec_with(&["sh", "-c", "test \"$HIVE_AGENT_ID\" = organizer && exit 3"]);
        let seen = AtomicU32::new(0);
        let code = launcher
            .spawn(&spec, &|pid| seen.store(pid, Ordering::SeqCst))
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert_ne!(seen.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_kills_after_budget() {
        let launcher = ProcessLauncher::new("unused", vec![], 30);
        let mut spec = spec_with(&["sleep", "30"]);
        spec.max_runtime_secs = Some(1);
        let started = std::time::Instant::now();
        let err = launcher.spawn(&spec, &|_| {}).await.unwrap_err();
        assert!(matches!(err, LaunchError::TimedOut { secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher = ProcessLauncher::new("/definitely/not/here/hive-agent", vec![], 30);
        let spec = AgentSpec::new("organizer", Trigger::Manual);
        let err = launcher.spawn(&spec, &|_| {}).await.unwrap_err();
        assert!(err.is_spawn());
    }
}
