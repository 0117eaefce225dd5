//! 调度状态持久化：触发状态 + 运行统计（scheduler-state.json），运行表（running.json）
//!
//! 两个文件都以「写临时文件再 rename」方式原子替换。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::scheduler::trigger::TriggerState;

/// 单个 agent 的运行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRunStats {
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentRunStats {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.successes += 1;
        self.last_run_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.total_runs += 1;
        self.failures += 1;
        self.last_run_at = Some(at);
        self.last_error = Some(error.into());
    }
}

/// Idle → Scheduled → Launching → Running → {Succeeded, Failed} → Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Scheduled,
    Launching,
    Running,
    Succeeded,
    Failed,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Scheduled => "scheduled",
            AgentPhase::Launching => "launching",
            AgentPhase::Running => "running",
            AgentPhase::Succeeded => "succeeded",
            AgentPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAgent {
    /// 触发器类型变化时丢弃 trigger 状态
    pub trigger_kind: String,
    pub trigger: TriggerState,
    #[serde(default)]
    pub stats: AgentRunStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agents: BTreeMap<String, PersistedAgent>,
}

/// scheduler-state.json
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件缺失或损坏时返回空状态（损坏时告警）
    pub fn load(&self) -> PersistedState {
        read_json(&self.path).unwrap_or_default()
    }

    pub fn save(&self, state: &PersistedState) -> std::io::Result<()> {
        write_json_atomic(&self.path, state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningEntry {
    pub agent_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "usesLLM")]
    pub uses_llm: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningDocument {
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    agents: Vec<RunningEntry>,
}

/// running.json：当前 Running 的 agent
pub struct RunningRegistry {
    path: PathBuf,
}

impl RunningRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, entries: &[RunningEntry]) -> std::io::Result<()> {
        let doc = RunningDocument {
            updated_at: Some(Utc::now()),
            agents: entries.to_vec(),
        };
        write_json_atomic(&self.path, &doc)
    }

    pub fn read(&self) -> Vec<RunningEntry> {
        read_json::<RunningDocument>(&self.path)
            .map(|d| d.agents)
            .unwrap_or_default()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to read state file: {}", e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Ignoring corrupt state file: {}", e);
            None
        }
    }
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
