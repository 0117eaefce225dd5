//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=mock`）。
//! agents 与全局闸门设置在单独的 agents JSON 中（见 `scheduler::spec`），支持热更新。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::react::{ObservationFormat, ReactConfig};
use crate::skills::TrustLevel;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub scheduler: SchedulerSection,
    pub launcher: LauncherSection,
    pub skills: SkillsSection,
    pub react: ReactSection,
    pub llm: LlmSection,
    pub audit: AuditSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 锁文件、调度状态与 running.json 所在目录
    pub state_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            state_dir: PathBuf::from("logs/run"),
        }
    }
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub agents_file: PathBuf,
    pub tick_secs: u64,
    pub reload_poll_ms: u64,
    pub reload_debounce_ms: u64,
    /// agent 未设置 maxRuntimeSecs 时的运行时长上限
    pub default_run_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// 用户活跃标记文件；未设置时视为一直空闲
    pub activity_file: Option<PathBuf>,
    /// stop 时等待运行中 agent 的时间
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            agents_file: PathBuf::from("config/agents.json"),
            tick_secs: 5,
            reload_poll_ms: 1000,
            reload_debounce_ms: 500,
            default_run_timeout_secs: 1800,
            backoff_base_secs: 5,
            backoff_max_secs: 600,
            activity_file: None,
            shutdown_grace_secs: 10,
        }
    }
}

/// [launcher] 段：agent 进程如何启动
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherSection {
    /// 为空时使用当前可执行文件（`hive agent {agent}`）
    pub program: Option<PathBuf>,
    /// `{agent}` 会被替换为 agent id
    pub args: Vec<String>,
    /// 锁存活判断时期望出现在命令行中的子串；为空表示不检查
    pub signature: String,
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["agent".to_string(), "{agent}".to_string()],
            signature: String::new(),
        }
    }
}

/// [skills] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkillsSection {
    pub workspace_root: PathBuf,
    /// 额外允许的目录（workspace_root 总是第一个）
    pub allowed_directories: Vec<PathBuf>,
    pub command_whitelist: Vec<String>,
    pub timeout_secs: u64,
    pub approval_db: PathBuf,
    pub approval_ttl_secs: u64,
    pub approval_retention_days: u64,
    /// ReAct 与 agent 调用技能时的信任级别
    pub trust_level: TrustLevel,
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            allowed_directories: Vec::new(),
            command_whitelist: ["ls", "cat", "head", "tail", "wc", "grep", "git status", "git log"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 30,
            approval_db: PathBuf::from("logs/run/approvals.db"),
            approval_ttl_secs: 86_400,
            approval_retention_days: 30,
            trust_level: TrustLevel::Suggest,
        }
    }
}

impl SkillsSection {
    pub fn allowed(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.workspace_root.clone()];
        dirs.extend(self.allowed_directories.iter().cloned());
        dirs
    }
}

/// [react] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactSection {
    pub max_iterations: usize,
    pub timeout_secs: u64,
    pub repeat_threshold: usize,
    pub observation_format: ObservationFormat,
    pub max_observation_chars: usize,
}

impl Default for ReactSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeout_secs: 120,
            repeat_threshold: 2,
            observation_format: ObservationFormat::Summary,
            max_observation_chars: 4000,
        }
    }
}

impl ReactSection {
    pub fn to_react_config(&self, trust: TrustLevel, actor: &str) -> ReactConfig {
        ReactConfig {
            max_iterations: self.max_iterations.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            repeat_threshold: self.repeat_threshold.max(1),
            observation_format: self.observation_format,
            max_observation_chars: self.max_observation_chars,
            trust,
            actor: actor.to_string(),
        }
    }
}

/// [llm] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
        }
    }
}

/// [audit] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuditSection {
    /// NDJSON 审计文件；未设置时只输出到 tracing
    pub file: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
