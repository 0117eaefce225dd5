//! 调度配置：AgentSpec / Trigger / GlobalSettings 及 agents.json 解析
//!
//! 文件形如 `{ "globalSettings": {...}, "agents": { "<id>": {...} } }`；
//! 单个 agent 格式错误只跳过该 agent（ConfigError），不影响其它 agent 与调度器本身。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed scheduler config: {0}")]
    Parse(String),

    #[error("agent '{agent}' skipped: {reason}")]
    InvalidAgent { agent: String, reason: String },
}

/// 触发器：每个 AgentSpec 恰好一种
///
/// JSON 中与 agent 字段平铺，以 `type` 区分：`{"type": "interval", "interval": 300}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Interval {
        #[serde(alias = "seconds")]
        interval: u64,
    },
    TimeOfDay {
        #[serde(alias = "hhmm")]
        time: String,
    },
    Activity {
        #[serde(alias = "inactivityThreshold", alias = "inactivitySeconds")]
        inactivity: u64,
    },
    /// 预留：本核心不触发
    Event {
        #[serde(alias = "name")]
        event: String,
    },
    Manual,
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval { .. } => "interval",
            Trigger::TimeOfDay { .. } => "time_of_day",
            Trigger::Activity { .. } => "activity",
            Trigger::Event { .. } => "event",
            Trigger::Manual => "manual",
        }
    }

    /// 类型相同（参数可以不同）
    pub fn same_kind(&self, other: &Trigger) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// 优先级：同一 tick 内 High 先评估
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// 单个后台 agent 的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// 由 agents 表的键填充
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub trigger: Trigger,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, rename = "usesLLM", alias = "usesLlm")]
    pub uses_llm: bool,
    #[serde(default)]
    pub run_on_boot: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// 覆盖 launcher 的 argv
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// 单次运行的墙钟预算（秒），缺省用全局默认
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,
    /// 交给 ReAct 执行的目标（`hive agent <id>`）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            trigger,
            priority: Priority::Normal,
            uses_llm: false,
            run_on_boot: false,
            auto_restart: false,
            max_retries: default_max_retries(),
            comment: None,
            command: None,
            max_runtime_secs: None,
            goal: None,
        }
    }

    /// 参数合法性（间隔 > 0、HH:MM、阈值 > 0、命令非空）
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAgent {
            agent: self.id.clone(),
            reason: reason.to_string(),
        };
        match &self.trigger {
            Trigger::Interval { interval } if *interval == 0 => {
                return Err(invalid("interval must be positive"))
            }
            Trigger::TimeOfDay { time } if parse_hhmm(time).is_none() => {
                return Err(invalid("time must be HH:MM"))
            }
            Trigger::Activity { inactivity } if *inactivity == 0 => {
                return Err(invalid("inactivity threshold must be positive"))
            }
            _ => {}
        }
        if let Some(cmd) = &self.command {
            if cmd.is_empty() || cmd[0].trim().is_empty() {
                return Err(invalid("command must not be empty"));
            }
        }
        Ok(())
    }
}

/// 静默时段，可跨午夜（如 23:00 - 07:00）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "23:00".to_string(),
            end: "07:00".to_string(),
        }
    }
}

impl QuietHours {
    /// `t` 是否处于静默时段；时间格式错误视为不静默
    pub fn contains(&self, t: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if start == end {
            false
        } else if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }
}

/// 全局调度设置，每个 tick 读取一次快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub pause_all: bool,
    pub quiet_hours: QuietHours,
    pub max_concurrent_agents: usize,
    #[serde(rename = "maxConcurrentLLMAgents", alias = "maxConcurrentLlmAgents")]
    pub max_concurrent_llm_agents: usize,
    #[serde(rename = "maxConcurrentNonLLMAgents", alias = "maxConcurrentNonLlmAgents")]
    pub max_concurrent_non_llm_agents: usize,
    pub pause_queue_on_activity: bool,
    /// 用户停止操作多少秒后恢复队列
    pub activity_resume_delay: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            pause_all: false,
            quiet_hours: QuietHours::default(),
            max_concurrent_agents: 3,
            max_concurrent_llm_agents: 1,
            max_concurrent_non_llm_agents: 2,
            pause_queue_on_activity: false,
            activity_resume_delay: 60,
        }
    }
}

/// 解析后的调度配置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerConfig {
    pub settings: GlobalSettings,
    pub agents: BTreeMap<String, AgentSpec>,
}

/// 解析结果：合法配置 + 被跳过的 agent
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub config: SchedulerConfig,
    pub rejected: Vec<ConfigError>,
    /// globalSettings 存在但非法；此时 config.settings 为默认值，调用方应沿用上一份有效设置
    pub settings_rejected: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default)]
    global_settings: Option<Value>,
    #[serde(default)]
    agents: BTreeMap<String, Value>,
}

/// 解析 agents.json 文本
///
/// 顶层 JSON 非法时整体失败；globalSettings 非法时记入 rejected 并置 settings_rejected；
/// 单个 agent 非法时跳过该 agent。
pub fn parse_config(text: &str) -> Result<ParsedConfig, ConfigError> {
    let raw: RawDocument =
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut parsed = ParsedConfig::default();

    if let Some(settings) = raw.global_settings {
        match serde_json::from_value::<GlobalSettings>(settings) {
            Ok(s) => parsed.config.settings = s,
            Err(e) => {
                parsed.settings_rejected = true;
                parsed
                    .rejected
                    .push(ConfigError::Parse(format!("globalSettings: {}", e)));
            }
        }
    }

    for (id, value) in raw.agents {
        let spec = serde_json::from_value::<AgentSpec>(value)
            .map_err(|e| ConfigError::InvalidAgent {
                agent: id.clone(),
                reason: e.to_string(),
            })
            .and_then(|mut spec| {
                spec.id = id.clone();
                spec.validate()?;
                Ok(spec)
            });
        match spec {
            Ok(spec) => {
                parsed.config.agents.insert(id, spec);
            }
            Err(e) => parsed.rejected.push(e),
        }
    }

    Ok(parsed)
}

/// 从文件读取并解析
pub fn load_config_file(path: impl AsRef<Path>) -> Result<ParsedConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

/// 序列化为配置文件格式（agents 以 id 为键）
pub fn to_document(config: &SchedulerConfig) -> Value {
    let agents: serde_json::Map<String, Value> = config
        .agents
        .iter()
        .map(|(id, spec)| (id.clone(), serde_json::to_value(spec).unwrap_or(Value::Null)))
        .collect();
    serde_json::json!({
        "globalSettings": config.settings,
        "agents": agents,
    })
}

/// 解析 "HH:MM"
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
