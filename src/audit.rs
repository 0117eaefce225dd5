//! 审计接口：调度状态迁移、技能执行决策与 ReAct 每一步都经由 AuditSink 记录
//!
//! 默认实现：
//! - TracingAudit：每条记录输出一条结构化 tracing 日志（JSON）
//! - JsonlAudit：追加写入 NDJSON 文件，便于事后复盘
//! - MemoryAudit：测试用，收集全部记录
//! - FanoutAudit：同时写多个 sink

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 审计级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// 审计类别（对应产生记录的组件）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Scheduler,
    Lock,
    Config,
    Skill,
    Approval,
    React,
}

/// 单条审计记录：{level, category, event, details, actor}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub event: String,
    pub details: Value,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(category: AuditCategory, event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: AuditLevel::Info,
            category,
            event: event.into(),
            details: Value::Null,
            actor: "system".to_string(),
        }
    }

    pub fn level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// 审计 sink：同步、不可失败（写入失败只记日志，不影响调用方）
pub trait AuditSink: Send + Sync {
    fn audit(&self, event: AuditEvent);
}

/// 输出为 tracing 事件
#[derive(Debug, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn audit(&self, event: AuditEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();
        match event.level {
            AuditLevel::Info => tracing::info!(audit = %json, "{}", event.event),
            AuditLevel::Warn => tracing::warn!(audit = %json, "{}", event.event),
            AuditLevel::Error => tracing::error!(audit = %json, "{}", event.event),
        }
    }
}

/// NDJSON 文件审计（每行一条记录）
pub struct JsonlAudit {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAudit {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAudit {
    fn audit(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(path = %self.path.display(), "Failed to append audit event: {}", e);
        }
    }
}

/// 内存审计（测试与 CLI 汇总用）
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 指定事件名的记录
    pub fn named(&self, event: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.named(event).len()
    }
}

impl AuditSink for MemoryAudit {
    fn audit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

/// 同时写入多个 sink
#[derive(Default)]
pub struct FanoutAudit {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAudit {
    fn audit(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.audit(event.clone());
        }
    }
}
