//! 技能执行器
//!
//! execute(skill_id, inputs, trust, auto_approve) 依次经过：
//! 1. 查找（NotFound）
//! 2. 输入校验（ValidationError）
//! 3. 沙箱：path 字段必须落在 allowedDirectories 内，shell 命令必须在 commandWhitelist 中（SandboxViolation）
//! 4. 审批策略：需要审批时入队并返回 AwaitingApproval，除非调用方给出 auto_approve
//! 5. 带超时执行
//!
//! 每个结果都写审计；`skill_executed` 只在技能真正被执行时写一次。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::timeout;

use crate::approval::{ApprovalError, ApprovalItem, ApprovalQueue, ApprovalRequest, ApprovalStatus};
use crate::audit::{AuditCategory, AuditEvent, AuditLevel, AuditSink};
use crate::skills::manifest::{SkillCategory, SkillManifest, TrustLevel};
use crate::skills::policy::{evaluate_skill_approval, ApprovalPolicyOutcome};
use crate::skills::registry::SkillRegistry;
use crate::skills::sandbox;

/// 结构化错误类别（会原样出现在 ReAct 的 observation 中）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorClass {
    NotFound,
    ValidationError,
    SandboxViolation,
    AwaitingApproval,
    ExecutionError,
    Timeout,
    InvalidPlan,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::NotFound => "NotFound",
            ErrorClass::ValidationError => "ValidationError",
            ErrorClass::SandboxViolation => "SandboxViolation",
            ErrorClass::AwaitingApproval => "AwaitingApproval",
            ErrorClass::ExecutionError => "ExecutionError",
            ErrorClass::Timeout => "Timeout",
            ErrorClass::InvalidPlan => "InvalidPlan",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SkillError {
    #[error("skill '{0}' not found")]
    NotFound(String),

    #[error("invalid inputs for '{skill}': {reason}")]
    Validation { skill: String, reason: String },

    #[error("sandbox violation in '{skill}': {reason}")]
    SandboxViolation { skill: String, reason: String },

    #[error("skill '{skill}' failed: {reason}")]
    Execution { skill: String, reason: String },

    #[error("skill '{skill}' timed out after {secs}s")]
    Timeout { skill: String, secs: u64 },

    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

impl SkillError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SkillError::NotFound(_) => ErrorClass::NotFound,
            SkillError::Validation { .. } => ErrorClass::ValidationError,
            SkillError::SandboxViolation { .. } => ErrorClass::SandboxViolation,
            SkillError::Execution { .. } => ErrorClass::ExecutionError,
            SkillError::Timeout { .. } => ErrorClass::Timeout,
            SkillError::Approval(_) => ErrorClass::ExecutionError,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkillOutcome {
    Completed(Value),
    AwaitingApproval { queue_id: String },
}

/// 审批决定的结果
#[derive(Debug)]
pub enum DecideOutcome {
    Rejected(ApprovalItem),
    /// 批准并已执行；result 为执行结果
    Executed {
        item: ApprovalItem,
        result: Result<Value, SkillError>,
    },
}

pub struct SkillExecutor {
    registry: Arc<SkillRegistry>,
    approvals: Arc<ApprovalQueue>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl SkillExecutor {
    pub fn new(
        registry: Arc<SkillRegistry>,
        approvals: Arc<ApprovalQueue>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            approvals,
            audit,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalQueue> {
        &self.approvals
    }

    pub async fn execute(
        &self,
        skill_id: &str,
        inputs: Value,
        trust: TrustLevel,
        auto_approve: bool,
    ) -> Result<SkillOutcome, SkillError> {
        self.execute_as(skill_id, inputs, trust, auto_approve, "system").await
    }

    /// 以指定 actor 执行（actor 写入审计与审批记录）
    pub async fn execute_as(
        &self,
        skill_id: &str,
        inputs: Value,
        trust: TrustLevel,
        auto_approve: bool,
        actor: &str,
    ) -> Result<SkillOutcome, SkillError> {
        let Some(skill) = self.registry.get(skill_id) else {
            self.audit_rejection(skill_id, actor, "skill_not_found", &inputs, "unknown skill");
            return Err(SkillError::NotFound(skill_id.to_string()));
        };
        let manifest = skill.manifest();

        if let Err(reason) = manifest.validate_inputs(&inputs) {
            self.audit_rejection(skill_id, actor, "skill_validation_failed", &inputs, &reason);
            return Err(SkillError::Validation {
                skill: skill_id.to_string(),
                reason,
            });
        }

        let prepared = match apply_sandbox(manifest, &inputs) {
            Ok(prepared) => prepared,
            Err(reason) => {
                self.audit_rejection(skill_id, actor, "skill_sandbox_violation", &inputs, &reason);
                return Err(SkillError::SandboxViolation {
                    skill: skill_id.to_string(),
                    reason,
                });
            }
        };

        match evaluate_skill_approval(manifest, trust, auto_approve) {
            ApprovalPolicyOutcome::RequireApproval { reason_codes } => {
                let queue_id = self.approvals.enqueue(
                    ApprovalRequest::new(skill_id, inputs.clone())
                        .requested_by(actor)
                        .trust_level(trust.as_str())
                        .reason_codes(reason_codes.clone()),
                )?;
                self.audit.audit(
                    AuditEvent::new(AuditCategory::Approval, "skill_awaiting_approval")
                        .actor(actor)
                        .details(json!({
                            "skill": skill_id,
                            "queueId": queue_id,
                            "trust": trust,
                            "reasonCodes": reason_codes,
                            "inputs": inputs,
                        })),
                );
                return Ok(SkillOutcome::AwaitingApproval { queue_id });
            }
            ApprovalPolicyOutcome::AllowAutoApproved { reason_codes } => {
                self.audit.audit(
                    AuditEvent::new(AuditCategory::Approval, "skill_auto_approved")
                        .level(AuditLevel::Warn)
                        .actor(actor)
                        .details(json!({
                            "skill": skill_id,
                            "trust": trust,
                            "reasonCodes": reason_codes,
                        })),
                );
            }
            ApprovalPolicyOutcome::NoApprovalRequired => {}
        }

        let start = Instant::now();
        let result = timeout(self.timeout, skill.execute(prepared.clone())).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (outcome, level, output) = match &result {
            Ok(Ok(value)) => ("ok", AuditLevel::Info, json!({ "output": value })),
            Ok(Err(e)) => ("error", AuditLevel::Warn, json!({ "error": e })),
            Err(_) => ("timeout", AuditLevel::Warn, json!({ "error": "timed out" })),
        };
        let mut details = json!({
            "skill": skill_id,
            "ok": outcome == "ok",
            "outcome": outcome,
            "durationMs": duration_ms,
            "trust": trust,
            "inputs": prepared,
        });
        if let (Some(d), Some(o)) = (details.as_object_mut(), output.as_object()) {
            d.extend(o.clone());
        }
        self.audit.audit(
            AuditEvent::new(AuditCategory::Skill, "skill_executed")
                .level(level)
                .actor(actor)
                .details(details),
        );

        match result {
            Ok(Ok(value)) => Ok(SkillOutcome::Completed(value)),
            Ok(Err(reason)) => Err(SkillError::Execution {
                skill: skill_id.to_string(),
                reason,
            }),
            Err(_) => Err(SkillError::Timeout {
                skill: skill_id.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn list_pending(&self) -> Result<Vec<ApprovalItem>, SkillError> {
        Ok(self.approvals.list_pending()?)
    }

    /// 决定一条待审批调用；批准时以 auto_approve=true 同步执行原调用并记录结果
    pub async fn decide(&self, id: &str, approve: bool, actor: &str) -> Result<DecideOutcome, SkillError> {
        let to = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let item = match self.approvals.transition(id, to, actor) {
            Ok(item) => item,
            Err(e) => {
                self.audit.audit(
                    AuditEvent::new(AuditCategory::Approval, "approval_decision_rejected")
                        .level(AuditLevel::Warn)
                        .actor(actor)
                        .details(json!({ "queueId": id, "error": e.to_string() })),
                );
                return Err(e.into());
            }
        };
        self.audit.audit(
            AuditEvent::new(AuditCategory::Approval, "approval_decided")
                .actor(actor)
                .details(json!({
                    "queueId": id,
                    "skill": item.skill_id,
                    "status": item.status,
                })),
        );
        if !approve {
            return Ok(DecideOutcome::Rejected(item));
        }

        let trust = item.trust_level.parse().unwrap_or(TrustLevel::Observe);
        let result = match self
            .execute_as(&item.skill_id, item.inputs.clone(), trust, true, actor)
            .await
        {
            Ok(SkillOutcome::Completed(value)) => Ok(value),
            Ok(SkillOutcome::AwaitingApproval { queue_id }) => Err(SkillError::Execution {
                skill: item.skill_id.clone(),
                reason: format!("re-queued as {}", queue_id),
            }),
            Err(e) => Err(e),
        };

        let record = match &result {
            Ok(value) => json!({ "ok": true, "output": value }),
            Err(e) => json!({ "ok": false, "errorClass": e.class(), "error": e.to_string() }),
        };
        if let Err(e) = self.approvals.record_result(id, &record) {
            tracing::warn!(approval = %id, error = %e, "Failed to record approval result");
        }
        let item = self.approvals.get(id).unwrap_or(item);
        Ok(DecideOutcome::Executed { item, result })
    }

    /// 把在 `now - ttl` 之前发起的待审批项标记为 expired 并逐条审计
    pub fn expire_stale(&self, ttl: Duration, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<String>, SkillError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - ttl;
        let expired = self.approvals.expire(cutoff, now)?;
        for id in &expired {
            self.audit.audit(
                AuditEvent::new(AuditCategory::Approval, "approval_expired")
                    .actor(crate::approval::EXPIRY_ACTOR)
                    .details(json!({ "queueId": id })),
            );
        }
        Ok(expired)
    }

    fn audit_rejection(&self, skill_id: &str, actor: &str, event: &str, inputs: &Value, reason: &str) {
        self.audit.audit(
            AuditEvent::new(AuditCategory::Skill, event)
                .level(AuditLevel::Warn)
                .actor(actor)
                .details(json!({
                    "skill": skill_id,
                    "reason": reason,
                    "inputs": inputs,
                })),
        );
    }
}

/// 沙箱检查；返回把 path 字段替换为解析后绝对路径的输入
fn apply_sandbox(manifest: &SkillManifest, inputs: &Value) -> Result<Value, String> {
    let mut prepared = if inputs.is_null() { json!({}) } else { inputs.clone() };
    let Some(map) = prepared.as_object_mut() else {
        return Err("inputs must be a JSON object".to_string());
    };

    for field in manifest.path_fields() {
        if let Some(Value::String(raw)) = map.get(field) {
            let resolved = sandbox::resolve_within(raw, &manifest.allowed_directories)?;
            map.insert(field.to_string(), Value::String(resolved.to_string_lossy().into_owned()));
        }
    }

    if manifest.category == SkillCategory::Shell {
        let command = map
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "shell skills require a 'command' string".to_string())?;
        sandbox::check_command(command, &manifest.command_whitelist)?;
    }

    Ok(prepared)
}
