//! 审批策略：requiresApproval 或信任级别不足 → 需要审批；autoApprove 由可信内部调用方显式给出时放行（仍审计）

use serde::Serialize;

use crate::skills::manifest::{SkillManifest, TrustLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalPolicyOutcome {
    NoApprovalRequired,
    RequireApproval { reason_codes: Vec<String> },
    AllowAutoApproved { reason_codes: Vec<String> },
}

impl ApprovalPolicyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicyOutcome::NoApprovalRequired => "no_approval_required",
            ApprovalPolicyOutcome::RequireApproval { .. } => "require_approval",
            ApprovalPolicyOutcome::AllowAutoApproved { .. } => "allow_auto_approved",
        }
    }
}

pub fn evaluate_skill_approval(
    manifest: &SkillManifest,
    trust: TrustLevel,
    auto_approve: bool,
) -> ApprovalPolicyOutcome {
    let mut reason_codes = Vec::new();
    if manifest.requires_approval {
        reason_codes.push("skill_requires_approval".to_string());
    }
    if trust < manifest.min_trust_level {
        reason_codes.push("trust_below_minimum".to_string());
    }

    if reason_codes.is_empty() {
        ApprovalPolicyOutcome::NoApprovalRequired
    } else if auto_approve {
        reason_codes.push("caller_auto_approved".to_string());
        ApprovalPolicyOutcome::AllowAutoApproved { reason_codes }
    } else {
        ApprovalPolicyOutcome::RequireApproval { reason_codes }
    }
}
