//! 技能系统
//!
//! 技能（Skill）= 清单（输入输出 schema、风险、成本、最低信任级别、审批要求、沙箱约束）+ 实现。
//! SkillExecutor 统一负责校验、沙箱、审批策略、超时与审计。

pub mod builtin;
pub mod executor;
pub mod manifest;
pub mod policy;
pub mod registry;
pub mod sandbox;

pub use builtin::register_builtin;
pub use executor::{DecideOutcome, ErrorClass, SkillError, SkillExecutor, SkillOutcome};
pub use manifest::{Cost, FieldSpec, FieldType, Risk, SkillCategory, SkillManifest, TrustLevel};
pub use policy::{evaluate_skill_approval, ApprovalPolicyOutcome};
pub use registry::{Skill, SkillRegistry};
