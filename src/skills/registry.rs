//! 技能注册表
//!
//! 每个技能实现 Skill trait（manifest / execute），清单与实现一起注册；
//! 同 id 重复注册即替换。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::skills::manifest::SkillManifest;

/// 技能 trait：清单（schema、风险、信任与沙箱约束）+ 异步执行（inputs 为 JSON 对象）
#[async_trait]
pub trait Skill: Send + Sync {
    fn manifest(&self) -> &SkillManifest;

    /// 执行技能；Err 为人类可读的失败原因
    async fn execute(&self, inputs: Value) -> Result<Value, String>;
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Arc<dyn Skill>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册（或替换）技能，返回是否替换了已有的同 id 技能
    pub fn register(&self, skill: impl Skill + 'static) -> bool {
        self.register_arc(Arc::new(skill))
    }

    pub fn register_arc(&self, skill: Arc<dyn Skill>) -> bool {
        let id = skill.manifest().id.clone();
        let replaced = self
            .skills
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), skill)
            .is_some();
        if replaced {
            tracing::info!(skill = %id, "Skill replaced");
        } else {
            tracing::debug!(skill = %id, "Skill registered");
        }
        replaced
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Skill>> {
        self.skills
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.skills.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按 id 排序的清单
    pub fn manifests(&self) -> Vec<SkillManifest> {
        let mut manifests: Vec<SkillManifest> = self
            .skills
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|s| s.manifest().clone())
            .collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    pub fn ids(&self) -> Vec<String> {
        self.manifests().into_iter().map(|m| m.id).collect()
    }

    /// 技能目录 JSON，供 planner prompt 使用
    pub fn catalog_json(&self) -> String {
        let catalog: Vec<Value> = self
            .manifests()
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "description": m.description,
                    "inputs": m.inputs,
                    "risk": m.risk,
                    "minTrustLevel": m.min_trust_level,
                    "requiresApproval": m.requires_approval,
                })
            })
            .collect();
        serde_json::to_string_pretty(&catalog).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::manifest::SkillCategory;
    use serde_json::json;

    struct Echo {
        manifest: SkillManifest,
        tag: &'static str,
    }

    #[async_trait]
    impl Skill for Echo {
        fn manifest(&self) -> &SkillManifest {
            &self.manifest
        }

        async fn execute(&self, inputs: Value) -> Result<Value, String> {
            Ok(json!({"tag": self.tag, "inputs": inputs}))
        }
    }

    fn echo(id: &str, tag: &'static str) -> Echo {
        Echo {
            manifest: SkillManifest::new(id, SkillCategory::Other).description("echo inputs"),
            tag,
        }
    }

    #[tokio::test]
    async fn test_register_is_replace_by_id() {
        let registry = SkillRegistry::new();
        assert!(!registry.register(echo("echo", "v1")));
        assert!(registry.register(echo("echo", "v2")));
        assert_eq!(registry.len(), 1);

        let out = registry.get("echo").unwrap().execute(json!({"a": 1})).await.unwrap();
        assert_eq!(out["tag"], "v2");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_manifests_sorted_and_catalog() {
        let registry = SkillRegistry::new();
        registry.register(echo("zeta", "z"));
        registry.register(echo("alpha", "a"));
        assert_eq!(registry.ids(), vec!["alpha", "zeta"]);

        let catalog: Vec<Value> = serde_json::from_str(&registry.catalog_json()).unwrap();
        assert_eq!(catalog[0]["id"], "alpha");
        assert_eq!(catalog[0]["minTrustLevel"], "observe");
    }
}
