//! 技能清单：输入/输出 schema、风险、成本、最低信任级别、审批要求与沙箱约束

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 信任级别（有序）：observe < suggest < supervised_auto < bounded_auto < adaptive_auto
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Observe,
    Suggest,
    SupervisedAuto,
    BoundedAuto,
    AdaptiveAuto,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Observe,
        TrustLevel::Suggest,
        TrustLevel::SupervisedAuto,
        TrustLevel::BoundedAuto,
        TrustLevel::AdaptiveAuto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Observe => "observe",
            TrustLevel::Suggest => "suggest",
            TrustLevel::SupervisedAuto => "supervised_auto",
            TrustLevel::BoundedAuto => "bounded_auto",
            TrustLevel::AdaptiveAuto => "adaptive_auto",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustLevel::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| format!("unknown trust level '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cost {
    #[default]
    Free,
    Cheap,
    Expensive,
}

/// 字段类型；`path` 是会经过目录沙箱检查的字符串
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Path,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Path => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Path => "path",
            FieldType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// 技能类别，决定执行器施加哪类沙箱检查
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillCategory {
    Fs,
    Shell,
    Tasks,
    Memory,
    Agent,
    Llm,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillManifest {
    pub id: String,
    pub category: SkillCategory,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub cost: Cost,
    pub min_trust_level: TrustLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_directories: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_whitelist: Vec<String>,
}

impl SkillManifest {
    pub fn new(id: impl Into<String>, category: SkillCategory) -> Self {
        Self {
            id: id.into(),
            category,
            description: String::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            risk: Risk::Low,
            cost: Cost::Free,
            min_trust_level: TrustLevel::Observe,
            requires_approval: false,
            allowed_directories: Vec::new(),
            command_whitelist: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, name: &str, field_type: FieldType, required: bool, description: &str) -> Self {
        self.inputs.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required,
                description: description.to_string(),
            },
        );
        self
    }

    pub fn output(mut self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.outputs.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required: false,
                description: description.to_string(),
            },
        );
        self
    }

    pub fn risk(mut self, risk: Risk) -> Self {
        self.risk = risk;
        self
    }

    pub fn cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    pub fn min_trust(mut self, level: TrustLevel) -> Self {
        self.min_trust_level = level;
        self
    }

    pub fn requires_approval(mut self, yes: bool) -> Self {
        self.requires_approval = yes;
        self
    }

    pub fn allowed_directories(mut self, dirs: Vec<PathBuf>) -> Self {
        self.allowed_directories = dirs;
        self
    }

    pub fn command_whitelist(mut self, commands: Vec<String>) -> Self {
        self.command_whitelist = commands;
        self
    }

    /// 校验输入：必须是对象（null 视为空对象），必填字段存在且非 null，已给出字段类型匹配。
    /// 未声明的字段不拒绝。
    pub fn validate_inputs(&self, inputs: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let map = match inputs {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("inputs must be a JSON object, got {}", type_name(other))),
        };

        let mut problems = Vec::new();
        for (name, field) in &self.inputs {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("missing required field '{}'", name));
                    }
                }
                Some(value) if !field.field_type.matches(value) => problems.push(format!(
                    "field '{}' must be {}, got {}",
                    name,
                    field.field_type.as_str(),
                    type_name(value)
                )),
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// 类型为 path 的输入字段名
    pub fn path_fields(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|(_, f)| f.field_type == FieldType::Path)
            .map(|(name, _)| name.as_str())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
