//! ReAct scratchpad：一次运行内只追加的步骤序列

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::skills::ErrorClass;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 从 1 开始
    pub index: usize,
    pub thought: String,
    pub action: String,
    pub action_input: Value,
    /// 给 planner 看的观察文本
    pub observation: String,
    /// 完整原始结果（成功输出或错误详情）
    pub raw: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub timestamp_ms: i64,
}

impl Step {
    pub fn new(thought: impl Into<String>, action: impl Into<String>, action_input: Value) -> Self {
        Self {
            index: 0,
            thought: thought.into(),
            action: action.into(),
            action_input,
            observation: String::new(),
            raw: Value::Null,
            error_class: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn observed(mut self, observation: String, raw: Value, error_class: Option<ErrorClass>) -> Self {
        self.observation = observation;
        self.raw = raw;
        self.error_class = error_class;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error_class.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Scratchpad {
    steps: Vec<Step>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加并编号，返回追加后的步骤
    pub fn push(&mut self, mut step: Step) -> &Step {
        step.index = self.steps.len() + 1;
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 供 prompt 使用的文本，包含每步的完整原始结果
    pub fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&format!("Step {}\n", step.index));
            if !step.thought.is_empty() {
                out.push_str(&format!("Thought: {}\n", step.thought));
            }
            out.push_str(&format!("Action: {}\n", step.action));
            out.push_str(&format!("Action Input: {}\n", step.action_input));
            out.push_str(&format!("Observation: {}\n", step.observation));
            if !step.raw.is_null() {
                out.push_str(&format!("Raw Result: {}\n", step.raw));
            }
            out.push('\n');
        }
        out
    }

    /// 未正常完成时，从已有结果拼一个尽力而为的回答
    pub fn synthesize_answer(&self, goal: &str) -> String {
        let successes: Vec<&Step> = self.steps.iter().filter(|s| s.is_success()).collect();
        let Some(last) = successes.last() else {
            return format!(
                "Could not make progress on \"{}\" in {} step(s); no skill call succeeded.",
                goal,
                self.steps.len()
            );
        };
        let actions: Vec<&str> = successes.iter().map(|s| s.action.as_str()).collect();
        format!(
            "Stopped before finishing \"{}\". Successful steps: {}. Latest result ({}): {}",
            goal,
            actions.join(", "),
            last.action,
            last.observation
        )
    }
}
