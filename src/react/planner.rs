//! Planner：每轮产出一个 {thought, action, actionInput}
//!
//! LlmPlanner 把目标、技能目录与 scratchpad（含完整原始结果）拼进 prompt，
//! parse_planner_output 从回复中提取 JSON（支持 ```json 代码块）；没有 JSON 的纯文本视为直接回答。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::{LlmClient, Message};
use crate::react::scratchpad::Scratchpad;

/// 表示"已完成、直接回答"的 action
pub const COMPLETION_ACTION: &str = "conversational_response";

/// 规划结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    /// 本轮推理
    #[serde(default)]
    pub thought: String,
    /// 技能 id，或 conversational_response 表示完成
    pub action: String,
    /// 技能输入；完成时为 {"answer": "..."}
    #[serde(default, alias = "action_input")]
    pub action_input: Value,
}

impl PlannedStep {
    pub fn new(thought: impl Into<String>, action: impl Into<String>, action_input: Value) -> Self {
        Self {
            thought: thought.into(),
            action: action.into(),
            action_input,
        }
    }

    pub fn answer_with(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(String::new(), COMPLETION_ACTION, serde_json::json!({ "answer": text }))
    }

    pub fn is_completion(&self) -> bool {
        self.action == COMPLETION_ACTION
    }

    /// 完成时的回答文本
    pub fn answer(&self) -> String {
        match &self.action_input {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("answer")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.thought.clone()),
            _ => self.thought.clone(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("planner LLM call failed: {0}")]
    Llm(String),

    #[error("planner output is not a valid step: {0}")]
    Parse(String),
}

/// 一次规划调用可见的上下文
pub struct PlanContext<'a> {
    pub goal: &'a str,
    /// 技能目录 JSON
    pub catalog: &'a str,
    pub scratchpad: &'a Scratchpad,
    pub iteration: usize,
    pub max_iterations: usize,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, ctx: &PlanContext<'_>) -> Result<PlannedStep, PlanError>;
}

/// 返回 PlannedStep 的 JSON Schema，拼入 system prompt
pub fn planned_step_schema_json() -> String {
    let schema = schema_for!(PlannedStep);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解析 LLM 输出
pub fn parse_planner_output(output: &str) -> Result<PlannedStep, PlanError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(PlanError::Parse("empty reply".to_string()));
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            &trimmed[start..=end]
        } else {
            return Ok(PlannedStep::answer_with(trimmed));
        }
    } else {
        return Ok(PlannedStep::answer_with(trimmed));
    };

    let step: PlannedStep = serde_json::from_str(json_str)
        .map_err(|e| PlanError::Parse(format!("{}: {}", e, clip(json_str, 200))))?;
    if step.action.trim().is_empty() {
        return Err(PlanError::Parse("missing 'action'".to_string()));
    }
    Ok(step)
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

const SYSTEM_PROMPT: &str = "You are the Hive operator. Reach the user's goal by calling one skill per step \
and reading its observation before deciding the next step. Never repeat a call that already failed with \
the same inputs; follow the hint attached to each error. When the goal is reached (or cannot be reached), \
reply with action \"conversational_response\" and actionInput {\"answer\": \"...\"}.\n\
Reply with exactly one JSON object matching this schema:\n";

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: format!("{}{}", SYSTEM_PROMPT, planned_step_schema_json()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn build_messages(&self, ctx: &PlanContext<'_>) -> Vec<Message> {
        let history = if ctx.scratchpad.is_empty() {
            "(no steps yet)".to_string()
        } else {
            ctx.scratchpad.render()
        };
        let user = format!(
            "Goal: {}\n\nAvailable skills:\n{}\n\nScratchpad:\n{}\n\nIteration {}/{}. What is the next step?",
            ctx.goal, ctx.catalog, history, ctx.iteration, ctx.max_iterations
        );
        vec![Message::system(self.system_prompt.clone()), Message::user(user)]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, ctx: &PlanContext<'_>) -> Result<PlannedStep, PlanError> {
        let reply = self
            .llm
            .complete(&self.build_messages(ctx))
            .await
            .map_err(PlanError::Llm)?;
        tracing::debug!(iteration = ctx.iteration, reply = %clip(&reply, 500), "Planner reply");
        parse_planner_output(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    #[test]
    fn test_parse_plain_and_fenced_json() {
        let step = parse_planner_output(r#"{"thought":"look","action":"fs_list","actionInput":{"path":"."}}"#)
            .unwrap();
        assert_eq!(step.action, "fs_list");
        assert_eq!(step.action_input, json!({"path": "."}));

        let fenced = "Sure.\n```json\n{\"thought\":\"t\",\"action\":\"fs_read\",\"action_input\":{\"path\":\"a\"}}\n```";
        let step = parse_planner_output(fenced).unwrap();
        assert_eq!(step.action, "fs_read");
        assert_eq!(step.action_input["path"], "a");
    }

    #[test]
    fn test_plain_text_is_an_answer() {
        let step = parse_planner_output("The answer is 42.").unwrap();
        assert!(step.is_completion());
        assert_eq!(step.answer(), "The answer is 42.");
    }

    #[test]
    fn test_broken_json_is_parse_error() {
        assert!(matches!(
            parse_planner_output("{\"action\": "),
            Err(PlanError::Parse(_))
        ));
        assert!(matches!(
            parse_planner_output(r#"{"thought":"x","action":""}"#),
            Err(PlanError::Parse(_))
        ));
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = planned_step_schema_json();
        assert!(schema.contains("actionInput"));
        assert!(schema.contains("thought"));
    }

    #[tokio::test]
    async fn test_llm_planner_prompt_carries_goal_and_catalog() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"thought":"done","action":"conversational_response","actionInput":{"answer":"ok"}}"#,
        ]));
        let planner = LlmPlanner::new(llm.clone());
        let pad = Scratchpad::new();
        let ctx = PlanContext {
            goal: "tidy notes",
            catalog: "[{\"id\":\"fs_list\"}]",
            scratchpad: &pad,
            iteration: 1,
            max_iterations: 10,
        };
        let step = planner.plan(&ctx).await.unwrap();
        assert_eq!(step.answer(), "ok");

        let prompt = llm.last_prompt().unwrap();
        assert!(prompt[0].content.contains("conversational_response"));
        assert!(prompt[1].content.contains("Goal: tidy notes"));
        assert!(prompt[1].content.contains("fs_list"));
    }
}
