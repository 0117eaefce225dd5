//! 观察格式化：把技能结果（成功、错误、等待审批）转成给 planner 看的文本
//!
//! 每类错误都附带一条补救提示，让下一轮规划能自我纠正而不是盲目重试。

use serde::Deserialize;
use serde_json::Value;

use crate::skills::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObservationFormat {
    /// 紧凑 JSON，超长截断
    #[default]
    Summary,
    /// 格式化 JSON，不截断
    Verbatim,
}

pub fn hint(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::NotFound => {
            "No skill or item with that name. Check the available skills list, and list a directory with fs_list before reading a file from it."
        }
        ErrorClass::ValidationError => {
            "The inputs do not match the skill schema. Re-read the required fields and their types, then fix actionInput."
        }
        ErrorClass::SandboxViolation => {
            "The path or command is outside what the skill allows. Use a path inside the workspace or a whitelisted command without shell syntax; do not retry the same value."
        }
        ErrorClass::AwaitingApproval => {
            "The call is queued for human approval. Do not issue it again; continue with other steps or answer with what is known."
        }
        ErrorClass::ExecutionError => {
            "The skill ran and failed. Read the error and change the inputs or use a different skill instead of repeating the call."
        }
        ErrorClass::Timeout => "The skill took too long. Narrow the request or pick a cheaper skill.",
        ErrorClass::InvalidPlan => {
            "The last reply was not a valid step. Reply with exactly one JSON object containing thought, action and actionInput."
        }
    }
}

fn render(value: &Value, format: ObservationFormat, max_chars: usize) -> String {
    match format {
        ObservationFormat::Verbatim => serde_json::to_string_pretty(value).unwrap_or_default(),
        ObservationFormat::Summary => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            truncate(&text, max_chars)
        }
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if max_chars == 0 || total <= max_chars {
        return text.to_string();
    }
    format!(
        "{}...(truncated {} chars)",
        text.chars().take(max_chars).collect::<String>(),
        total - max_chars
    )
}

pub fn format_success(value: &Value, format: ObservationFormat, max_chars: usize) -> String {
    format!("[ok] {}", render(value, format, max_chars))
}

pub fn format_error(class: ErrorClass, message: &str, max_chars: usize) -> String {
    format!(
        "[{}] {}\nHint: {}",
        class,
        truncate(message, max_chars),
        hint(class)
    )
}

pub fn format_awaiting(queue_id: &str) -> String {
    format!(
        "[{}] queued for approval as {}\nHint: {}",
        ErrorClass::AwaitingApproval,
        queue_id,
        hint(ErrorClass::AwaitingApproval)
    )
}
