//! Mock LLM 客户端（测试与离线运行，无需 API）
//!
//! 有脚本时按顺序返回脚本中的回复（用尽后重复最后一条）；
//! 无脚本时把最后一条 User 消息包装成 conversational_response。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::message::{Message, Role};
use crate::llm::traits::LlmClient;

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<Vec<String>>,
    calls: AtomicUsize,
    /// 每次调用收到的消息，便于断言 prompt 内容
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Vec<Message>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).last().cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(messages.to_vec());

        let script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(reply) = script.get(n).or_else(|| script.last()) {
            return Ok(reply.clone());
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(serde_json::json!({
            "thought": "mock planner answers directly",
            "action": "conversational_response",
            "actionInput": { "answer": format!("Echo from Mock: {}", last_user) },
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_repeat_last() {
        let mock = MockLlmClient::scripted(["a", "b"]);
        let msgs = [Message::user("hi")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "a");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "b");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "b");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.last_prompt().unwrap()[0].content, "hi");
    }

    #[tokio::test]
    async fn test_default_reply_is_conversational() {
        let reply = MockLlmClient::new().complete(&[Message::user("ping")]).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["action"], "conversational_response");
        assert_eq!(v["actionInput"]["answer"], "Echo from Mock: ping");
    }
}
