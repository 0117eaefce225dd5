//! LLM 层：消息、客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
#[cfg(feature = "openai")]
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;
