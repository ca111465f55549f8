//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 关键词 Mock / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{KeywordLlmClient, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::LlmClient;
