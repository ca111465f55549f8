//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete 返回整段文本。
//! 结构化的 Tool Call / 终止文本解析在 react::planner 中完成。

use async_trait::async_trait;

use crate::memory::Message;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 错误以字符串返回，由推理适配器归类为 Unavailable
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;
}
