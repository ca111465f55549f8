//! Reasoning Adapter：推理引擎边界
//!
//! reason(role, history, tools) 返回 Tool Call 或终止文本；
//! parse_reasoning 从输出中提取 JSON `{"tool": "...", "args": {...}}`，其余视为终止文本。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ReasoningError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{tools_schema_json, ToolKind};

/// 推理引擎请求的工具调用（未校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reasoning {
    ToolCall(ToolCallRequest),
    Final(String),
}

const TOOL_CALL_FORMAT: &str = "\n\n## Tool call format\n\
To call a tool, reply with ONLY a JSON object: {\"tool\": \"<name>\", \"args\": {...}}.\n\
One tool per reply. When you have enough information, reply with the final answer as plain text \
(no JSON). Never invent identifiers that no tool returned.";

/// 解析推理输出
pub fn parse_reasoning(output: &str) -> Result<Reasoning, ReasoningError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ReasoningError::Malformed("empty output".to_string()));
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Ok(Reasoning::Final(trimmed.to_string()));
        }
    } else {
        return Ok(Reasoning::Final(trimmed.to_string()));
    };

    match serde_json::from_str::<ToolCallRequest>(json_str) {
        Ok(call) if call.tool.trim().is_empty() => Ok(Reasoning::Final(trimmed.to_string())),
        Ok(call) => Ok(Reasoning::ToolCall(ToolCallRequest {
            tool: call.tool.trim().to_string(),
            args: if call.args.is_null() { Value::Object(Default::default()) } else { call.args },
        })),
        // 看起来是工具调用却无法解析：要求重试
        Err(e) if json_str.contains("\"tool\"") => {
            Err(ReasoningError::Malformed(format!("{e}: {}", truncate(json_str, 200))))
        }
        // 普通答案里恰好带了花括号
        Err(_) => Ok(Reasoning::Final(trimmed.to_string())),
    }
}

fn truncate(s: &str, max: usize) -> String {
    crate::tools::payload::truncate_chars(s, max)
}

/// 推理引擎边界
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// 原始补全：system + 历史 → 文本
    async fn complete(&self, system: &str, history: &[Message]) -> Result<String, ReasoningError>;

    /// 给定角色、历史与可用工具，返回 Tool Call 或终止文本
    async fn reason(
        &self,
        role: &str,
        history: &[Message],
        tools: &[ToolKind],
    ) -> Result<Reasoning, ReasoningError> {
        let system = if tools.is_empty() {
            role.to_string()
        } else {
            format!(
                "{role}\n\n## Available tools\n{}{TOOL_CALL_FORMAT}",
                tools_schema_json(tools)
            )
        };
        let output = self.complete(&system, history).await?;
        parse_reasoning(&output)
    }
}

/// 基于 LlmClient 的实现，带统一超时
pub struct LlmReasoner {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmReasoner {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn complete(&self, system: &str, history: &[Message]) -> Result<String, ReasoningError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(system));
        messages.extend_from_slice(history);
        match tokio::time::timeout(self.timeout, self.llm.complete(&messages)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(ReasoningError::Unavailable(e)),
            Err(_) => Err(ReasoningError::Timeout(self.timeout)),
        }
    }
}
