//! 错误分类：路由、推理、工具、沙箱、回合终止
//!
//! 与 RecoveryEngine 配合：Specialist 循环根据错误类型决定重试提示、折叠进历史，还是终止回合。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 回合级失败类型（写入终止 Meta 事件的 failure 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 分类阶段推理引擎不可达或超时
    RoutingUnavailable,
    /// Specialist 请求了不属于其工具子集的工具
    ToolNotPermitted,
    /// Specialist 循环中推理引擎不可达或超时
    ReasoningUnavailable,
    /// 步数预算耗尽
    Incomplete,
    /// 客户端断开
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RoutingUnavailable => "routing_unavailable",
            FailureKind::ToolNotPermitted => "tool_not_permitted",
            FailureKind::ReasoningUnavailable => "reasoning_unavailable",
            FailureKind::Incomplete => "incomplete",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 回合终止失败：kind + 可展示给用户的说明
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TurnFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn routing_unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RoutingUnavailable, message)
    }

    pub fn reasoning_unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ReasoningUnavailable, message)
    }

    pub fn tool_not_permitted(tool: &str, agent: &str) -> Self {
        Self::new(
            FailureKind::ToolNotPermitted,
            format!("tool '{tool}' is not available to the {agent} specialist"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "client disconnected")
    }

    /// 面向用户的简短说明（作为失败回合唯一的 Content）
    pub fn user_message(&self) -> String {
        match self.kind {
            FailureKind::RoutingUnavailable | FailureKind::ReasoningUnavailable => {
                "The reasoning service is currently unavailable, so this request could not be \
                 answered. Please try again shortly."
                    .to_string()
            }
            FailureKind::ToolNotPermitted => format!(
                "The request could not be completed because the specialist attempted an action \
                 outside its permitted tools ({}).",
                self.message
            ),
            FailureKind::Incomplete => self.message.clone(),
            FailureKind::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

/// 推理引擎边界错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReasoningError {
    #[error("reasoning engine unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning engine timed out after {0:?}")]
    Timeout(Duration),

    /// 输出无法解析为 Tool Call 或终止文本（可重试）
    #[error("malformed reasoning output: {0}")]
    Malformed(String),
}

impl ReasoningError {
    /// Unavailable / Timeout 对回合是致命的；Malformed 可通过重试提示恢复
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReasoningError::Malformed(_))
    }
}

/// 工具失败类型：瞬时（网关已重试一次）/ 永久（4xx 类，不重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    Transient,
    Permanent,
}

/// 工具调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind:?} tool failure: {message}")]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ToolFailureKind::Transient
    }
}

/// 沙箱失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFailureKind {
    /// 静态扫描或运行时导入守卫拒绝
    Forbidden,
    /// 超时 / 内存上限
    ResourceExceeded,
    /// 用户代码异常或输入加载失败（已清洗）
    ExecutionError,
    /// 工作池与等待队列已满
    Overloaded,
    /// 回合取消导致作业被终止
    Cancelled,
}

/// 沙箱作业失败：不携带原始堆栈，只有清洗后的 detail
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("sandbox {kind:?}: {detail}")]
pub struct SandboxFailure {
    pub kind: SandboxFailureKind,
    pub detail: String,
}

impl SandboxFailure {
    pub fn new(kind: SandboxFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(SandboxFailureKind::Forbidden, detail)
    }

    pub fn resource_exceeded(detail: impl Into<String>) -> Self {
        Self::new(SandboxFailureKind::ResourceExceeded, detail)
    }

    pub fn execution(detail: impl Into<String>) -> Self {
        Self::new(SandboxFailureKind::ExecutionError, detail)
    }

    pub fn overloaded(detail: impl Into<String>) -> Self {
        Self::new(SandboxFailureKind::Overloaded, detail)
    }
}

/// Specialist 循环遇到的错误，交给 RecoveryEngine 决定动作
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),

    #[error("tool not permitted: {0}")]
    ToolNotPermitted(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error(transparent)]
    Tool(#[from] ToolFailure),

    #[error(transparent)]
    Sandbox(#[from] SandboxFailure),

    #[error("cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让推理引擎重试（如输出格式错误）
    RetryWithPrompt(String),
    /// 作为失败的工具结果写回历史，由推理引擎自行决定重试或放弃
    FoldIntoHistory(String),
    /// 终止当前回合
    Abort(FailureKind),
}
