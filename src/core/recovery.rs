//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 Specialist 循环决定是重试、写回历史还是终止回合。

use crate::core::{AgentError, FailureKind, RecoveryAction, SandboxFailureKind, ToolFailureKind};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Reasoning(e) if !e.is_fatal() => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output could not be parsed ({e}). \
                 To call a tool, output exactly one JSON object of the form \
                 {{\"tool\": \"<tool name>\", \"args\": {{...}}}} and nothing else. \
                 To answer, output plain text without any JSON object."
            )),
            AgentError::Reasoning(_) => RecoveryAction::Abort(FailureKind::ReasoningUnavailable),
            AgentError::ToolNotPermitted(_) => RecoveryAction::Abort(FailureKind::ToolNotPermitted),
            AgentError::InvalidArguments { tool, reason } => RecoveryAction::FoldIntoHistory(
                format!("Error: invalid arguments for {tool}: {reason}"),
            ),
            AgentError::Tool(f) => match f.kind {
                // 永久失败必须如实叙述，不得编造数据
                ToolFailureKind::Permanent => RecoveryAction::FoldIntoHistory(format!(
                    "No data available: {}. Report that no data was found; do not invent identifiers.",
                    f.message
                )),
                ToolFailureKind::Transient => RecoveryAction::FoldIntoHistory(format!(
                    "Error: the data service is temporarily unavailable ({}).",
                    f.message
                )),
            },
            AgentError::Sandbox(f) => match f.kind {
                SandboxFailureKind::Cancelled => RecoveryAction::Abort(FailureKind::Cancelled),
                SandboxFailureKind::Forbidden => RecoveryAction::FoldIntoHistory(format!(
                    "Analysis rejected: {}. Only data-analysis code without OS, process or network access is allowed.",
                    f.detail
                )),
                _ => RecoveryAction::FoldIntoHistory(format!(
                    "Analysis failed ({:?}): {}",
                    f.kind, f.detail
                )),
            },
            AgentError::Cancelled => RecoveryAction::Abort(FailureKind::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ReasoningError, SandboxFailure, ToolFailure};
    use std::time::Duration;

    #[test]
    fn test_recovery_malformed_output_retries() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Reasoning(ReasoningError::Malformed("bad json".to_string()));
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_reasoning_timeout_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Reasoning(ReasoningError::Timeout(Duration::from_secs(1)));
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::Abort(FailureKind::ReasoningUnavailable)
        );
    }

    #[test]
    fn test_recovery_permanent_tool_failure_folds_no_data() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Tool(ToolFailure::permanent("portal returned 404"));
        match engine.handle(&err) {
            RecoveryAction::FoldIntoHistory(msg) => assert!(msg.starts_with("No data available")),
            other => panic!("Expected FoldIntoHistory, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_sandbox_failure_never_aborts() {
        let engine = RecoveryEngine::new();
        for failure in [
            SandboxFailure::forbidden("import of 'os'"),
            SandboxFailure::resource_exceeded("timeout"),
            SandboxFailure::execution("ZeroDivisionError: division by zero"),
            SandboxFailure::overloaded("queue full"),
        ] {
            let action = engine.handle(&AgentError::Sandbox(failure));
            assert!(matches!(action, RecoveryAction::FoldIntoHistory(_)));
        }
    }

    #[test]
    fn test_recovery_not_permitted_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolNotPermitted("align_isoforms".to_string());
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::Abort(FailureKind::ToolNotPermitted)
        );
    }
}
