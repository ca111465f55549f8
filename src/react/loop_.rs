//! Specialist 推理循环
//!
//! Reason -> 校验工具子集 -> Act (Gateway / Sandbox / Feedback) -> 结果写回历史 -> 下一轮。
//! 工具轮数有上限；格式错误的输出也消耗一轮。每次工具调用前后各发一个 Action 事件。

use std::collections::HashMap;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, FailureKind, RecoveryAction, RecoveryEngine, ToolFailure, TurnFailure};
use crate::memory::{FeedbackStore, LessonSubmission, Message};
use crate::react::agents::AgentKind;
use crate::react::events::{ActionStatus, ActionType, LifecycleEvent, ThinkingKind, Visibility};
use crate::react::planner::{Reasoner, Reasoning, ToolCallRequest};
use crate::sandbox::{inline_payload, SandboxExecutor, SandboxJob};
use crate::stream::TurnEvents;
use crate::tools::payload::truncate_chars;
use crate::tools::{
    Resolution, ResolvedInvocation, ToolGateway, ToolInvocation, ToolKind, ToolPayload, ToolRequest, ToolResult,
};

/// 默认最大工具轮数
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
/// 写回历史的工具结果预览长度
const OBSERVATION_PREVIEW_CHARS: usize = 4000;
/// Action 事件里的结果摘要长度
const ACTION_SUMMARY_CHARS: usize = 200;

/// 循环结果
#[derive(Debug, Clone, PartialEq)]
pub enum SpecialistOutcome {
    /// 推理引擎给出终止文本
    Final(String),
    /// 工具轮数耗尽；findings 为已获得的结果摘要
    Exhausted { findings: Vec<String> },
    Failed(TurnFailure),
}

/// 一次 Specialist 运行
#[derive(Debug, Clone)]
pub struct SpecialistRun {
    pub outcome: SpecialistOutcome,
    pub invocations: Vec<ResolvedInvocation>,
}

/// Specialist 会话：循环所需的全部依赖
pub struct SpecialistSession<'a> {
    pub agent: AgentKind,
    pub reasoner: &'a dyn Reasoner,
    pub gateway: &'a ToolGateway,
    pub sandbox: &'a SandboxExecutor,
    pub feedback: &'a dyn FeedbackStore,
    pub recovery: &'a RecoveryEngine,
    pub cancel: CancellationToken,
    pub max_tool_rounds: usize,
    pub user_id: &'a str,
}

impl<'a> SpecialistSession<'a> {
    /// 运行循环直到终止文本、轮数耗尽或致命错误
    pub async fn run(
        &self,
        role: &str,
        mut history: Vec<Message>,
        events: &mut TurnEvents,
    ) -> SpecialistRun {
        let tools = self.agent.tools();
        let mut resolved: Vec<ResolvedInvocation> = Vec::new();
        let mut outputs: HashMap<String, ToolResult> = HashMap::new();
        let mut rounds_used = 0usize;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break SpecialistOutcome::Failed(TurnFailure::cancelled());
            }
            events.emit(LifecycleEvent::thinking(
                ThinkingKind::Planning,
                format!("{} planning step {}", self.agent.display().1, rounds_used + 1),
                Some(json!({ "round": rounds_used + 1, "max_rounds": self.max_tool_rounds })),
                Visibility::Advanced,
            ));

            let reasoning = tokio::select! {
                r = self.reasoner.reason(role, &history, tools) => r,
                _ = self.cancel.cancelled() => break SpecialistOutcome::Failed(TurnFailure::cancelled()),
            };

            let call = match reasoning {
                Ok(Reasoning::Final(text)) => break SpecialistOutcome::Final(text),
                Ok(Reasoning::ToolCall(call)) => call,
                Err(e) => {
                    let err = AgentError::Reasoning(e);
                    match self.recovery.handle(&err) {
                        RecoveryAction::RetryWithPrompt(prompt) | RecoveryAction::FoldIntoHistory(prompt) => {
                            tracing::warn!(agent = %self.agent, error = %err, "malformed reasoning output, retrying");
                            rounds_used += 1;
                            if rounds_used > self.max_tool_rounds {
                                break SpecialistOutcome::Exhausted { findings: findings(&resolved) };
                            }
                            history.push(Message::user(prompt));
                            continue;
                        }
                        RecoveryAction::Abort(failure) => break SpecialistOutcome::Failed(abort(failure, &err)),
                    }
                }
            };

            if rounds_used >= self.max_tool_rounds {
                tracing::info!(agent = %self.agent, rounds_used, "tool round budget exhausted");
                break SpecialistOutcome::Exhausted { findings: findings(&resolved) };
            }

            let kind = match ToolKind::from_name(&call.tool).filter(|k| self.agent.permits(*k)) {
                Some(k) => k,
                None => {
                    tracing::warn!(agent = %self.agent, tool = %call.tool, "tool outside specialist subset");
                    break SpecialistOutcome::Failed(TurnFailure::tool_not_permitted(
                        &call.tool,
                        self.agent.label(),
                    ));
                }
            };
            rounds_used += 1;

            let invocation = ToolInvocation::start(kind, call.args.clone());
            history.push(Message::assistant(call_json(&call)));

            match self.invoke(kind, &invocation, call, &outputs, events).await {
                Ok(result) => {
                    history.push(Message::user(format!(
                        "Tool `{}` (invocation {}) returned {}:\n{}",
                        kind.name(),
                        invocation.id(),
                        result.payload.describe(),
                        result.payload.preview(OBSERVATION_PREVIEW_CHARS)
                    )));
                    outputs.insert(invocation.id().to_string(), result.clone());
                    resolved.push(invocation.resolve(Resolution::Success(result)));
                }
                Err(err) => {
                    let action = self.recovery.handle(&err);
                    resolved.push(invocation.clone().resolve(Resolution::Failure(err.to_string())));
                    match action {
                        RecoveryAction::FoldIntoHistory(text) | RecoveryAction::RetryWithPrompt(text) => {
                            history.push(Message::user(format!(
                                "Tool `{}` (invocation {}) failed. {}",
                                kind.name(),
                                invocation.id(),
                                text
                            )));
                        }
                        RecoveryAction::Abort(failure) => break SpecialistOutcome::Failed(abort(failure, &err)),
                    }
                }
            }
        };

        SpecialistRun {
            outcome,
            invocations: resolved,
        }
    }

    /// 校验参数并执行一次调用，前后各发一个 Action 事件
    async fn invoke(
        &self,
        kind: ToolKind,
        invocation: &ToolInvocation,
        call: ToolCallRequest,
        outputs: &HashMap<String, ToolResult>,
        events: &mut TurnEvents,
    ) -> Result<ToolResult, AgentError> {
        let (icon, title) = kind.display();
        let request = ToolRequest::parse(kind, call.args);
        let summary = request.as_ref().ok().map(|r| r.summary());
        events.emit(LifecycleEvent::action(
            ActionType::Tool,
            invocation.id(),
            title,
            icon,
            ActionStatus::Running,
            summary,
            Some(json!({ "tool": kind.name(), "args": invocation.arguments() })),
            Visibility::Standard,
        ));

        let result = match request {
            Ok(req) => self.execute(req, outputs).await,
            Err(e) => Err(AgentError::InvalidArguments {
                tool: kind.name().to_string(),
                reason: e.to_string(),
            }),
        };

        let (status, summary) = match &result {
            Ok(r) => (ActionStatus::Success, r.payload.describe()),
            Err(e) => (ActionStatus::Failed, e.to_string()),
        };
        events.emit(LifecycleEvent::action(
            ActionType::Tool,
            invocation.id(),
            title,
            icon,
            status,
            Some(truncate_chars(&summary, ACTION_SUMMARY_CHARS)),
            None,
            Visibility::Standard,
        ));
        result
    }

    async fn execute(
        &self,
        request: ToolRequest,
        outputs: &HashMap<String, ToolResult>,
    ) -> Result<ToolResult, AgentError> {
        match request {
            ToolRequest::RunAnalysis(args) => {
                let payload = match (&args.source, &args.data_payload, args.data_format) {
                    (Some(source), _, _) => outputs
                        .get(source.trim())
                        .map(|r| r.payload.clone())
                        .ok_or_else(|| AgentError::InvalidArguments {
                            tool: ToolKind::RunAnalysis.name().to_string(),
                            reason: format!("no earlier result with invocation id '{source}' in this turn"),
                        })?,
                    (None, Some(raw), Some(format)) => {
                        inline_payload(raw, format).map_err(|e| AgentError::InvalidArguments {
                            tool: ToolKind::RunAnalysis.name().to_string(),
                            reason: e.to_string(),
                        })?
                    }
                    _ => {
                        return Err(AgentError::InvalidArguments {
                            tool: ToolKind::RunAnalysis.name().to_string(),
                            reason: "either `source` or `data_payload` with `data_format` is required".to_string(),
                        })
                    }
                };
                let job = SandboxJob::new(payload, args.code, args.description).with_dedupe(args.dedupe);
                let out = self.sandbox.execute(job, &self.cancel).await?;
                let mut text = out.captured_output;
                if out.truncated {
                    text.push_str("\n[output truncated]");
                }
                Ok(ToolResult::new(ToolPayload::Text(text), "sandbox"))
            }
            ToolRequest::SuggestImprovement(args) => {
                let lesson = self
                    .feedback
                    .submit_lesson(LessonSubmission {
                        text: args.suggestion,
                        category: Some(args.category.as_str().to_string()),
                        submitted_by: Some(self.user_id.to_string()),
                    })
                    .await
                    .map_err(|e| AgentError::Tool(ToolFailure::transient(e.to_string())))?;
                Ok(ToolResult::new(
                    ToolPayload::Text(format!(
                        "Suggestion {} recorded as pending; it takes effect only after administrator review.",
                        lesson.id
                    )),
                    "feedback",
                ))
            }
            gateway_request => {
                tokio::select! {
                    r = self.gateway.call(&gateway_request) => r.map_err(AgentError::from),
                    _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
                }
            }
        }
    }
}

fn call_json(call: &ToolCallRequest) -> String {
    serde_json::to_string(call).unwrap_or_else(|_| call.tool.clone())
}

fn abort(kind: FailureKind, err: &AgentError) -> TurnFailure {
    match kind {
        FailureKind::Cancelled => TurnFailure::cancelled(),
        other => TurnFailure::new(other, err.to_string()),
    }
}

/// 已成功调用的结果摘要（轮数耗尽时作为部分答案）
fn findings(resolved: &[ResolvedInvocation]) -> Vec<String> {
    resolved
        .iter()
        .filter_map(|r| {
            r.result().map(|res| {
                format!(
                    "{} returned {}: {}",
                    r.tool().name(),
                    res.payload.describe(),
                    res.payload.preview(300)
                )
            })
        })
        .collect()
}
