//! Orchestrator：分类 → 委派 → 终结
//!
//! 每个回合：StreamStart → Thinking(决策) → 路由 Meta → 委派 Action → Specialist 循环 →
//! 唯一一个 Content → 终止 Meta。任何路径都以 Content + Meta:end 收尾，随后回合写入 ConversationStore。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::router::{RouteTarget, Router, RoutingDecision, DEFAULT_CONFIDENCE_FLOOR, OFF_TOPIC_MESSAGE};
use crate::core::state::{TurnPhase, TurnState};
use crate::core::{RecoveryEngine, SessionSupervisor, TurnFailure};
use crate::memory::{
    ConversationKey, ConversationStore, FeedbackSnapshot, FeedbackStore, Message, RoutingRecord,
    ToolOutputRef, Turn, TurnCommit, TurnOutcome,
};
use crate::react::{
    ActionStatus, ActionType, AgentKind, LifecycleEvent, Reasoner, SpecialistOutcome, SpecialistRun,
    SpecialistSession, ThinkingKind, Visibility, DEFAULT_MAX_TOOL_ROUNDS,
};
use crate::sandbox::SandboxExecutor;
use crate::stream::{EventPublisher, StreamFrame, TurnEvents};
use crate::tools::{ResolvedInvocation, ToolGateway};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_tool_rounds: usize,
    pub confidence_floor: f32,
    pub max_history_turns: usize,
    pub max_stored_turns: usize,
    pub max_conversations: usize,
    pub coalesce_thinking: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            max_history_turns: 10,
            max_stored_turns: 50,
            max_conversations: 1000,
            coalesce_thinking: false,
        }
    }
}

/// 一次用户回合
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub thread_id: String,
    pub message: String,
    /// 客户端自带的历史；为 None 时使用会话存储中的历史
    pub history: Option<Vec<Message>>,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            message: message.into(),
            history: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, &self.thread_id)
    }
}

/// 回合报告：已关闭的 Turn + 状态轨迹 + 路由决策
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn: Turn,
    pub phases: Vec<TurnPhase>,
    pub decision: Option<RoutingDecision>,
    pub tool_calls: usize,
}

/// 主控：持有共享依赖，回合之间互不阻塞
pub struct Orchestrator {
    router: Router,
    reasoner: Arc<dyn Reasoner>,
    gateway: Arc<ToolGateway>,
    sandbox: Arc<SandboxExecutor>,
    feedback: Arc<dyn FeedbackStore>,
    recovery: RecoveryEngine,
    conversations: ConversationStore,
    supervisor: SessionSupervisor,
    settings: OrchestratorSettings,
}

/// 回合内部的终结结果
struct Closing {
    content: String,
    source: Option<String>,
    outcome: TurnOutcome,
}

impl Orchestrator {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        gateway: Arc<ToolGateway>,
        sandbox: Arc<SandboxExecutor>,
        feedback: Arc<dyn FeedbackStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            router: Router::new(reasoner.clone(), settings.confidence_floor),
            reasoner,
            gateway,
            sandbox,
            feedback,
            recovery: RecoveryEngine::new(),
            conversations: ConversationStore::new(settings.max_history_turns)
                .with_limits(settings.max_stored_turns, settings.max_conversations),
            supervisor: SessionSupervisor::new(),
            settings,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn sandbox(&self) -> &SandboxExecutor {
        &self.sandbox
    }

    pub fn feedback(&self) -> &Arc<dyn FeedbackStore> {
        &self.feedback
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 为一个回合打开事件流
    pub fn open_stream(&self, visibility: Visibility) -> (EventPublisher, UnboundedReceiver<StreamFrame>) {
        let (publisher, rx) = EventPublisher::channel(visibility);
        (publisher.with_coalescing(self.settings.coalesce_thinking), rx)
    }

    /// 运行一个回合直到终止 Meta；接收端被丢弃时回合被取消
    pub async fn run_turn(&self, request: TurnRequest, publisher: EventPublisher) -> TurnReport {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.supervisor.begin(&turn_id);
        let watcher = publisher.watch_disconnect(cancel.clone());
        let mut events = TurnEvents::new(publisher);
        let mut state = TurnState::new();
        let key = request.key();
        let view = self.conversations.view(&key);

        tracing::info!(
            turn_id = %turn_id,
            user_id = %request.user_id,
            thread_id = %request.thread_id,
            prior_turns = view.turn_count,
            "turn started"
        );
        events.emit(LifecycleEvent::stream_start(format!("stream_{turn_id}")));
        events.emit(LifecycleEvent::thinking(
            ThinkingKind::Decision,
            "Deciding which specialist should handle this request",
            None,
            Visibility::Standard,
        ));

        let classified = self
            .router
            .classify(&request.message, view.last_active_specialist.as_deref(), &cancel)
            .await;

        let mut decision = None;
        let mut delegated: Option<AgentKind> = None;
        let mut resolved: Vec<ResolvedInvocation> = Vec::new();
        let closing = match classified {
            Err(failure) => {
                advance(&mut state, TurnPhase::Terminal);
                failure_closing(failure)
            }
            Ok(d) => {
                events.emit(LifecycleEvent::routing(d.target.label(), d.confidence, d.rationale.clone()));
                let closing = if d.target == RouteTarget::OffTopic {
                    advance(&mut state, TurnPhase::Rejected);
                    Closing {
                        content: OFF_TOPIC_MESSAGE.to_string(),
                        source: None,
                        outcome: TurnOutcome::Answer {
                            text: OFF_TOPIC_MESSAGE.to_string(),
                            incomplete: false,
                        },
                    }
                } else if d.is_below(self.router.confidence_floor()) {
                    tracing::info!(turn_id = %turn_id, confidence = d.confidence, "confidence below floor, asking to clarify");
                    advance(&mut state, TurnPhase::Rejected);
                    let question = self.router.clarifying_question(&d);
                    Closing {
                        content: question.clone(),
                        source: None,
                        outcome: TurnOutcome::Answer {
                            text: question,
                            incomplete: false,
                        },
                    }
                } else if let Some(agent) = d.agent() {
                    let history = request.history.clone().unwrap_or_else(|| view.history.clone());
                    let run = self
                        .delegate(agent, &request, &turn_id, history, &mut state, &mut events, cancel.clone())
                        .await;
                    resolved = run.invocations;
                    delegated = Some(agent);
                    self.close_specialist(agent, run.outcome)
                } else {
                    advance(&mut state, TurnPhase::Rejected);
                    failure_closing(TurnFailure::routing_unavailable("no specialist selected"))
                };
                decision = Some(d);
                closing
            }
        };

        events.emit(LifecycleEvent::content(closing.content, closing.source));
        let (incomplete, failure) = match &closing.outcome {
            TurnOutcome::Answer { incomplete, .. } => (*incomplete, None),
            TurnOutcome::Failure(f) => (false, Some(f.kind)),
        };
        events.emit(LifecycleEvent::end(incomplete, failure));
        watcher.abort();
        self.supervisor.finish(&turn_id);

        let tool_outputs: Vec<ToolOutputRef> = resolved
            .iter()
            .map(|r| ToolOutputRef {
                turn_id: turn_id.clone(),
                invocation_id: r.id().to_string(),
                tool: r.tool().name().to_string(),
                shape: r.shape(),
            })
            .collect();
        let routing = RoutingRecord {
            turn_id: turn_id.clone(),
            agent: delegated.map(|a| a.label().to_string()),
            confidence: decision.as_ref().map(|d| d.confidence).unwrap_or(0.0),
        };
        let turn = Turn::close(&turn_id, &request.message, events.into_log(), closing.outcome);

        tracing::info!(
            turn_id = %turn_id,
            agent = routing.agent.as_deref().unwrap_or("-"),
            tool_calls = resolved.len(),
            failure = ?failure,
            incomplete,
            "turn closed"
        );
        self.conversations.commit(
            &key,
            TurnCommit {
                turn: turn.clone(),
                routing,
                tool_outputs,
            },
        );

        TurnReport {
            turn,
            phases: state.trail().to_vec(),
            decision,
            tool_calls: resolved.len(),
        }
    }

    /// 单跳委派：取反馈快照、发委派 Action、运行 Specialist 循环
    #[allow(clippy::too_many_arguments)]
    async fn delegate(
        &self,
        agent: AgentKind,
        request: &TurnRequest,
        turn_id: &str,
        mut history: Vec<Message>,
        state: &mut TurnState,
        events: &mut TurnEvents,
        cancel: tokio_util::sync::CancellationToken,
    ) -> SpecialistRun {
        advance(state, TurnPhase::Delegated);
        let snapshot = FeedbackSnapshot::fetch(self.feedback.as_ref(), &request.user_id).await;
        let role = agent.role_prompt(&snapshot);
        let (icon, title) = agent.display();
        let action_id = format!("delegate_{turn_id}");

        events.emit(LifecycleEvent::action(
            ActionType::Delegation,
            &action_id,
            title,
            icon,
            ActionStatus::Running,
            Some(format!("Routing to {title}")),
            Some(serde_json::json!({
                "agent": agent.label(),
                "lessons": snapshot.lessons.len(),
                "preferences": snapshot.preferences.len(),
            })),
            Visibility::Minimal,
        ));
        advance(state, TurnPhase::Streaming);

        history.push(Message::user(&request.message));
        let session = SpecialistSession {
            agent,
            reasoner: self.reasoner.as_ref(),
            gateway: self.gateway.as_ref(),
            sandbox: self.sandbox.as_ref(),
            feedback: self.feedback.as_ref(),
            recovery: &self.recovery,
            cancel,
            max_tool_rounds: self.settings.max_tool_rounds,
            user_id: &request.user_id,
        };
        let run = session.run(&role, history, events).await;

        let status = match run.outcome {
            SpecialistOutcome::Failed(_) => ActionStatus::Failed,
            _ => ActionStatus::Success,
        };
        events.emit(LifecycleEvent::action(
            ActionType::Delegation,
            &action_id,
            title,
            icon,
            status,
            Some(format!("{} tool call(s)", run.invocations.len())),
            None,
            Visibility::Minimal,
        ));
        advance(state, TurnPhase::Terminal);
        run
    }

    fn close_specialist(&self, agent: AgentKind, outcome: SpecialistOutcome) -> Closing {
        match outcome {
            SpecialistOutcome::Final(text) => Closing {
                content: text.clone(),
                source: Some(agent.label().to_string()),
                outcome: TurnOutcome::Answer {
                    text,
                    incomplete: false,
                },
            },
            SpecialistOutcome::Exhausted { findings } => {
                let text = incomplete_summary(self.settings.max_tool_rounds, &findings);
                Closing {
                    content: text.clone(),
                    source: Some(agent.label().to_string()),
                    outcome: TurnOutcome::Answer {
                        text,
                        incomplete: true,
                    },
                }
            }
            SpecialistOutcome::Failed(failure) => failure_closing(failure),
        }
    }
}

fn failure_closing(failure: TurnFailure) -> Closing {
    Closing {
        content: failure.user_message(),
        source: None,
        outcome: TurnOutcome::Failure(failure),
    }
}

/// 步数耗尽时的部分答案
fn incomplete_summary(max_rounds: usize, findings: &[String]) -> String {
    if findings.is_empty() {
        return format!(
            "I could not finish this request within {max_rounds} tool rounds and no data was \
             retrieved yet. Please narrow the question and try again."
        );
    }
    let mut text = format!(
        "I could not finish this request within {max_rounds} tool rounds. Partial findings so far:\n"
    );
    for f in findings {
        text.push_str("- ");
        text.push_str(f);
        text.push('\n');
    }
    text.trim_end().to_string()
}

fn advance(state: &mut TurnState, next: TurnPhase) {
    if let Err(e) = state.advance(next) {
        tracing::error!(error = %e, "turn state machine violated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_summary_lists_findings() {
        let text = incomplete_summary(3, &["get_gene_dossier returned structured record: {}".to_string()]);
        assert!(text.contains("within 3 tool rounds"));
        assert!(text.contains("- get_gene_dossier"));
        assert!(incomplete_summary(3, &[]).contains("no data was retrieved"));
    }
}
