//! 核心编排层：错误与恢复、回合状态机、路由、编排、会话监管

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod session_supervisor;
pub mod state;

pub use error::{
    AgentError, FailureKind, ReasoningError, RecoveryAction, SandboxFailure, SandboxFailureKind, ToolFailure,
    ToolFailureKind, TurnFailure,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnReport, TurnRequest};
pub use recovery::RecoveryEngine;
pub use router::{RouteTarget, CLASSIFY_PREFIX, Router, RoutingDecision, DEFAULT_CONFIDENCE_FLOOR, OFF_TOPIC_MESSAGE};
pub use session_supervisor::SessionSupervisor;
pub use state::{IllegalTransition, TurnPhase, TurnState};
