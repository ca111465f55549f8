//! 认知层：Specialist 定义、推理边界、生命周期事件、有界工具循环

pub mod agents;
pub mod events;
pub mod loop_;
pub mod planner;

pub use agents::AgentKind;
pub use events::{ActionStatus, ActionType, EventBody, EventKind, LifecycleEvent, StreamFrame, ThinkingKind, Visibility};
pub use loop_::{SpecialistOutcome, SpecialistRun, SpecialistSession, DEFAULT_MAX_TOOL_ROUNDS};
pub use planner::{parse_reasoning, LlmReasoner, Reasoner, Reasoning, ToolCallRequest};
