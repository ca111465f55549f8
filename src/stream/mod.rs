//! 事件流：可见性过滤、Thinking 合并、SSE 帧、回合事件日志

pub mod publisher;
pub mod sink;

pub use crate::react::events::{StreamFrame, Visibility};
pub use publisher::{should_emit, EventPublisher, PublishError, PublishOutcome};
pub use sink::TurnEvents;
