//! 记忆层：对话历史、会话路由状态、反馈存储

pub mod conversation;
pub mod feedback;
pub mod routing;

pub use conversation::{ConversationMemory, Message, Role};
pub use feedback::{
    FeedbackError, FeedbackSnapshot, FeedbackStore, InMemoryFeedbackStore, Lesson, LessonStatus,
    LessonSubmission, SqliteFeedbackStore,
};
pub use routing::{
    Conversation, ConversationKey, ConversationStore, ConversationView, RoutingContext,
    RoutingRecord, ToolOutputRef, Turn, TurnCommit, TurnOutcome,
};
