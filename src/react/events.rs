//! 回合生命周期事件：StreamStart / Thinking / Action / Content / Meta
//!
//! 每个事件自带 visibility 等级；stream::EventPublisher 按客户端请求的等级过滤后投递。
//! `frame()` 生成线上帧 `{event_kind, visibility, payload}`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::FailureKind;

/// 可见性等级：minimal < standard < advanced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Minimal,
    Standard,
    Advanced,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Standard
    }
}

impl Visibility {
    pub const ALL: [Visibility; 3] = [Visibility::Minimal, Visibility::Standard, Visibility::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Minimal => "minimal",
            Visibility::Standard => "standard",
            Visibility::Advanced => "advanced",
        }
    }

    /// 宽松解析（未知值回退 standard）
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Visibility::Minimal,
            "advanced" => Visibility::Advanced,
            _ => Visibility::Standard,
        }
    }
}

/// 事件种类（线上帧的 event 名）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StreamStart,
    Thinking,
    Action,
    Content,
    Meta,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StreamStart => "stream_start",
            EventKind::Thinking => "thinking",
            EventKind::Action => "action",
            EventKind::Content => "content",
            EventKind::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingKind {
    Decision,
    Planning,
    Analyzing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Delegation,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Running,
    Success,
    Failed,
}

/// 事件主体
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// 清单帧：打开通道
    StreamStart {
        stream_id: String,
        expected_events: Vec<EventKind>,
    },
    Thinking {
        thinking_type: ThinkingKind,
        summary: String,
        details: Option<Value>,
    },
    Action {
        action_type: ActionType,
        action_id: String,
        title: String,
        icon: String,
        status: ActionStatus,
        summary: Option<String>,
        raw_data: Option<Value>,
    },
    Content {
        text: String,
        source: Option<String>,
    },
    /// 路由决策（非终止 Meta）
    Routing {
        agent: String,
        confidence: f32,
        rationale: String,
    },
    /// 终止 Meta：关闭通道
    End {
        incomplete: bool,
        failure: Option<FailureKind>,
    },
}

/// 单个生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event_id: String,
    pub visibility: Visibility,
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
}

fn event_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("evt_{}", &raw[..12])
}

impl LifecycleEvent {
    fn new(visibility: Visibility, body: EventBody) -> Self {
        Self {
            event_id: event_id(),
            visibility,
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        Self::new(
            Visibility::Minimal,
            EventBody::StreamStart {
                stream_id: stream_id.into(),
                expected_events: vec![
                    EventKind::Thinking,
                    EventKind::Action,
                    EventKind::Content,
                    EventKind::Meta,
                ],
            },
        )
    }

    pub fn thinking(
        thinking_type: ThinkingKind,
        summary: impl Into<String>,
        details: Option<Value>,
        visibility: Visibility,
    ) -> Self {
        Self::new(
            visibility,
            EventBody::Thinking {
                thinking_type,
                summary: summary.into(),
                details,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn action(
        action_type: ActionType,
        action_id: impl Into<String>,
        title: impl Into<String>,
        icon: impl Into<String>,
        status: ActionStatus,
        summary: Option<String>,
        raw_data: Option<Value>,
        visibility: Visibility,
    ) -> Self {
        Self::new(
            visibility,
            EventBody::Action {
                action_type,
                action_id: action_id.into(),
                title: title.into(),
                icon: icon.into(),
                status,
                summary,
                raw_data,
            },
        )
    }

    /// 最终答案：总是 minimal
    pub fn content(text: impl Into<String>, source: Option<String>) -> Self {
        Self::new(
            Visibility::Minimal,
            EventBody::Content {
                text: text.into(),
                source,
            },
        )
    }

    pub fn routing(agent: impl Into<String>, confidence: f32, rationale: impl Into<String>) -> Self {
        Self::new(
            Visibility::Standard,
            EventBody::Routing {
                agent: agent.into(),
                confidence,
                rationale: rationale.into(),
            },
        )
    }

    pub fn end(incomplete: bool, failure: Option<FailureKind>) -> Self {
        Self::new(Visibility::Minimal, EventBody::End { incomplete, failure })
    }

    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::StreamStart { .. } => EventKind::StreamStart,
            EventBody::Thinking { .. } => EventKind::Thinking,
            EventBody::Action { .. } => EventKind::Action,
            EventBody::Content { .. } => EventKind::Content,
            EventBody::Routing { .. } | EventBody::End { .. } => EventKind::Meta,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.body, EventBody::End { .. })
    }

    /// 不受可见性过滤：清单帧、最终答案、终止 Meta
    pub fn is_unsuppressible(&self) -> bool {
        matches!(
            self.body,
            EventBody::StreamStart { .. } | EventBody::Content { .. } | EventBody::End { .. }
        )
    }

    /// 线上帧
    pub fn frame(&self) -> StreamFrame {
        let mut payload = match &self.body {
            EventBody::StreamStart {
                stream_id,
                expected_events,
            } => json!({
                "stream_id": stream_id,
                "expected_events": expected_events,
                "transparency_support": Visibility::ALL,
            }),
            EventBody::Thinking {
                thinking_type,
                summary,
                details,
            } => {
                let mut v = json!({
                    "type": thinking_type,
                    "display_summary": summary,
                });
                if let Some(d) = details {
                    v["details"] = d.clone();
                }
                v
            }
            EventBody::Action {
                action_type,
                action_id,
                title,
                icon,
                status,
                summary,
                raw_data,
            } => {
                let mut v = json!({
                    "type": action_type,
                    "action_id": action_id,
                    "display_title": title,
                    "display_icon": icon,
                    "display_status": status,
                });
                if let Some(s) = summary {
                    v["display_summary"] = json!(s);
                }
                if let Some(r) = raw_data {
                    v["raw_data"] = r.clone();
                }
                v
            }
            EventBody::Content { text, source } => {
                let mut v = json!({ "text": text, "is_final": true });
                if let Some(s) = source {
                    v["source"] = json!(s);
                }
                v
            }
            EventBody::Routing {
                agent,
                confidence,
                rationale,
            } => json!({
                "type": "routing",
                "agent": agent,
                "confidence": confidence,
                "rationale": rationale,
            }),
            EventBody::End {
                incomplete,
                failure,
            } => json!({
                "type": "end",
                "incomplete": incomplete,
                "failure": failure,
            }),
        };
        payload["event_id"] = json!(self.event_id);
        payload["visibility"] = json!(self.visibility);
        payload["timestamp"] = json!(self.timestamp.to_rfc3339());
        StreamFrame {
            event_kind: self.kind(),
            visibility: self.visibility,
            payload,
        }
    }
}

/// 线上帧：`{event_kind, visibility, payload}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamFrame {
    pub event_kind: EventKind,
    pub visibility: Visibility,
    pub payload: Value,
}

impl StreamFrame {
    /// 标准 SSE 文本帧：`event: <kind>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.event_kind.as_str(),
            self.payload
        )
    }
}
