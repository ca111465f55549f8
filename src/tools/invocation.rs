//! 工具调用记录
//!
//! ToolInvocation 只能通过 resolve 消耗自身得到 ResolvedInvocation，解析后不可再变；
//! 网关内部的重试不产生新记录，推理引擎再次请求同一工具则是新的调用。

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::tools::catalog::ToolKind;
use crate::tools::payload::ToolResult;

fn invocation_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("inv_{}", &raw[..10])
}

/// 已发出、尚未解析的调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    id: String,
    tool: ToolKind,
    arguments: Value,
    started_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn start(tool: ToolKind, arguments: Value) -> Self {
        Self {
            id: invocation_id(),
            tool,
            arguments,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn resolve(self, resolution: Resolution) -> ResolvedInvocation {
        ResolvedInvocation {
            invocation: self,
            resolution,
            resolved_at: Utc::now(),
        }
    }
}

/// 解析结果：成功载荷或失败说明
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Success(ToolResult),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInvocation {
    invocation: ToolInvocation,
    resolution: Resolution,
    resolved_at: DateTime<Utc>,
}

impl ResolvedInvocation {
    pub fn id(&self) -> &str {
        self.invocation.id()
    }

    pub fn tool(&self) -> ToolKind {
        self.invocation.tool()
    }

    pub fn invocation(&self) -> &ToolInvocation {
        &self.invocation
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match &self.resolution {
            Resolution::Success(r) => Some(r),
            Resolution::Failure(_) => None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.resolved_at - self.invocation.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    /// 结果形状（写入路由上下文）
    pub fn shape(&self) -> String {
        match &self.resolution {
            Resolution::Success(r) => r.payload.describe(),
            Resolution::Failure(_) => "failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::payload::ToolPayload;

    #[test]
    fn test_each_invocation_gets_fresh_id() {
        let a = ToolInvocation::start(ToolKind::GetGeneDossier, Value::Null);
        let b = ToolInvocation::start(ToolKind::GetGeneDossier, Value::Null);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("inv_"));

        let resolved = a.resolve(Resolution::Success(ToolResult::new(
            ToolPayload::Text("ok".to_string()),
            "test",
        )));
        assert_eq!(resolved.tool(), ToolKind::GetGeneDossier);
        assert!(resolved.result().is_some());
        assert_eq!(resolved.shape(), "text, 1 lines");
    }
}
