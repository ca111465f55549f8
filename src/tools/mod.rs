//! 工具层：封闭工具集合、参数记录、门户网关
//!
//! 每个工具是 ToolKind 的一个变体，参数由 ToolRequest::parse 按 schema 校验；
//! 网关工具由 ToolGateway 执行，run_analysis 交给沙箱，suggest_improvement 写入反馈存储。

pub mod catalog;
pub mod gateway;
pub mod invocation;
pub mod payload;
pub mod portal;

pub use catalog::{
    tools_schema_json, ArgumentError, DataFormat, ImprovementCategory, RunAnalysisArgs,
    SuggestImprovementArgs, ToolKind, ToolRequest,
};
pub use gateway::{GatewayConfig, ToolGateway};
pub use invocation::{Resolution, ResolvedInvocation, ToolInvocation};
pub use payload::{Delimiter, PayloadKind, ToolPayload, ToolResult};
pub use portal::{HttpMethod, HttpPortal, PortalClient, PortalRequest, PortalResponse, StaticPortal, TransportError};
