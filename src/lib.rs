//! G2P Router - 生物学问答的多智能体编排核心
//!
//! 模块划分：
//! - **agent**: 运行时装配（配置 → Orchestrator）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、回合状态机、路由、编排、会话监管
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话历史、会话路由状态、反馈存储
//! - **observability**: tracing 初始化
//! - **react**: Specialist 定义、推理适配器、生命周期事件、有界工具循环
//! - **sandbox**: 分析代码沙箱（预加载、静态扫描、工作池、子进程）
//! - **stream**: 事件流发布器与可见性过滤
//! - **tools**: 封闭工具集合与门户网关

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod stream;
pub mod tools;

pub use crate::core::{Orchestrator, TurnReport, TurnRequest};
pub use crate::react::Visibility;
