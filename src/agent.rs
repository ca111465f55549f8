//! 运行时装配
//!
//! 从 AppConfig 构建 LLM / 推理适配器 / 门户网关 / 沙箱 / 反馈存储，组装成 Orchestrator；
//! process_message 对单条消息跑完整回合并收集全部线上帧，供 CLI 与测试使用。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, FeedbackSection, LlmSection, PortalSection, SandboxSection};
use crate::core::{Orchestrator, OrchestratorSettings, TurnReport, TurnRequest};
use crate::llm::{KeywordLlmClient, LlmClient, OpenAiClient};
use crate::memory::{FeedbackStore, InMemoryFeedbackStore, SqliteFeedbackStore};
use crate::react::{LlmReasoner, Reasoner, Visibility};
use crate::sandbox::{PreloadOptions, SandboxConfig, SandboxExecutor};
use crate::stream::StreamFrame;
use crate::tools::{GatewayConfig, HttpPortal, PortalClient, ToolGateway};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / 关键词 Mock）
pub fn create_llm(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let api_key = std::env::var(&cfg.api_key_env).ok();
    match (cfg.provider.to_lowercase().as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using keyword mock LLM");
            Arc::new(KeywordLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible LLM");
            Arc::new(
                OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, Some(&key))
                    .with_temperature(cfg.temperature),
            )
        }
        (_, None) => {
            tracing::warn!(env = %cfg.api_key_env, "No API key set, using keyword mock LLM");
            Arc::new(KeywordLlmClient)
        }
    }
}

pub fn gateway_config(cfg: &PortalSection) -> GatewayConfig {
    GatewayConfig {
        base_url: cfg.base_url.trim_end_matches('/').to_string(),
        pdb_base_url: cfg.pdb_base_url.trim_end_matches('/').to_string(),
        timeout: Duration::from_secs(cfg.timeout_secs),
        retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        max_search_results: cfg.max_search_results,
    }
}

pub fn preload_options(cfg: &SandboxSection) -> PreloadOptions {
    PreloadOptions {
        numeric_columns: cfg.numeric_columns.clone(),
        text_columns: cfg.text_columns.clone(),
        identity_key: cfg.identity_key.clone(),
        dedupe: cfg.dedupe,
    }
}

pub fn sandbox_config(cfg: &SandboxSection) -> SandboxConfig {
    SandboxConfig {
        python: cfg.python.clone(),
        timeout: Duration::from_secs(cfg.timeout_secs),
        memory_limit_mb: cfg.memory_limit_mb,
        max_output_bytes: cfg.max_output_bytes,
        workers: cfg.workers.max(1),
        queue_limit: cfg.queue_limit,
        queue_wait: Duration::from_secs(cfg.queue_wait_secs),
        preload: preload_options(cfg),
    }
}

/// 反馈存储：memory 或 sqlite
pub fn create_feedback_store(cfg: &FeedbackSection) -> anyhow::Result<Arc<dyn FeedbackStore>> {
    match cfg.backend.to_lowercase().as_str() {
        "sqlite" => {
            let store = SqliteFeedbackStore::open(&cfg.sqlite_path)
                .with_context(|| format!("open feedback store {}", cfg.sqlite_path.display()))?;
            tracing::info!(path = %cfg.sqlite_path.display(), "SQLite feedback store");
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(InMemoryFeedbackStore::new())),
        other => anyhow::bail!("unknown feedback backend '{other}' (expected memory or sqlite)"),
    }
}

pub fn orchestrator_settings(cfg: &AppConfig) -> OrchestratorSettings {
    OrchestratorSettings {
        max_tool_rounds: cfg.agents.max_tool_rounds.max(1),
        confidence_floor: cfg.router.confidence_floor,
        max_history_turns: cfg.app.max_history_turns,
        max_stored_turns: cfg.app.max_stored_turns.max(1),
        max_conversations: cfg.app.max_conversations.max(1),
        coalesce_thinking: cfg.stream.coalesce_thinking,
    }
}

/// 用显式依赖装配（测试注入脚本化 LLM 与静态门户）
pub fn build_orchestrator_with(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    portal: Arc<dyn PortalClient>,
    feedback: Arc<dyn FeedbackStore>,
) -> Orchestrator {
    let reasoner: Arc<dyn Reasoner> = Arc::new(LlmReasoner::new(llm, Duration::from_secs(cfg.llm.timeout_secs)));
    let gateway = ToolGateway::new(portal, gateway_config(&cfg.portal)).with_preload_options(preload_options(&cfg.sandbox));
    let sandbox = SandboxExecutor::new(sandbox_config(&cfg.sandbox));
    Orchestrator::new(
        reasoner,
        Arc::new(gateway),
        Arc::new(sandbox),
        feedback,
        orchestrator_settings(cfg),
    )
}

/// 从配置装配完整运行时
pub fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<Orchestrator> {
    let llm = create_llm(&cfg.llm);
    let portal: Arc<dyn PortalClient> = Arc::new(HttpPortal::new(Duration::from_secs(cfg.portal.timeout_secs)));
    let feedback = create_feedback_store(&cfg.feedback)?;
    Ok(build_orchestrator_with(cfg, llm, portal, feedback))
}

/// 启动检查：沙箱解释器是否可用
pub async fn check_sandbox(orchestrator: &Orchestrator) -> bool {
    let ok = orchestrator.sandbox().interpreter_available().await;
    if !ok {
        tracing::warn!(
            python = %orchestrator.sandbox().config().python,
            "sandbox interpreter not found, run_analysis will fail"
        );
    }
    ok
}

/// 跑一个完整回合并收集投递给客户端的帧
pub async fn process_message(
    orchestrator: &Orchestrator,
    request: TurnRequest,
    visibility: Visibility,
) -> (TurnReport, Vec<StreamFrame>) {
    let (publisher, mut rx) = orchestrator.open_stream(visibility);
    let report = orchestrator.run_turn(request, publisher).await;
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    (report, frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_from_section() {
        let section = SandboxSection {
            workers: 0,
            timeout_secs: 2,
            ..SandboxSection::default()
        };
        let cfg = sandbox_config(&section);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        assert_eq!(cfg.preload.identity_key, "residueId");
    }

    #[test]
    fn test_unknown_feedback_backend_is_rejected() {
        let section = FeedbackSection {
            backend: "redis".to_string(),
            ..FeedbackSection::default()
        };
        assert!(create_feedback_store(&section).is_err());
    }

    #[test]
    fn test_mock_provider_needs_no_key() {
        let section = LlmSection {
            provider: "mock".to_string(),
            ..LlmSection::default()
        };
        let _llm = create_llm(&section);
    }
}
