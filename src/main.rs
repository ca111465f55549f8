//! g2p - 单轮查询 CLI
//!
//! 入口：初始化日志、加载配置、装配 Orchestrator，跑一个回合并把 SSE 帧逐条打印到 stdout。
//! 未设置 API Key 时回退到关键词 Mock LLM。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use g2p_router::{agent, config::load_config, observability, TurnRequest, Visibility};

#[derive(Debug, Parser)]
#[command(name = "g2p", version, about = "Route a biology question to a G2P specialist and stream the turn")]
struct Cli {
    /// 用户问题
    message: String,

    /// 可见性：minimal / standard / advanced（缺省取配置）
    #[arg(short, long)]
    visibility: Option<String>,

    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "cli")]
    user: String,

    #[arg(long, default_value = "default")]
    thread: String,

    /// 强制使用关键词 Mock LLM
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if cli.mock {
        cfg.llm.provider = "mock".to_string();
    }
    let visibility = Visibility::parse_lenient(
        cli.visibility
            .as_deref()
            .unwrap_or(&cfg.stream.default_visibility),
    );

    let orchestrator = agent::build_orchestrator(&cfg).context("Failed to build orchestrator")?;
    agent::check_sandbox(&orchestrator).await;

    let (publisher, mut rx) = orchestrator.open_stream(visibility);
    let request = TurnRequest::new(cli.user, cli.thread, cli.message);
    let printer = async {
        while let Some(frame) = rx.recv().await {
            print!("{}", frame.to_sse());
        }
    };
    let (report, ()) = tokio::join!(orchestrator.run_turn(request, publisher), printer);

    tracing::info!(
        phases = ?report.phases,
        tool_calls = report.tool_calls,
        failed = report.turn.outcome().is_failure(),
        "done"
    );
    Ok(())
}
