//! g2p-server - SSE 服务
//!
//! 启动: cargo run --bin g2p-server --features server
//! POST /chat/stream 返回 text/event-stream；客户端断开即取消回合。

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;

use g2p_router::agent;
use g2p_router::config::{load_config, AppConfig};
use g2p_router::memory::{LessonSubmission, Message, Role};
use g2p_router::{Orchestrator, TurnRequest, Visibility};

struct AppState {
    config: AppConfig,
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default = "default_user")]
    user_id: String,
    #[serde(default = "default_thread")]
    thread_id: String,
    #[serde(default)]
    message: Option<String>,
    /// 完整消息列表：最后一条 user 消息为本回合输入，其余作为历史
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    visibility: Option<String>,
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_thread() -> String {
    "default".to_string()
}

impl ChatRequest {
    fn into_turn(self) -> Option<TurnRequest> {
        if let Some(message) = self.message.filter(|m| !m.trim().is_empty()) {
            return Some(TurnRequest::new(self.user_id, self.thread_id, message));
        }
        let mut history: Vec<Message> = self
            .messages
            .into_iter()
            .filter_map(|m| match Role::parse(&m.role)? {
                Role::System => None,
                role => Some(Message::new(role, m.content)),
            })
            .collect();
        let last_user = history.iter().rposition(|m| m.role == Role::User)?;
        let message = history.remove(last_user).content;
        history.truncate(last_user);
        Some(TurnRequest::new(self.user_id, self.thread_id, message).with_history(history))
    }
}

/// POST /chat/stream
async fn chat_stream(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> impl IntoResponse {
    let visibility = Visibility::parse_lenient(
        req.visibility
            .as_deref()
            .unwrap_or(&state.config.stream.default_visibility),
    );
    let Some(turn) = req.into_turn() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "either `message` or a `messages` list ending with a user message is required" })),
        )
            .into_response();
    };

    let (publisher, rx) = state.orchestrator.open_stream(visibility);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.run_turn(turn, publisher).await;
    });

    let frames = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        let event = Event::default()
            .event(frame.event_kind.as_str())
            .data(frame.payload.to_string());
        Some((Ok::<_, std::convert::Infallible>(event), rx))
    });
    Sse::new(frames)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let orch = &state.orchestrator;
    let pool = orch.sandbox().pool();
    Json(json!({
        "status": "ok",
        "active_turns": orch.supervisor().active_turns(),
        "conversations": orch.conversations().len(),
        "sandbox": {
            "available_workers": pool.available(),
            "waiting": pool.waiting(),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct LessonRequest {
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    submitted_by: Option<String>,
}

/// POST /lessons：提交待审核的教训
async fn submit_lesson(State(state): State<Arc<AppState>>, Json(req): Json<LessonRequest>) -> impl IntoResponse {
    if req.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "text is required" }))).into_response();
    }
    let submission = LessonSubmission {
        text: req.text,
        category: req.category,
        submitted_by: req.submitted_by,
    };
    match state.orchestrator.feedback().submit_lesson(submission).await {
        Ok(lesson) => (StatusCode::CREATED, Json(json!(lesson))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "lesson submission failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    g2p_router::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let orchestrator = Arc::new(agent::build_orchestrator(&cfg)?);
    agent::check_sandbox(&orchestrator).await;

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let state = Arc::new(AppState {
        config: cfg,
        orchestrator: orchestrator.clone(),
    });

    let app = Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/status", get(status))
        .route("/lessons", post(submit_lesson))
        .with_state(state);

    tracing::info!("G2P router listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            orchestrator.supervisor().shutdown();
        })
        .await?;
    Ok(())
}
