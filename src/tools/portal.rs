//! G2P 门户传输层
//!
//! PortalClient 只负责一次 HTTP 往返；重试、超时与失败分类在 ToolGateway 中完成。
//! HttpPortal 基于 reqwest；StaticPortal 是按 URL 预置响应的内存实现（测试与离线演示）。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// 一次门户请求
#[derive(Debug, Clone, PartialEq)]
pub struct PortalRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Value>,
}

impl PortalRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
        }
    }
}

/// 门户响应（非文本内容不读取 body）
#[derive(Debug, Clone, PartialEq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl PortalResponse {
    pub fn ok(content_type: &str, body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn json(value: Value) -> Self {
        Self::ok("application/json", value.to_string())
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 传输层错误（一律视为瞬时失败）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn send(&self, request: &PortalRequest) -> Result<PortalResponse, TransportError>;
}

fn is_textual(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.is_empty()
        || ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("csv")
        || ct.contains("tab-separated")
        || ct.contains("chemical/x-pdb")
}

/// reqwest 实现
pub struct HttpPortal {
    client: Client,
}

impl HttpPortal {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("g2p-router/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl PortalClient for HttpPortal {
    async fn send(&self, request: &PortalRequest) -> Result<PortalResponse, TransportError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => {
                let b = self.client.post(&request.url);
                match &request.body {
                    Some(body) => b.json(body),
                    None => b,
                }
            }
        };
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = if is_textual(content_type.as_deref().unwrap_or("")) {
            resp.text().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Other(e.to_string())
                }
            })?
        } else {
            String::new()
        };
        Ok(PortalResponse {
            status,
            content_type,
            body,
        })
    }
}

/// 内存门户：每个 URL 对应一个响应队列，队列只剩一项时重复返回该项；未登记的 URL 返回 404
#[derive(Default)]
pub struct StaticPortal {
    routes: Mutex<HashMap<String, VecDeque<Result<PortalResponse, TransportError>>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticPortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(self, url: impl Into<String>, response: PortalResponse) -> Self {
        self.with_sequence(url, vec![Ok(response)])
    }

    pub fn with_sequence(
        self,
        url: impl Into<String>,
        responses: Vec<Result<PortalResponse, TransportError>>,
    ) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(url.into(), responses.into_iter().collect());
        }
        self
    }

    /// 某个 URL 被请求的次数
    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .map(|h| h.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().map(|h| h.values().sum()).unwrap_or(0)
    }
}

#[async_trait]
impl PortalClient for StaticPortal {
    async fn send(&self, request: &PortalRequest) -> Result<PortalResponse, TransportError> {
        if let Ok(mut hits) = self.hits.lock() {
            *hits.entry(request.url.clone()).or_insert(0) += 1;
        }
        let mut routes = self
            .routes
            .lock()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        match routes.get_mut(&request.url) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(PortalResponse::status(404))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(PortalResponse::status(404))),
            None => Ok(PortalResponse::status(404)),
        }
    }
}
