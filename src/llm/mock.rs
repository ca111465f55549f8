//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - ScriptedLlmClient：按顺序返回预设回复，并记录每次收到的消息，供测试断言
//! - KeywordLlmClient：关键词分类 + 固定说明文本，便于本地跑通完整事件流

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::router::CLASSIFY_PREFIX;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 脚本化客户端：每次 complete 弹出一条预设结果
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 追加一次失败（模拟推理引擎不可达）
    pub fn then_error(self, err: impl Into<String>) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Err(err.into()));
        }
        self
    }

    /// 每次调用前等待（模拟慢速推理，用于超时与取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 已收到的全部调用（每次调用的完整消息列表）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.script
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}

/// 关键词客户端：分类请求按关键词给出标签，其余请求返回固定说明
#[derive(Debug, Default)]
pub struct KeywordLlmClient;

impl KeywordLlmClient {
    fn classify(query: &str) -> (&'static str, f32) {
        let q = query.to_lowercase();
        let has_any = |words: &[&str]| words.iter().any(|w| q.contains(w));
        let variant_notation = regex::Regex::new(r"\bp\.[a-z]{1,3}\d+[a-z]{1,3}\b|\b[a-z]\d{2,4}[a-z]\b")
            .map(|re| re.is_match(&q))
            .unwrap_or(false);

        if variant_notation || has_any(&["mutation", "pathogenic", "benign", "clinvar", "hgvs"]) {
            ("variant", 0.7)
        } else if has_any(&["structure", "domain", "alphafold", "pdb", "binding", "residue", "fold"]) {
            ("structure", 0.7)
        } else if has_any(&["gene", "protein", "what is", "find", "search", "identify", "disease"]) {
            ("discovery", 0.6)
        } else {
            ("off_topic", 0.6)
        }
    }
}

#[async_trait]
impl LlmClient for KeywordLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        if let Some(query) = last_user.strip_prefix(CLASSIFY_PREFIX) {
            let (label, confidence) = Self::classify(query);
            return Ok(serde_json::json!({
                "label": label,
                "confidence": confidence,
                "rationale": "keyword match (mock reasoning backend)",
            })
            .to_string());
        }

        Ok("No reasoning backend is configured, so no data was retrieved for this request. \
            Set an API key to enable the specialist agents."
            .to_string())
    }
}
