//! 路由：一次推理调用完成意图分类
//!
//! 标签集合封闭：每个 Specialist 一个标签，外加 `off_topic`。
//! 输出无法解析为恰好一个标签时按 RoutingUnavailable 处理。

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::{ReasoningError, TurnFailure};
use crate::memory::Message;
use crate::react::{AgentKind, Reasoner};

/// 分类请求的用户消息前缀（KeywordLlmClient 据此识别分类调用）
pub const CLASSIFY_PREFIX: &str = "Classify this request:";

/// 非生物学请求的固定回复
pub const OFF_TOPIC_MESSAGE: &str = "I can only help with gene, protein structure and variant \
questions for the G2P portal. Try asking about a gene symbol (e.g. \"What is LDLR?\"), a protein's \
domains or structure, or a specific variant such as p.H23Q.";

pub const OFF_TOPIC_LABEL: &str = "off_topic";

/// 默认置信度下限：低于此值时先澄清再委派
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.35;

/// 分类目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Specialist(AgentKind),
    OffTopic,
}

impl RouteTarget {
    pub fn label(&self) -> &'static str {
        match self {
            RouteTarget::Specialist(a) => a.label(),
            RouteTarget::OffTopic => OFF_TOPIC_LABEL,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        let l = label.trim().trim_matches('"').to_lowercase();
        if l == OFF_TOPIC_LABEL || l == "off-topic" {
            return Some(RouteTarget::OffTopic);
        }
        AgentKind::from_label(&l).map(RouteTarget::Specialist)
    }
}

/// 每回合一次的路由决策
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub rationale: String,
    /// 仅作参考；低于下限时改为澄清问题
    pub confidence: f32,
}

impl RoutingDecision {
    pub fn agent(&self) -> Option<AgentKind> {
        match self.target {
            RouteTarget::Specialist(a) => Some(a),
            RouteTarget::OffTopic => None,
        }
    }

    pub fn is_below(&self, floor: f32) -> bool {
        self.confidence < floor
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    label: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    rationale: String,
}

fn default_confidence() -> f32 {
    1.0
}

/// 解析分类输出：JSON `{label, confidence, rationale}`，或单独一个标签
pub fn parse_decision(output: &str) -> Result<RoutingDecision, ReasoningError> {
    let trimmed = output.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let raw: RawDecision = serde_json::from_str(&trimmed[start..=end])
                .map_err(|e| ReasoningError::Malformed(format!("classification: {e}")))?;
            let target = RouteTarget::from_label(&raw.label)
                .ok_or_else(|| ReasoningError::Malformed(format!("unknown label '{}'", raw.label)))?;
            let confidence = if raw.confidence.is_finite() {
                raw.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            return Ok(RoutingDecision {
                target,
                rationale: raw.rationale,
                confidence,
            });
        }
    }
    RouteTarget::from_label(trimmed)
        .map(|target| RoutingDecision {
            target,
            rationale: String::new(),
            confidence: default_confidence(),
        })
        .ok_or_else(|| ReasoningError::Malformed("no single routing label in output".to_string()))
}

/// 分类系统提示：标签说明 + 上一回合的 Specialist
pub fn classification_prompt(last_active: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are the router of a biology assistant. Classify the user's request into exactly one label.\n\nLabels:\n",
    );
    for agent in AgentKind::ALL {
        prompt.push_str(&format!("- {}: {}\n", agent.label(), agent.routing_hint()));
    }
    prompt.push_str(&format!(
        "- {OFF_TOPIC_LABEL}: anything unrelated to genes, proteins or variants\n"
    ));
    if let Some(prev) = last_active {
        prompt.push_str(&format!(
            "\nThe previous turn in this conversation was handled by '{prev}'. Short follow-ups \
             (\"and its structure?\") refer to the same gene.\n"
        ));
    }
    prompt.push_str(
        "\nReply with ONLY a JSON object: {\"label\": \"<label>\", \"confidence\": <0..1>, \"rationale\": \"<one sentence>\"}",
    );
    prompt
}

/// 路由器
pub struct Router {
    reasoner: Arc<dyn Reasoner>,
    confidence_floor: f32,
}

impl Router {
    pub fn new(reasoner: Arc<dyn Reasoner>, confidence_floor: f32) -> Self {
        Self {
            reasoner,
            confidence_floor,
        }
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// 分类一次；推理不可用、超时或输出无法解析时回合失败
    pub async fn classify(
        &self,
        query: &str,
        last_active: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RoutingDecision, TurnFailure> {
        let system = classification_prompt(last_active);
        let history = [Message::user(format!("{CLASSIFY_PREFIX} {query}"))];
        let output = tokio::select! {
            r = self.reasoner.complete(&system, &history) => r,
            _ = cancel.cancelled() => return Err(TurnFailure::cancelled()),
        };
        let decision = output
            .and_then(|text| parse_decision(&text))
            .map_err(|e| {
                tracing::warn!(error = %e, "classification failed");
                TurnFailure::routing_unavailable(e.to_string())
            })?;
        tracing::info!(
            label = decision.target.label(),
            confidence = decision.confidence,
            "turn classified"
        );
        Ok(decision)
    }

    /// 低置信度时的澄清问题
    pub fn clarifying_question(&self, decision: &RoutingDecision) -> String {
        let guess = match decision.agent() {
            Some(a) => format!(" It looks closest to a {} question.", a.label()),
            None => String::new(),
        };
        format!(
            "I am not sure which part of the portal your question is about.{guess} Could you say \
             whether you want gene information (identity, function, disease links), protein \
             structure (domains, sites, 3D models) or a variant assessment (a specific mutation)?"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{KeywordLlmClient, ScriptedLlmClient};
    use crate::react::LlmReasoner;
    use std::time::Duration;

    fn router(replies: Vec<&str>) -> Router {
        let llm = Arc::new(ScriptedLlmClient::new(replies));
        Router::new(
            Arc::new(LlmReasoner::new(llm, Duration::from_secs(1))),
            DEFAULT_CONFIDENCE_FLOOR,
        )
    }

    #[test]
    fn test_parse_decision_variants() {
        let d = parse_decision(r#"{"label": "variant", "confidence": 0.9, "rationale": "HGVS"}"#).unwrap();
        assert_eq!(d.target, RouteTarget::Specialist(AgentKind::Variant));
        assert_eq!(d.rationale, "HGVS");

        let d = parse_decision("off_topic").unwrap();
        assert_eq!(d.target, RouteTarget::OffTopic);

        let d = parse_decision(r#"{"label": "structure", "confidence": 7}"#).unwrap();
        assert_eq!(d.confidence, 1.0);

        assert!(parse_decision("discovery or structure").is_err());
        assert!(parse_decision(r#"{"label": "chemistry"}"#).is_err());
    }

    #[test]
    fn test_prompt_mentions_previous_specialist() {
        let p = classification_prompt(Some("structure"));
        assert!(p.contains("handled by 'structure'"));
        assert!(p.contains("- off_topic:"));
        assert!(!classification_prompt(None).contains("previous turn"));
    }

    #[tokio::test]
    async fn test_classify_unreachable_is_routing_unavailable() {
        let r = router(vec![]);
        let err = r
            .classify("What is LDLR?", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::FailureKind::RoutingUnavailable);
    }

    #[tokio::test]
    async fn test_classification_message_carries_prefix() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"label": "variant", "confidence": 0.8}"#]));
        let r = Router::new(
            Arc::new(LlmReasoner::new(llm.clone(), Duration::from_secs(1))),
            DEFAULT_CONFIDENCE_FLOOR,
        );
        r.classify("Is p.C25S pathogenic?", None, &CancellationToken::new())
            .await
            .unwrap();
        let calls = llm.calls();
        let last = calls[0].last().unwrap();
        assert_eq!(last.content, format!("{CLASSIFY_PREFIX} Is p.C25S pathogenic?"));

        // 离线关键词后端按同一前缀识别分类请求
        let offline = Router::new(
            Arc::new(LlmReasoner::new(Arc::new(KeywordLlmClient), Duration::from_secs(1))),
            DEFAULT_CONFIDENCE_FLOOR,
        );
        let d = offline
            .classify("Show me the domains in BRCA1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(d.target, RouteTarget::Specialist(AgentKind::Structure));
    }

    #[tokio::test]
    async fn test_low_confidence_is_below_floor() {
        let r = router(vec![r#"{"label": "discovery", "confidence": 0.2}"#]);
        let d = r.classify("hmm", None, &CancellationToken::new()).await.unwrap();
        assert!(d.is_below(r.confidence_floor()));
        assert!(r.clarifying_question(&d).contains("discovery"));
    }
}
