//! 事件流发布器
//!
//! 纯转发：按请求的可见性过滤事件并按生成顺序投递；可把相邻 Thinking 片段合并为一帧。
//! 唯一状态是当前回合流的开/关：终止 Meta 之后的事件一律拒绝。

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::react::events::{EventBody, LifecycleEvent, StreamFrame, Visibility};

/// 单次 publish 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Emitted,
    Suppressed,
    /// Thinking 片段已缓存，将与后续片段合并后投递
    Buffered,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("stream already closed by terminal meta event")]
    Closed,
    #[error("client disconnected")]
    Disconnected,
}

/// 可见性规则：事件等级 <= 请求等级时投递；Content / 终止 Meta / 清单帧永不抑制
pub fn should_emit(event: &LifecycleEvent, requested: Visibility) -> bool {
    event.is_unsuppressible() || event.visibility <= requested
}

/// 回合事件发布器
pub struct EventPublisher {
    requested: Visibility,
    tx: mpsc::UnboundedSender<StreamFrame>,
    closed: bool,
    coalesce_thinking: bool,
    pending_thinking: Option<LifecycleEvent>,
}

impl EventPublisher {
    pub fn new(tx: mpsc::UnboundedSender<StreamFrame>, requested: Visibility) -> Self {
        Self {
            requested,
            tx,
            closed: false,
            coalesce_thinking: false,
            pending_thinking: None,
        }
    }

    /// 创建发布器与接收端
    pub fn channel(requested: Visibility) -> (Self, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, requested), rx)
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_thinking = enabled;
        self
    }

    pub fn requested(&self) -> Visibility {
        self.requested
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 客户端断开（接收端被丢弃）时取消 token：用于中断进行中的推理与沙箱作业
    pub fn watch_disconnect(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("stream consumer dropped, cancelling turn");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    }

    pub fn publish(&mut self, event: LifecycleEvent) -> Result<PublishOutcome, PublishError> {
        if self.closed {
            tracing::warn!(kind = ?event.kind(), "late event after stream end rejected");
            return Err(PublishError::Closed);
        }
        if !should_emit(&event, self.requested) {
            return Ok(PublishOutcome::Suppressed);
        }

        if self.coalesce_thinking && matches!(event.body, EventBody::Thinking { .. }) {
            match self.pending_thinking.take() {
                Some(pending) if can_merge(&pending, &event) => {
                    self.pending_thinking = Some(merge_thinking(pending, event));
                }
                Some(pending) => {
                    self.send(&pending)?;
                    self.pending_thinking = Some(event);
                }
                None => self.pending_thinking = Some(event),
            }
            return Ok(PublishOutcome::Buffered);
        }

        self.flush()?;
        self.send(&event)?;
        if event.is_terminal() {
            self.closed = true;
        }
        Ok(PublishOutcome::Emitted)
    }

    /// 投递缓存的 Thinking 片段
    pub fn flush(&mut self) -> Result<(), PublishError> {
        if let Some(pending) = self.pending_thinking.take() {
            self.send(&pending)?;
        }
        Ok(())
    }

    fn send(&mut self, event: &LifecycleEvent) -> Result<(), PublishError> {
        if self.tx.send(event.frame()).is_err() {
            self.closed = true;
            return Err(PublishError::Disconnected);
        }
        Ok(())
    }
}

fn can_merge(a: &LifecycleEvent, b: &LifecycleEvent) -> bool {
    match (&a.body, &b.body) {
        (
            EventBody::Thinking { thinking_type: ta, .. },
            EventBody::Thinking { thinking_type: tb, .. },
        ) => ta == tb && a.visibility == b.visibility,
        _ => false,
    }
}

/// 合并两个 Thinking：摘要按行拼接，details 收拢为数组；保留第一个片段的 id 与时间戳
fn merge_thinking(mut first: LifecycleEvent, next: LifecycleEvent) -> LifecycleEvent {
    if let (
        EventBody::Thinking {
            summary, details, ..
        },
        EventBody::Thinking {
            summary: next_summary,
            details: next_details,
            ..
        },
    ) = (&mut first.body, next.body)
    {
        summary.push('\n');
        summary.push_str(&next_summary);
        *details = match (details.take(), next_details) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (Some(serde_json::Value::Array(mut a)), Some(b)) => {
                a.push(b);
                Some(serde_json::Value::Array(a))
            }
            (Some(a), Some(b)) => Some(serde_json::Value::Array(vec![a, b])),
        };
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::events::{ActionStatus, ActionType, EventKind, ThinkingKind};

    fn sample_turn() -> Vec<LifecycleEvent> {
        vec![
            LifecycleEvent::stream_start("s"),
            LifecycleEvent::thinking(ThinkingKind::Decision, "classify", None, Visibility::Advanced),
            LifecycleEvent::routing("discovery", 0.9, "gene symbol"),
            LifecycleEvent::action(
                ActionType::Delegation,
                "d1",
                "Genetic Discovery Specialist",
                "🧬",
                ActionStatus::Running,
                None,
                None,
                Visibility::Minimal,
            ),
            LifecycleEvent::action(
                ActionType::Tool,
                "t1",
                "Fetching Gene Information",
                "📊",
                ActionStatus::Running,
                None,
                None,
                Visibility::Standard,
            ),
            LifecycleEvent::thinking(ThinkingKind::Analyzing, "reading dossier", None, Visibility::Advanced),
            LifecycleEvent::content("LDLR encodes the LDL receptor.", None),
            LifecycleEvent::end(false, None),
        ]
    }

    fn delivered(events: &[LifecycleEvent], level: Visibility) -> Vec<String> {
        let (mut publisher, mut rx) = EventPublisher::channel(level);
        for ev in events {
            publisher.publish(ev.clone()).unwrap();
        }
        let mut ids = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            ids.push(frame.payload["event_id"].as_str().unwrap().to_string());
        }
        ids
    }

    #[test]
    fn test_raising_level_only_adds_events() {
        let events = sample_turn();
        let minimal = delivered(&events, Visibility::Minimal);
        let standard = delivered(&events, Visibility::Standard);
        let advanced = delivered(&events, Visibility::Advanced);

        assert_eq!(advanced.len(), events.len());
        // 低等级的投递序列是高等级序列的子序列（不增删、不重排）
        for (low, high) in [(&minimal, &standard), (&standard, &advanced)] {
            let mut it = high.iter();
            for id in low {
                assert!(it.any(|h| h == id), "{id} missing or reordered");
            }
            assert!(low.len() <= high.len());
        }
        assert!(minimal.len() < standard.len());
        assert!(standard.len() < advanced.len());
    }

    #[test]
    fn test_content_and_end_never_suppressed() {
        let events = sample_turn();
        let (mut publisher, mut rx) = EventPublisher::channel(Visibility::Minimal);
        for ev in events {
            publisher.publish(ev).unwrap();
        }
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push((frame.event_kind, frame.payload["type"].as_str().map(String::from)));
        }
        let contents = kinds.iter().filter(|(k, _)| *k == EventKind::Content).count();
        assert_eq!(contents, 1);
        let last = kinds.last().unwrap();
        assert_eq!(last.0, EventKind::Meta);
        assert_eq!(last.1.as_deref(), Some("end"));
    }

    #[test]
    fn test_late_events_rejected_after_end() {
        let (mut publisher, _rx) = EventPublisher::channel(Visibility::Advanced);
        publisher.publish(LifecycleEvent::end(false, None)).unwrap();
        assert!(publisher.is_closed());
        assert_eq!(
            publisher.publish(LifecycleEvent::content("late", None)),
            Err(PublishError::Closed)
        );
    }

    #[test]
    fn test_thinking_fragments_coalesce_in_order() {
        let (publisher, mut rx) = EventPublisher::channel(Visibility::Advanced);
        let mut publisher = publisher.with_coalescing(true);
        for text in ["step 1", "step 2", "step 3"] {
            assert_eq!(
                publisher
                    .publish(LifecycleEvent::thinking(
                        ThinkingKind::Planning,
                        text,
                        None,
                        Visibility::Advanced
                    ))
                    .unwrap(),
                PublishOutcome::Buffered
            );
        }
        publisher.publish(LifecycleEvent::content("done", None)).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_kind, EventKind::Thinking);
        assert_eq!(first.payload["display_summary"], "step 1\nstep 2\nstep 3");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.event_kind, EventKind::Content);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_reported() {
        let (mut publisher, rx) = EventPublisher::channel(Visibility::Advanced);
        drop(rx);
        assert_eq!(
            publisher.publish(LifecycleEvent::content("x", None)),
            Err(PublishError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_watch_disconnect_cancels() {
        let (publisher, rx) = EventPublisher::channel(Visibility::Advanced);
        let cancel = CancellationToken::new();
        let handle = publisher.watch_disconnect(cancel.clone());
        drop(rx);
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
    }
}
