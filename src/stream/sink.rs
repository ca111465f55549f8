//! 回合事件汇：发布（按可见性过滤）+ 完整事件日志（写入 Turn 记录）

use crate::react::events::LifecycleEvent;
use crate::stream::{EventPublisher, PublishError};

pub struct TurnEvents {
    publisher: EventPublisher,
    log: Vec<LifecycleEvent>,
    disconnected: bool,
}

impl TurnEvents {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            log: Vec::new(),
            disconnected: false,
        }
    }

    /// 记录并发布；客户端断开后只记录
    pub fn emit(&mut self, event: LifecycleEvent) {
        if !self.disconnected {
            match self.publisher.publish(event.clone()) {
                Ok(_) => {}
                Err(PublishError::Disconnected) => {
                    tracing::debug!("stream consumer gone, events are recorded only");
                    self.disconnected = true;
                }
                Err(PublishError::Closed) => {
                    tracing::warn!(event_id = %event.event_id, "event after terminal meta dropped");
                    return;
                }
            }
        }
        self.log.push(event);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn log(&self) -> &[LifecycleEvent] {
        &self.log
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn into_log(self) -> Vec<LifecycleEvent> {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Visibility;

    #[test]
    fn test_records_suppressed_and_post_disconnect_events() {
        let (publisher, rx) = EventPublisher::channel(Visibility::Minimal);
        let mut events = TurnEvents::new(publisher);
        events.emit(LifecycleEvent::routing("discovery", 0.8, "gene"));
        drop(rx);
        events.emit(LifecycleEvent::content("answer", None));
        assert!(events.is_disconnected());
        events.emit(LifecycleEvent::end(false, None));
        assert_eq!(events.log().len(), 3);
    }
}
