//! 会话监管：回合生命周期与取消
//!
//! 每个进行中的回合持有一个子 CancellationToken；客户端断开或服务关闭时取消，
//! 推理调用被丢弃（尽力而为），沙箱子进程被强制终止。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 回合级取消管理：根 token + 按 turn_id 登记的子 token
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    /// 服务关闭时触发，级联取消全部回合
    root: CancellationToken,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 为回合登记子 token；回合结束后须调用 finish
    pub fn begin(&self, turn_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        if let Ok(mut active) = self.active.lock() {
            active.insert(turn_id.to_string(), token.clone());
        }
        token
    }

    pub fn finish(&self, turn_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(turn_id);
        }
    }

    /// 取消单个回合；回合不存在时返回 false
    pub fn cancel(&self, turn_id: &str) -> bool {
        let token = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(turn_id).cloned());
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部回合（服务关闭）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn active_turns(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_turn() {
        let sup = SessionSupervisor::new();
        let a = sup.begin("a");
        let b = sup.begin("b");
        assert!(sup.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        sup.finish("a");
        assert!(!sup.cancel("a"));
        assert_eq!(sup.active_turns(), 1);
    }

    #[test]
    fn test_shutdown_cascades() {
        let sup = SessionSupervisor::new();
        let a = sup.begin("a");
        sup.shutdown();
        assert!(a.is_cancelled());
    }
}
