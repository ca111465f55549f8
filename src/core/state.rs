//! 回合状态机
//!
//! `Classifying → Delegated → Streaming → Terminal`，或 `Classifying → Rejected`。
//! Terminal 与 Rejected 为吸收态；失败回合从任意非吸收态进入 Terminal。

use serde::Serialize;

/// 单个回合的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Classifying,
    Delegated,
    Streaming,
    Terminal,
    Rejected,
}

impl TurnPhase {
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TurnPhase::Terminal | TurnPhase::Rejected)
    }

    /// 合法转移
    pub fn can_transition(&self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        match (self, next) {
            (Classifying, Delegated) | (Classifying, Rejected) => true,
            (Delegated, Streaming) => true,
            (Streaming, Terminal) => true,
            // 失败路径：路由或推理不可用、取消
            (Classifying, Terminal) | (Delegated, Terminal) => true,
            _ => false,
        }
    }
}

/// 非法状态转移
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal turn transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: TurnPhase,
    pub to: TurnPhase,
}

/// 回合状态：当前阶段 + 转移轨迹
#[derive(Clone, Debug)]
pub struct TurnState {
    phase: TurnPhase,
    trail: Vec<TurnPhase>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            phase: TurnPhase::Classifying,
            trail: vec![TurnPhase::Classifying],
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn trail(&self) -> &[TurnPhase] {
        &self.trail
    }

    pub fn advance(&mut self, next: TurnPhase) -> Result<(), IllegalTransition> {
        if !self.phase.can_transition(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = ?self.phase, to = ?next, "turn transition");
        self.phase = next;
        self.trail.push(next);
        Ok(())
    }
}
