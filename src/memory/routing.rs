//! 会话状态：Conversation / Turn / RoutingContext
//!
//! 由 Orchestrator 独占写入。回合进行中只在本地累积，回合关闭时一次性追加提交；
//! 锁只在提交与快照时短暂持有，不跨越任何 await。
//!
//! 存储有界：每个会话只保留最近 `max_stored_turns` 个回合（路由记录与工具输出引用随之剪枝），
//! 会话数超过 `max_conversations` 时淘汰最久未更新的会话。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::TurnFailure;
use crate::memory::{ConversationMemory, Message};
use crate::react::events::LifecycleEvent;

/// 会话标识 `(user_id, thread_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub thread_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// 路由记录（每回合一条）
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRecord {
    pub turn_id: String,
    /// 委派的 Specialist 标签；off_topic / 澄清 / 失败时为 None
    pub agent: Option<String>,
    pub confidence: f32,
}

/// 回合内工具输出的引用（不保存载荷本身）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutputRef {
    pub turn_id: String,
    pub invocation_id: String,
    pub tool: String,
    pub shape: String,
}

/// 路由上下文：只追加，仅随回合剪枝一起丢弃
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingContext {
    records: Vec<RoutingRecord>,
    tool_outputs: Vec<ToolOutputRef>,
    last_active: Option<String>,
}

impl RoutingContext {
    /// 最近一次实际委派的 Specialist（不受剪枝影响）
    pub fn last_active_specialist(&self) -> Option<&str> {
        self.last_active.as_deref()
    }

    pub fn records(&self) -> &[RoutingRecord] {
        &self.records
    }

    pub fn tool_outputs(&self) -> &[ToolOutputRef] {
        &self.tool_outputs
    }

    pub fn tool_outputs_for(&self, turn_id: &str) -> impl Iterator<Item = &ToolOutputRef> {
        let turn_id = turn_id.to_string();
        self.tool_outputs.iter().filter(move |r| r.turn_id == turn_id)
    }

    fn append(&mut self, record: RoutingRecord, outputs: Vec<ToolOutputRef>) {
        if let Some(agent) = &record.agent {
            self.last_active = Some(agent.clone());
        }
        self.records.push(record);
        self.tool_outputs.extend(outputs);
    }

    fn drop_turns(&mut self, dropped: &HashSet<String>) {
        self.records.retain(|r| !dropped.contains(&r.turn_id));
        self.tool_outputs.retain(|r| !dropped.contains(&r.turn_id));
    }
}

/// 回合终结结果
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Answer { text: String, incomplete: bool },
    Failure(TurnFailure),
}

impl TurnOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TurnOutcome::Failure(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, TurnOutcome::Answer { incomplete: true, .. })
    }
}

/// 已关闭的回合：构造后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    turn_id: String,
    user_message: String,
    events: Vec<LifecycleEvent>,
    outcome: TurnOutcome,
    closed_at: DateTime<Utc>,
}

impl Turn {
    pub fn close(
        turn_id: impl Into<String>,
        user_message: impl Into<String>,
        events: Vec<LifecycleEvent>,
        outcome: TurnOutcome,
    ) -> Self {
        Self {
            turn_id: turn_id.into(),
            user_message: user_message.into(),
            events,
            outcome,
            closed_at: Utc::now(),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    pub fn outcome(&self) -> &TurnOutcome {
        &self.outcome
    }

    pub fn closed_at(&self) -> DateTime<Utc> {
        self.closed_at
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: ConversationKey,
    turns: Vec<Turn>,
    context: RoutingContext,
    history: ConversationMemory,
    updated_at: DateTime<Utc>,
    /// 提交序号，用于淘汰最久未更新的会话
    stamp: u64,
}

impl Conversation {
    fn new(key: ConversationKey, max_turns: usize) -> Self {
        Self {
            key,
            turns: Vec::new(),
            context: RoutingContext::default(),
            history: ConversationMemory::new(max_turns),
            updated_at: Utc::now(),
            stamp: 0,
        }
    }

    /// 只保留最近 max_turns 个回合
    fn prune(&mut self, max_turns: usize) {
        if self.turns.len() <= max_turns {
            return;
        }
        let overflow = self.turns.len() - max_turns;
        let dropped: HashSet<String> = self.turns.drain(..overflow).map(|t| t.turn_id).collect();
        self.context.drop_turns(&dropped);
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn context(&self) -> &RoutingContext {
        &self.context
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }
}

/// 回合开始时读取的会话视图
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub history: Vec<Message>,
    pub last_active_specialist: Option<String>,
    pub turn_count: usize,
}

/// 回合提交内容
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub turn: Turn,
    pub routing: RoutingRecord,
    pub tool_outputs: Vec<ToolOutputRef>,
}

/// 进程内会话存储
#[derive(Debug)]
pub struct ConversationStore {
    inner: RwLock<HashMap<ConversationKey, Conversation>>,
    max_history_turns: usize,
    max_stored_turns: usize,
    max_conversations: usize,
    clock: AtomicU64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConversationStore {
    pub fn new(max_history_turns: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_history_turns,
            max_stored_turns: 50,
            max_conversations: 1000,
            clock: AtomicU64::new(0),
        }
    }

    pub fn with_limits(mut self, max_stored_turns: usize, max_conversations: usize) -> Self {
        self.max_stored_turns = max_stored_turns.max(1);
        self.max_conversations = max_conversations.max(1);
        self
    }

    pub fn view(&self, key: &ConversationKey) -> ConversationView {
        let Ok(map) = self.inner.read() else {
            return ConversationView::default();
        };
        map.get(key)
            .map(|c| ConversationView {
                history: c.history.messages().to_vec(),
                last_active_specialist: c.context.last_active_specialist().map(str::to_string),
                turn_count: c.turns.len(),
            })
            .unwrap_or_default()
    }

    /// 追加一个已关闭的回合；失败回合不写入对话历史
    pub fn commit(&self, key: &ConversationKey, commit: TurnCommit) {
        let Ok(mut map) = self.inner.write() else {
            tracing::error!("conversation store lock poisoned, turn not recorded");
            return;
        };
        let conv = map
            .entry(key.clone())
            .or_insert_with(|| Conversation::new(key.clone(), self.max_history_turns));
        if let TurnOutcome::Answer { text, .. } = commit.turn.outcome() {
            conv.history.record_exchange(commit.turn.user_message(), text.clone());
        }
        conv.context.append(commit.routing, commit.tool_outputs);
        conv.turns.push(commit.turn);
        conv.prune(self.max_stored_turns);
        conv.updated_at = Utc::now();
        conv.stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        while map.len() > self.max_conversations {
            let Some(oldest) = map.values().min_by_key(|c| c.stamp).map(|c| c.key.clone()) else {
                break;
            };
            map.remove(&oldest);
            tracing::debug!(user = %oldest.user_id, thread = %oldest.thread_id, "evicted idle conversation");
        }
    }

    pub fn get(&self, key: &ConversationKey) -> Option<Conversation> {
        self.inner.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(turn_id: &str, agent: Option<&str>, outcome: TurnOutcome) -> TurnCommit {
        TurnCommit {
            turn: Turn::close(turn_id, format!("question {turn_id}"), Vec::new(), outcome),
            routing: RoutingRecord {
                turn_id: turn_id.to_string(),
                agent: agent.map(str::to_string),
                confidence: 0.9,
            },
            tool_outputs: vec![ToolOutputRef {
                turn_id: turn_id.to_string(),
                invocation_id: format!("inv-{turn_id}"),
                tool: "get_gene_dossier".to_string(),
                shape: "structured".to_string(),
            }],
        }
    }

    #[test]
    fn test_last_active_specialist_skips_undelegated_turns() {
        let store = ConversationStore::default();
        let key = ConversationKey::new("u1", "t1");
        assert_eq!(store.view(&key), ConversationView::default());

        store.commit(
            &key,
            commit("1", Some("structure"), TurnOutcome::Answer { text: "a".into(), incomplete: false }),
        );
        store.commit(
            &key,
            commit("2", None, TurnOutcome::Answer { text: "off topic".into(), incomplete: false }),
        );
        let view = store.view(&key);
        assert_eq!(view.last_active_specialist.as_deref(), Some("structure"));
        assert_eq!(view.turn_count, 2);
        assert_eq!(view.history.len(), 4);
    }

    #[test]
    fn test_stored_turns_are_capped_with_their_context() {
        let store = ConversationStore::new(10).with_limits(3, 10);
        let key = ConversationKey::new("u1", "t1");
        store.commit(
            &key,
            commit("1", Some("variant"), TurnOutcome::Answer { text: "a".into(), incomplete: false }),
        );
        for i in 2..=6 {
            let id = i.to_string();
            store.commit(&key, commit(&id, None, TurnOutcome::Answer { text: "b".into(), incomplete: false }));
        }
        let conv = store.get(&key).unwrap();
        let ids: Vec<&str> = conv.turns().iter().map(|t| t.turn_id()).collect();
        assert_eq!(ids, vec!["4", "5", "6"]);
        assert_eq!(conv.context().records().len(), 3);
        assert_eq!(conv.context().tool_outputs().len(), 3);
        assert_eq!(conv.context().tool_outputs_for("1").count(), 0);
        // 委派记录被剪掉后仍保留最近的 Specialist
        assert_eq!(store.view(&key).last_active_specialist.as_deref(), Some("variant"));
        assert_eq!(store.view(&key).turn_count, 3);
    }

    #[test]
    fn test_least_recently_updated_conversation_is_evicted() {
        let store = ConversationStore::new(10).with_limits(10, 2);
        let a = ConversationKey::new("u1", "a");
        let b = ConversationKey::new("u1", "b");
        let c = ConversationKey::new("u2", "c");
        let answer = || TurnOutcome::Answer { text: "x".into(), incomplete: false };
        store.commit(&a, commit("1", None, answer()));
        store.commit(&b, commit("2", None, answer()));
        store.commit(&a, commit("3", None, answer()));
        store.commit(&c, commit("4", None, answer()));

        assert_eq!(store.len(), 2);
        assert!(store.get(&b).is_none());
        assert_eq!(store.get(&a).unwrap().turns().len(), 2);
        assert!(store.get(&c).unwrap().updated_at() >= store.get(&a).unwrap().updated_at());
    }

    #[test]
    fn test_failed_turns_recorded_but_not_in_history() {
        let store = ConversationStore::default();
        let key = ConversationKey::new("u1", "t1");
        store.commit(
            &key,
            commit("1", Some("discovery"), TurnOutcome::Failure(TurnFailure::cancelled())),
        );
        let conv = store.get(&key).unwrap();
        assert_eq!(conv.turns().len(), 1);
        assert!(conv.turns()[0].outcome().is_failure());
        assert!(conv.history().is_empty());
        assert_eq!(conv.context().tool_outputs_for("1").count(), 1);
        assert!(store.get(&ConversationKey::new("u1", "other")).is_none());
    }
}
