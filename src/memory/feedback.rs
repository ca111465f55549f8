//! 反馈存储：全局经验（Lesson）与用户偏好（Preference）
//!
//! 回合开始委派时读取一次快照（已批准的全局经验 + 当前用户偏好），回合内不再读写；
//! 唯一的写入路径是 submit_lesson（状态 pending，需管理员 approve 后才进入快照）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("feedback store error: {0}")]
    Storage(String),
    #[error("lesson {0} not found")]
    NotFound(String),
}

impl From<rusqlite::Error> for FeedbackError {
    fn from(e: rusqlite::Error) -> Self {
        FeedbackError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Pending,
    Approved,
}

impl LessonStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Pending => "pending",
            LessonStatus::Approved => "approved",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "approved" {
            LessonStatus::Approved
        } else {
            LessonStatus::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub text: String,
    pub category: Option<String>,
    pub submitted_by: Option<String>,
    pub status: LessonStatus,
    pub created_at: DateTime<Utc>,
}

/// 提交内容
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LessonSubmission {
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub submitted_by: Option<String>,
}

impl LessonSubmission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

fn lesson_id(now: DateTime<Utc>) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("GS-{}-{}", now.format("%Y%m%d%H%M%S"), &raw[..6])
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// 已批准的全局经验（按提交顺序）
    async fn approved_global_lessons(&self) -> Result<Vec<String>, FeedbackError>;

    /// 用户偏好（按记录顺序）
    async fn user_preferences(&self, user_id: &str) -> Result<Vec<String>, FeedbackError>;

    /// 提交全局经验，返回 pending 状态的记录
    async fn submit_lesson(&self, submission: LessonSubmission) -> Result<Lesson, FeedbackError>;
}

/// 回合开始时的只读快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackSnapshot {
    pub lessons: Vec<String>,
    pub preferences: Vec<String>,
}

impl FeedbackSnapshot {
    /// 读取快照；存储错误降级为空列表
    pub async fn fetch(store: &dyn FeedbackStore, user_id: &str) -> Self {
        let lessons = store.approved_global_lessons().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load approved lessons, continuing without them");
            Vec::new()
        });
        let preferences = store.user_preferences(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, user_id, "failed to load user preferences, continuing without them");
            Vec::new()
        });
        Self { lessons, preferences }
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty() && self.preferences.is_empty()
    }

    /// 追加到 Specialist 角色提示末尾的段落
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.lessons.is_empty() {
            out.push_str("\n\n## Approved global guidelines\n");
            for l in &self.lessons {
                out.push_str("- ");
                out.push_str(l);
                out.push('\n');
            }
        }
        if !self.preferences.is_empty() {
            out.push_str("\n\n## This user's preferences\n");
            for p in &self.preferences {
                out.push_str("- ");
                out.push_str(p);
                out.push('\n');
            }
        }
        out
    }
}

/// 内存实现
#[derive(Debug, Default)]
pub struct InMemoryFeedbackStore {
    lessons: Mutex<Vec<Lesson>>,
    preferences: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve_lesson(&self, id: &str) -> Result<(), FeedbackError> {
        let mut lessons = self
            .lessons
            .lock()
            .map_err(|e| FeedbackError::Storage(e.to_string()))?;
        let lesson = lessons
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| FeedbackError::NotFound(id.to_string()))?;
        lesson.status = LessonStatus::Approved;
        Ok(())
    }

    pub fn add_preference(&self, user_id: &str, text: impl Into<String>) -> Result<(), FeedbackError> {
        self.preferences
            .lock()
            .map_err(|e| FeedbackError::Storage(e.to_string()))?
            .entry(user_id.to_string())
            .or_default()
            .push(text.into());
        Ok(())
    }

    pub fn lessons(&self) -> Vec<Lesson> {
        self.lessons.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn approved_global_lessons(&self) -> Result<Vec<String>, FeedbackError> {
        let lessons = self
            .lessons
            .lock()
            .map_err(|e| FeedbackError::Storage(e.to_string()))?;
        Ok(lessons
            .iter()
            .filter(|l| l.status == LessonStatus::Approved)
            .map(|l| l.text.clone())
            .collect())
    }

    async fn user_preferences(&self, user_id: &str) -> Result<Vec<String>, FeedbackError> {
        let prefs = self
            .preferences
            .lock()
            .map_err(|e| FeedbackError::Storage(e.to_string()))?;
        Ok(prefs.get(user_id).cloned().unwrap_or_default())
    }

    async fn submit_lesson(&self, submission: LessonSubmission) -> Result<Lesson, FeedbackError> {
        let now = Utc::now();
        let lesson = Lesson {
            id: lesson_id(now),
            text: submission.text,
            category: submission.category,
            submitted_by: submission.submitted_by,
            status: LessonStatus::Pending,
            created_at: now,
        };
        self.lessons
            .lock()
            .map_err(|e| FeedbackError::Storage(e.to_string()))?
            .push(lesson.clone());
        Ok(lesson)
    }
}

/// SQLite 实现：阻塞调用放到 spawn_blocking
pub struct SqliteFeedbackStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lessons (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    text TEXT NOT NULL,
    category TEXT,
    submitted_by TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS preferences (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    text TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_preferences_user ON preferences(user_id, seq);
";

impl SqliteFeedbackStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FeedbackError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| FeedbackError::Storage(e.to_string()))?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, FeedbackError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, FeedbackError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, FeedbackError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, FeedbackError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| FeedbackError::Storage(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| FeedbackError::Storage(format!("task join error: {e}")))?
    }

    /// 管理员路径：批准一条 pending 经验
    pub async fn approve_lesson(&self, id: &str) -> Result<(), FeedbackError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE lessons SET status = ?1 WHERE id = ?2",
                params![LessonStatus::Approved.as_str(), id],
            )?;
            if n == 0 {
                return Err(FeedbackError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    pub async fn add_preference(&self, user_id: &str, text: &str) -> Result<(), FeedbackError> {
        let (user_id, text) = (user_id.to_string(), text.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO preferences (user_id, text) VALUES (?1, ?2)",
                params![user_id, text],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn lesson(&self, id: &str) -> Result<Option<Lesson>, FeedbackError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, text, category, submitted_by, status, created_at FROM lessons WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.map(|(id, text, category, submitted_by, status, created_at)| Lesson {
                id,
                text,
                category,
                submitted_by,
                status: LessonStatus::parse(&status),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        })
        .await
    }
}

#[async_trait]
impl FeedbackStore for SqliteFeedbackStore {
    async fn approved_global_lessons(&self) -> Result<Vec<String>, FeedbackError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT text FROM lessons WHERE status = ?1 ORDER BY seq")?;
            let rows = stmt.query_map(params![LessonStatus::Approved.as_str()], |r| r.get::<_, String>(0))?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    async fn user_preferences(&self, user_id: &str) -> Result<Vec<String>, FeedbackError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT text FROM preferences WHERE user_id = ?1 ORDER BY seq")?;
            let rows = stmt.query_map(params![user_id], |r| r.get::<_, String>(0))?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    async fn submit_lesson(&self, submission: LessonSubmission) -> Result<Lesson, FeedbackError> {
        let now = Utc::now();
        let lesson = Lesson {
            id: lesson_id(now),
            text: submission.text,
            category: submission.category,
            submitted_by: submission.submitted_by,
            status: LessonStatus::Pending,
            created_at: now,
        };
        let row = lesson.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO lessons (id, text, category, submitted_by, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.text,
                    row.category,
                    row.submitted_by,
                    row.status.as_str(),
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        tracing::info!(lesson_id = %lesson.id, "lesson submitted for review");
        Ok(lesson)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_lessons_not_in_snapshot() {
        let store = InMemoryFeedbackStore::new();
        let lesson = store
            .submit_lesson(LessonSubmission::new("Always cite pLDDT scores"))
            .await
            .unwrap();
        assert_eq!(lesson.status, LessonStatus::Pending);
        assert!(lesson.id.starts_with("GS-"));
        assert!(FeedbackSnapshot::fetch(&store, "u1").await.is_empty());

        store.approve_lesson(&lesson.id).unwrap();
        store.add_preference("u1", "Brief answers").unwrap();
        let snap = FeedbackSnapshot::fetch(&store, "u1").await;
        assert_eq!(snap.lessons, vec!["Always cite pLDDT scores".to_string()]);
        assert_eq!(snap.preferences, vec!["Brief answers".to_string()]);
        assert!(snap.render().contains("- Brief answers"));
        assert!(FeedbackSnapshot::fetch(&store, "u2").await.preferences.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.db");
        let id = {
            let store = SqliteFeedbackStore::open(&path).unwrap();
            let lesson = store
                .submit_lesson(LessonSubmission::new("Mention conservation"))
                .await
                .unwrap();
            store.add_preference("u1", "Expert depth").await.unwrap();
            lesson.id
        };

        let store = SqliteFeedbackStore::open(&path).unwrap();
        assert!(store.approved_global_lessons().await.unwrap().is_empty());
        store.approve_lesson(&id).await.unwrap();
        assert_eq!(
            store.approved_global_lessons().await.unwrap(),
            vec!["Mention conservation".to_string()]
        );
        assert_eq!(store.user_preferences("u1").await.unwrap(), vec!["Expert depth".to_string()]);
        assert_eq!(store.lesson(&id).await.unwrap().unwrap().status, LessonStatus::Approved);
        assert!(matches!(
            store.approve_lesson("GS-missing").await,
            Err(FeedbackError::NotFound(_))
        ));
    }
}
