//! SQLite-backed persistence for conversations, progress, and usage.
//!
//! The core only talks to the [`ConversationStore`] trait; this module also
//! provides the production implementation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::progress::{ConversationProgress, ObjectiveMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
}

impl ConversationStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" => ConversationStatus::Completed,
            _ => ConversationStatus::Active,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConversationStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub user_id: String,
    pub agent_template: String,
    pub started_at: DateTime<Utc>,
    pub status: ConversationStatus,
}

/// Everything the finalizer computes, persisted in one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedFields {
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub clean_transcript: String,
    pub completion_percentage: u8,
    pub user_word_count: u32,
    pub summary: String,
    pub status: ConversationStatus,
}

/// Persistence collaborator. Conversation row ownership beyond these fields
/// (auth, listing, deletion) lives outside the core.
pub trait ConversationStore: Send + Sync {
    /// Create the conversation row if it does not exist yet.
    fn create_conversation(&self, meta: &ConversationMeta) -> Result<()>;
    fn load_meta(&self, conversation_id: &str) -> Result<Option<ConversationMeta>>;
    fn load_progress(&self, conversation_id: &str) -> Result<Option<ConversationProgress>>;
    fn save_progress(&self, conversation_id: &str, progress: &ConversationProgress) -> Result<()>;
    fn load_finalized(&self, conversation_id: &str) -> Result<Option<FinalizedFields>>;
    fn save_finalized(&self, conversation_id: &str, fields: &FinalizedFields) -> Result<()>;
    fn increment_usage(&self, user_id: &str) -> Result<()>;
    fn usage_count(&self, user_id: &str) -> Result<u64>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                agent_template TEXT NOT NULL,
                started_at TEXT NOT NULL,
                status TEXT NOT NULL,
                ended_at TEXT,
                duration_minutes INTEGER,
                clean_transcript TEXT,
                completion_percentage INTEGER,
                user_word_count INTEGER,
                summary TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversation_progress (
                conversation_id TEXT PRIMARY KEY,
                objectives_json TEXT NOT NULL,
                revision INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS usage_counters (
                user_id TEXT PRIMARY KEY,
                completed_interviews INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)",
            [],
        )?;

        Ok(())
    }
}

impl ConversationStore for SqliteStore {
    fn create_conversation(&self, meta: &ConversationMeta) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, user_id, agent_template, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                meta.id,
                meta.user_id,
                meta.agent_template,
                meta.started_at.to_rfc3339(),
                meta.status.as_db_str(),
            ],
        )?;
        Ok(())
    }

    fn load_meta(&self, conversation_id: &str) -> Result<Option<ConversationMeta>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, agent_template, started_at, status
             FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        );

        match result {
            Ok((id, user_id, agent_template, started_at, status)) => {
                let started_at: DateTime<Utc> = started_at
                    .parse()
                    .context("Failed to parse conversation start time")?;
                Ok(Some(ConversationMeta {
                    id,
                    user_id,
                    agent_template,
                    started_at,
                    status: ConversationStatus::from_db(&status),
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_progress(&self, conversation_id: &str) -> Result<Option<ConversationProgress>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT objectives_json, revision FROM conversation_progress WHERE conversation_id = ?1",
            [conversation_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        );

        match result {
            Ok((objectives_json, revision)) => {
                let objectives: ObjectiveMap = serde_json::from_str(&objectives_json)
                    .context("Failed to parse stored objectives")?;
                Ok(Some(ConversationProgress {
                    objectives,
                    revision: revision.max(0) as u64,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_progress(&self, conversation_id: &str, progress: &ConversationProgress) -> Result<()> {
        let conn = self.lock_conn()?;
        let objectives_json = serde_json::to_string(&progress.objectives)
            .context("Failed to serialize objectives")?;
        conn.execute(
            "INSERT OR REPLACE INTO conversation_progress
             (conversation_id, objectives_json, revision, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation_id,
                objectives_json,
                progress.revision as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_finalized(&self, conversation_id: &str) -> Result<Option<FinalizedFields>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT ended_at, duration_minutes, clean_transcript, completion_percentage,
                    user_word_count, summary, status
             FROM conversations WHERE id = ?1 AND ended_at IS NOT NULL",
            [conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        );

        match result {
            Ok((ended_at, duration_minutes, clean_transcript, pct, words, summary, status)) => {
                let ended_at: DateTime<Utc> = ended_at
                    .parse()
                    .context("Failed to parse conversation end time")?;
                Ok(Some(FinalizedFields {
                    ended_at,
                    duration_minutes,
                    clean_transcript,
                    completion_percentage: pct.clamp(0, 100) as u8,
                    user_word_count: words.max(0) as u32,
                    summary,
                    status: ConversationStatus::from_db(&status),
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_finalized(&self, conversation_id: &str, fields: &FinalizedFields) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE conversations SET
                ended_at = ?2,
                duration_minutes = ?3,
                clean_transcript = ?4,
                completion_percentage = ?5,
                user_word_count = ?6,
                summary = ?7,
                status = ?8
             WHERE id = ?1",
            params![
                conversation_id,
                fields.ended_at.to_rfc3339(),
                fields.duration_minutes,
                fields.clean_transcript,
                fields.completion_percentage as i64,
                fields.user_word_count as i64,
                fields.summary,
                fields.status.as_db_str(),
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Conversation {} does not exist", conversation_id);
        }
        Ok(())
    }

    fn increment_usage(&self, user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO usage_counters (user_id, completed_interviews) VALUES (?1, 1)
             ON CONFLICT(user_id) DO UPDATE SET completed_interviews = completed_interviews + 1",
            [user_id],
        )?;
        Ok(())
    }

    fn usage_count(&self, user_id: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT completed_interviews FROM usage_counters WHERE user_id = ?1",
            [user_id],
            |row| row.get::<_, i64>(0),
        );

        match result {
            Ok(count) => Ok(count.max(0) as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::default_objectives;

    fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn meta(id: &str) -> ConversationMeta {
        ConversationMeta {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            agent_template: "general".to_string(),
            started_at: Utc::now(),
            status: ConversationStatus::Active,
        }
    }

    #[test]
    fn conversation_round_trip() {
        let (store, _dir) = store();
        store.create_conversation(&meta("conv-1")).unwrap();

        let loaded = store.load_meta("conv-1").unwrap().unwrap();
        assert_eq!(loaded.user_id, "user-1");
        assert_eq!(loaded.status, ConversationStatus::Active);
        assert!(store.load_meta("missing").unwrap().is_none());
    }

    #[test]
    fn create_conversation_is_idempotent() {
        let (store, _dir) = store();
        let first = meta("conv-1");
        store.create_conversation(&first).unwrap();
        let mut second = meta("conv-1");
        second.user_id = "someone-else".to_string();
        store.create_conversation(&second).unwrap();

        let loaded = store.load_meta("conv-1").unwrap().unwrap();
        assert_eq!(loaded.user_id, "user-1");
    }

    #[test]
    fn progress_round_trip() {
        let (store, _dir) = store();
        let progress = ConversationProgress {
            objectives: default_objectives(),
            revision: 3,
        };
        store.save_progress("conv-1", &progress).unwrap();

        let loaded = store.load_progress("conv-1").unwrap().unwrap();
        assert_eq!(loaded, progress);
        assert!(store.load_progress("missing").unwrap().is_none());
    }

    #[test]
    fn finalized_fields_round_trip() {
        let (store, _dir) = store();
        store.create_conversation(&meta("conv-1")).unwrap();

        let fields = FinalizedFields {
            ended_at: Utc::now(),
            duration_minutes: 12,
            clean_transcript: "Interviewer: Hello\nCandidate: Hi".to_string(),
            completion_percentage: 80,
            user_word_count: 42,
            summary: "Went well.".to_string(),
            status: ConversationStatus::Completed,
        };
        store.save_finalized("conv-1", &fields).unwrap();

        let loaded = store.load_finalized("conv-1").unwrap().unwrap();
        assert_eq!(loaded.duration_minutes, 12);
        assert_eq!(loaded.completion_percentage, 80);
        assert_eq!(loaded.status, ConversationStatus::Completed);

        let meta = store.load_meta("conv-1").unwrap().unwrap();
        assert!(meta.status.is_terminal());
    }

    #[test]
    fn finalizing_unknown_conversation_fails() {
        let (store, _dir) = store();
        let fields = FinalizedFields {
            ended_at: Utc::now(),
            duration_minutes: 0,
            clean_transcript: String::new(),
            completion_percentage: 0,
            user_word_count: 0,
            summary: String::new(),
            status: ConversationStatus::Completed,
        };
        assert!(store.save_finalized("missing", &fields).is_err());
    }

    #[test]
    fn usage_counter_increments() {
        let (store, _dir) = store();
        assert_eq!(store.usage_count("user-1").unwrap(), 0);
        store.increment_usage("user-1").unwrap();
        store.increment_usage("user-1").unwrap();
        assert_eq!(store.usage_count("user-1").unwrap(), 2);
        assert_eq!(store.usage_count("user-2").unwrap(), 0);
    }
}
