//! Datastore capability and its SQLite implementation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::models::{clamp_score, normalize_tags, AnalysisResult, JournalEntry, Mood, NewEntry, Sentiment, UserProfile};
use crate::settings::PolicySettings;
use crate::stats::TrendMode;
use crate::timefmt::{parse_ts, storage_ts};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("entry {0} not found")]
    EntryNotFound(i64),
}

#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn insert_entry(&self, entry: NewEntry, analysis: Option<&AnalysisResult>) -> Result<JournalEntry, StoreError>;

    async fn get_entry(&self, id: i64) -> Result<Option<JournalEntry>, StoreError>;

    async fn update_analysis(&self, id: i64, analysis: &AnalysisResult) -> Result<(), StoreError>;

    /// Entries with `start <= created_at < end`, oldest first.
    async fn entries_between(
        &self,
        user_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<JournalEntry>, StoreError>;

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<JournalEntry>, StoreError>;

    /// Most recent entry strictly before `before`.
    async fn last_entry_before(&self, user_id: &str, before: OffsetDateTime) -> Result<Option<JournalEntry>, StoreError>;

    async fn last_entry_at(&self, user_id: &str) -> Result<Option<OffsetDateTime>, StoreError>;

    async fn active_users(&self) -> Result<Vec<UserProfile>, StoreError>;

    async fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError>;

    async fn push_token_for(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    /// Returns whether a token was actually removed.
    async fn clear_push_token(&self, user_id: &str) -> Result<bool, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn load_or_init_settings(&self, defaults: PolicySettings) -> Result<PolicySettings, StoreError> {
        let conn = self.conn.lock().await;
        if let Some(settings) = load_app_settings(&conn)? {
            let fixed = settings.normalized();
            if fixed != settings {
                upsert_app_settings(&conn, fixed, &storage_ts(OffsetDateTime::now_utc()))?;
            }
            return Ok(fixed);
        }
        let fixed = defaults.normalized();
        upsert_app_settings(&conn, fixed, &storage_ts(OffsetDateTime::now_utc()))?;
        Ok(fixed)
    }

    pub async fn save_settings(&self, settings: PolicySettings) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        upsert_app_settings(&conn, settings, &storage_ts(OffsetDateTime::now_utc()))?;
        Ok(())
    }
}

#[async_trait]
impl EntryStore for SqliteStore {
    async fn insert_entry(&self, entry: NewEntry, analysis: Option<&AnalysisResult>) -> Result<JournalEntry, StoreError> {
        let mut stored = JournalEntry {
            id: 0,
            user_id: entry.user_id,
            content: entry.content,
            created_at: entry.created_at,
            mood: None,
            sentiment: None,
            sentiment_score: None,
            emotions: Vec::new(),
            insight: None,
            tags: normalize_tags(&entry.tags),
        };
        if let Some(a) = analysis {
            stored.apply_analysis(a);
        }
        let conn = self.conn.lock().await;
        stored.id = insert_entry(&conn, &stored)?;
        Ok(stored)
    }

    async fn get_entry(&self, id: i64) -> Result<Option<JournalEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
        let entry = conn.query_row(&sql, [id], entry_from_row).optional()?;
        Ok(entry)
    }

    async fn update_analysis(&self, id: i64, analysis: &AnalysisResult) -> Result<(), StoreError> {
        let emotions_json = serde_json::to_string(&analysis.emotions).unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE entries SET mood = ?1, sentiment = ?2, sentiment_score = ?3, emotions_json = ?4, insight = ?5 WHERE id = ?6",
            (
                analysis.mood.as_str(),
                analysis.sentiment.as_str(),
                clamp_score(analysis.sentiment_score),
                emotions_json,
                &analysis.insight,
                id,
            ),
        )?;
        if changed == 0 {
            return Err(StoreError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn entries_between(
        &self,
        user_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3 ORDER BY created_at ASC, id ASC"
        );
        Ok(query_entries(&conn, &sql, (user_id, storage_ts(start), storage_ts(end)))?)
    }

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<JournalEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ?1 ORDER BY created_at ASC, id ASC");
        Ok(query_entries(&conn, &sql, [user_id])?)
    }

    async fn last_entry_before(&self, user_id: &str, before: OffsetDateTime) -> Result<Option<JournalEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ?1 AND created_at < ?2 ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let entry = conn
            .query_row(&sql, (user_id, storage_ts(before)), entry_from_row)
            .optional()?;
        Ok(entry)
    }

    async fn last_entry_at(&self, user_id: &str) -> Result<Option<OffsetDateTime>, StoreError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM entries WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(raw.as_deref().and_then(parse_ts))
    }

    async fn active_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, active, notifications_enabled, push_token FROM users WHERE active = 1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let active: i64 = row.get(1)?;
            let enabled: i64 = row.get(2)?;
            Ok(UserProfile {
                id: row.get(0)?,
                active: active != 0,
                notifications_enabled: enabled != 0,
                push_token: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        let now = storage_ts(OffsetDateTime::now_utc());
        let token = user
            .push_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO users (id, active, notifications_enabled, push_token, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT(id) DO UPDATE SET
  active=excluded.active,
  notifications_enabled=excluded.notifications_enabled,
  push_token=excluded.push_token,
  updated_at=excluded.updated_at
"#,
            (
                &user.id,
                user.active as i64,
                user.notifications_enabled as i64,
                token,
                now,
            ),
        )?;
        Ok(())
    }

    async fn push_token_for(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let token: Option<Option<String>> = conn
            .query_row("SELECT push_token FROM users WHERE id = ?1", [user_id], |row| row.get(0))
            .optional()?;
        Ok(token.flatten().filter(|t| !t.trim().is_empty()))
    }

    async fn clear_push_token(&self, user_id: &str) -> Result<bool, StoreError> {
        let now = storage_ts(OffsetDateTime::now_utc());
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE users SET push_token = NULL, updated_at = ?2 WHERE id = ?1 AND push_token IS NOT NULL",
            (user_id, now),
        )?;
        Ok(changed > 0)
    }
}

const ENTRY_COLUMNS: &str =
    "id, user_id, content, created_at, mood, sentiment, sentiment_score, emotions_json, insight, tags_json";

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  active INTEGER NOT NULL DEFAULT 1,
  notifications_enabled INTEGER NOT NULL DEFAULT 0,
  push_token TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_active ON users(active);

CREATE TABLE IF NOT EXISTS entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  mood TEXT,
  sentiment TEXT,
  sentiment_score REAL,
  emotions_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_entries_user_created ON entries(user_id, created_at);

CREATE TABLE IF NOT EXISTS app_settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  inactivity_threshold_days REAL NOT NULL,
  stats_window_days INTEGER NOT NULL,
  dispatch_concurrency INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )?;
    ensure_entries_columns(conn)?;
    ensure_app_settings_columns(conn)?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut cols = HashSet::new();
    for r in rows {
        cols.insert(r?);
    }
    Ok(cols)
}

fn ensure_entries_columns(conn: &Connection) -> rusqlite::Result<()> {
    let cols = table_columns(conn, "entries")?;
    if !cols.contains("insight") {
        conn.execute("ALTER TABLE entries ADD COLUMN insight TEXT", [])?;
    }
    if !cols.contains("tags_json") {
        conn.execute("ALTER TABLE entries ADD COLUMN tags_json TEXT", [])?;
    }
    Ok(())
}

fn ensure_app_settings_columns(conn: &Connection) -> rusqlite::Result<()> {
    let cols = table_columns(conn, "app_settings")?;
    if !cols.contains("clear_invalid_tokens") {
        conn.execute(
            "ALTER TABLE app_settings ADD COLUMN clear_invalid_tokens INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !cols.contains("trend_mode") {
        conn.execute(
            "ALTER TABLE app_settings ADD COLUMN trend_mode TEXT NOT NULL DEFAULT 'previous_period'",
            [],
        )?;
    }
    Ok(())
}

fn load_app_settings(conn: &Connection) -> rusqlite::Result<Option<PolicySettings>> {
    conn.query_row(
        "SELECT inactivity_threshold_days, stats_window_days, dispatch_concurrency, clear_invalid_tokens, trend_mode FROM app_settings WHERE id = 1",
        [],
        |row| {
            let clear: i64 = row.get(3)?;
            let trend: String = row.get(4)?;
            Ok(PolicySettings {
                inactivity_threshold_days: row.get(0)?,
                stats_window_days: row.get(1)?,
                dispatch_concurrency: row.get(2)?,
                clear_invalid_tokens: clear != 0,
                trend_mode: TrendMode::parse(&trend).unwrap_or_default(),
            })
        },
    )
    .optional()
}

fn upsert_app_settings(conn: &Connection, settings: PolicySettings, updated_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO app_settings (id, inactivity_threshold_days, stats_window_days, dispatch_concurrency, clear_invalid_tokens, trend_mode, updated_at)
VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(id) DO UPDATE SET
  inactivity_threshold_days=excluded.inactivity_threshold_days,
  stats_window_days=excluded.stats_window_days,
  dispatch_concurrency=excluded.dispatch_concurrency,
  clear_invalid_tokens=excluded.clear_invalid_tokens,
  trend_mode=excluded.trend_mode,
  updated_at=excluded.updated_at
        "#,
        (
            settings.inactivity_threshold_days,
            settings.stats_window_days,
            settings.dispatch_concurrency,
            settings.clear_invalid_tokens as i64,
            settings.trend_mode.as_str(),
            updated_at,
        ),
    )?;
    Ok(())
}

fn insert_entry(conn: &Connection, e: &JournalEntry) -> rusqlite::Result<i64> {
    let emotions_json = serde_json::to_string(&e.emotions).unwrap_or_else(|_| "[]".to_string());
    let tags_json = serde_json::to_string(&e.tags).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        r#"
INSERT INTO entries (user_id, content, created_at, mood, sentiment, sentiment_score, emotions_json, insight, tags_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
        (
            &e.user_id,
            &e.content,
            storage_ts(e.created_at),
            e.mood.map(Mood::as_str),
            e.sentiment.map(Sentiment::as_str),
            e.sentiment_score,
            emotions_json,
            e.insight.as_deref(),
            tags_json,
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

fn query_entries<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Vec<JournalEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, entry_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let ts_s: String = row.get(3)?;
    let created_at = parse_ts(&ts_s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(std::fmt::Error))
    })?;
    let mood: Option<String> = row.get(4)?;
    let sentiment: Option<String> = row.get(5)?;
    let emotions_json: Option<String> = row.get(7)?;
    let tags_json: Option<String> = row.get(9)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        created_at,
        mood: mood.as_deref().and_then(Mood::parse),
        sentiment: sentiment.as_deref().and_then(Sentiment::parse),
        sentiment_score: row.get(6)?,
        emotions: emotions_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        insight: row.get(8)?,
        tags: tags_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}
