use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::DbError;
use crate::rules::{Rule, RuleStatus};

pub type DbResult<T> = Result<T, DbError>;

/// Persistence for rules, sessions and the flat log.
///
/// The six load/save methods are the whole contract; the remaining methods
/// have read-modify-write defaults that a backend may replace with something
/// cheaper.
pub trait Repository: Send + Sync {
    fn load_rules(&self) -> DbResult<Vec<Rule>>;
    fn save_rules(&self, rules: &[Rule]) -> DbResult<()>;
    fn load_sessions(&self) -> DbResult<Vec<Session>>;
    fn save_sessions(&self, sessions: &[Session]) -> DbResult<()>;
    fn load_log_entries(&self) -> DbResult<Vec<LogEntry>>;
    fn save_log_entries(&self, entries: &[LogEntry]) -> DbResult<()>;

    /// Returns false when no rule has that id.
    fn update_rule_status(&self, rule_id: &str, status: &RuleStatus) -> DbResult<bool> {
        let mut rules = self.load_rules()?;
        let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) else {
            return Ok(false);
        };
        rule.status = status.clone();
        self.save_rules(&rules)?;
        Ok(true)
    }

    /// Append to the session's event list, creating the session if needed.
    fn append_session_event(&self, session_id: &str, event: &SessionEvent) -> DbResult<()> {
        let mut sessions = self.load_sessions()?;
        match sessions.iter_mut().find(|s| s.session_id == session_id) {
            Some(session) => session.events.push(event.clone()),
            None => sessions.push(Session {
                session_id: session_id.to_string(),
                started_at: event.timestamp,
                events: vec![event.clone()],
            }),
        }
        self.save_sessions(&sessions)
    }

    fn append_log_entry(&self, entry: &LogEntry) -> DbResult<()> {
        let mut entries = self.load_log_entries()?;
        entries.push(entry.clone());
        self.save_log_entries(&entries)
    }

    fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> DbResult<PruneReport> {
        let mut entries = self.load_log_entries()?;
        let mut sessions = self.load_sessions()?;
        let report = prune_collections(&mut entries, &mut sessions, policy, now);
        if report.entries_removed > 0 {
            self.save_log_entries(&entries)?;
        }
        if report.sessions_removed > 0 {
            self.save_sessions(&sessions)?;
        }
        Ok(report)
    }
}

/// Apply a retention policy to in-memory collections (oldest removed first).
pub fn prune_collections(
    entries: &mut Vec<LogEntry>,
    sessions: &mut Vec<Session>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> PruneReport {
    let entries_before = entries.len();
    let sessions_before = sessions.len();

    if policy.max_age_days > 0 {
        let cutoff = now - chrono::Duration::days(policy.max_age_days as i64);
        entries.retain(|e| e.timestamp >= cutoff);
        sessions.retain(|s| s.started_at >= cutoff);
    }

    entries.sort_by_key(|e| e.timestamp);
    if policy.max_entries > 0 && entries.len() > policy.max_entries {
        let excess = entries.len() - policy.max_entries;
        entries.drain(..excess);
    }

    sessions.sort_by_key(|s| s.started_at);
    if policy.max_sessions > 0 && sessions.len() > policy.max_sessions {
        let excess = sessions.len() - policy.max_sessions;
        sessions.drain(..excess);
    }

    PruneReport {
        entries_removed: entries_before - entries.len(),
        sessions_removed: sessions_before - sessions.len(),
    }
}

/// Sortable text form used for timestamp columns.
pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── SQLite backend ──────────────────────────────────────────

pub struct Database {
    pub conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn new(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.init_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        db.init_tables()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_tables(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rules (
                id          TEXT PRIMARY KEY,
                position    INTEGER NOT NULL,
                body        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id  TEXT PRIMARY KEY,
                started_at  TEXT NOT NULL,
                events      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                level       TEXT NOT NULL,
                rule_id     TEXT NOT NULL,
                status      TEXT NOT NULL,
                body        TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);
            CREATE INDEX IF NOT EXISTS idx_log_timestamp ON log_entries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_log_session ON log_entries(session_id);
            ",
        )?;
        Ok(())
    }
}

// ── Sub-modules ─────────────────────────────────────────────

mod activity;
mod memory;
mod models;
mod rules;
mod sessions;
mod storage;

// ── Re-exports ──────────────────────────────────────────────

pub use memory::MemoryRepository;
pub use models::{
    DbStats, EntryStatus, EventType, LogEntry, LogLevel, PruneReport, RetentionPolicy, Session,
    SessionEvent, TableStats, SESSION_RULE_ID,
};
