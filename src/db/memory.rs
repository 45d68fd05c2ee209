use std::sync::RwLock;

use super::models::{LogEntry, Session};
use super::{DbResult, Repository};
use crate::error::DbError;
use crate::rules::Rule;

/// Repository that lives only as long as the process. Uses the
/// read-modify-write defaults of [`Repository`] for everything but the
/// six collection methods.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rules: RwLock<Vec<Rule>>,
    sessions: RwLock<Vec<Session>>,
    entries: RwLock<Vec<LogEntry>>,
    /// When set, every log write fails (exercises logger fallbacks).
    fail_log_writes: RwLock<bool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            ..Default::default()
        }
    }

    pub fn set_fail_log_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_log_writes.write() {
            *flag = fail;
        }
    }

    fn log_writes_fail(&self) -> bool {
        self.fail_log_writes.read().map(|f| *f).unwrap_or(false)
    }
}

impl Repository for MemoryRepository {
    fn load_rules(&self) -> DbResult<Vec<Rule>> {
        Ok(self.rules.read().map_err(|_| DbError::Poisoned)?.clone())
    }

    fn save_rules(&self, rules: &[Rule]) -> DbResult<()> {
        *self.rules.write().map_err(|_| DbError::Poisoned)? = rules.to_vec();
        Ok(())
    }

    fn load_sessions(&self) -> DbResult<Vec<Session>> {
        Ok(self.sessions.read().map_err(|_| DbError::Poisoned)?.clone())
    }

    fn save_sessions(&self, sessions: &[Session]) -> DbResult<()> {
        if self.log_writes_fail() {
            return Err(DbError::Io(std::io::Error::other("log store unreachable")));
        }
        *self.sessions.write().map_err(|_| DbError::Poisoned)? = sessions.to_vec();
        Ok(())
    }

    fn load_log_entries(&self) -> DbResult<Vec<LogEntry>> {
        Ok(self.entries.read().map_err(|_| DbError::Poisoned)?.clone())
    }

    fn save_log_entries(&self, entries: &[LogEntry]) -> DbResult<()> {
        if self.log_writes_fail() {
            return Err(DbError::Io(std::io::Error::other("log store unreachable")));
        }
        *self.entries.write().map_err(|_| DbError::Poisoned)? = entries.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EntryStatus, EventType, LogLevel, RetentionPolicy, SessionEvent};
    use chrono::Utc;

    #[test]
    fn default_append_creates_session() {
        let repo = MemoryRepository::new();
        let event = SessionEvent {
            event_type: EventType::Start,
            message: "go".into(),
            timestamp: Utc::now(),
        };
        repo.append_session_event("s1", &event).unwrap();
        repo.append_session_event("s1", &event).unwrap();
        let sessions = repo.load_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].events.len(), 2);
    }

    #[test]
    fn default_prune_keeps_newest_sessions() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let sessions: Vec<Session> = (0..4)
            .map(|i| Session {
                session_id: format!("s{}", i),
                started_at: now - chrono::Duration::minutes(10 - i),
                events: Vec::new(),
            })
            .collect();
        repo.save_sessions(&sessions).unwrap();
        repo.append_log_entry(&LogEntry::new("s0", "r", LogLevel::Info, EntryStatus::Start, "x"))
            .unwrap();

        let report = repo
            .prune(
                &RetentionPolicy {
                    max_entries: 0,
                    max_sessions: 2,
                    max_age_days: 0,
                },
                now,
            )
            .unwrap();
        assert_eq!(report.sessions_removed, 2);
        assert_eq!(report.entries_removed, 0);
        let ids: Vec<String> = repo
            .load_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[test]
    fn failing_log_writes_surface_errors() {
        let repo = MemoryRepository::new();
        repo.set_fail_log_writes(true);
        let entry = LogEntry::new("s", "r", LogLevel::Info, EntryStatus::Start, "x");
        assert!(repo.append_log_entry(&entry).is_err());
    }
}
