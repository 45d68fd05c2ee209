use chrono::{DateTime, Utc};

use super::models::{DbStats, LogEntry, PruneReport, RetentionPolicy, Session, SessionEvent, TableStats};
use super::{ts, Database, DbResult, Repository};
use crate::rules::{Rule, RuleStatus};

const TABLES: [&str; 3] = ["rules", "sessions", "log_entries"];

impl Database {
    /// On-disk size of the database file in bytes (0 for in-memory databases).
    pub fn get_db_file_size(&self) -> u64 {
        self.path()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn get_table_stats(&self) -> DbResult<Vec<TableStats>> {
        let conn = self.conn()?;
        let mut stats = Vec::new();
        for table in &TABLES {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table),
                [],
                |row| row.get(0),
            )?;
            stats.push(TableStats {
                table_name: table.to_string(),
                row_count: count as u64,
            });
        }
        Ok(stats)
    }

    pub fn get_stats(&self) -> DbResult<DbStats> {
        Ok(DbStats {
            db_size_bytes: self.get_db_file_size(),
            tables: self.get_table_stats()?,
        })
    }

    /// Delete the oldest log entries, then the oldest sessions, in batches of
    /// 500 until the file fits in `max_bytes`. Returns rows deleted.
    pub fn enforce_size_limit(&self, max_bytes: u64) -> DbResult<u64> {
        let mut total_deleted = 0u64;
        if max_bytes == 0 || self.get_db_file_size() <= max_bytes {
            return Ok(0);
        }

        for sql in [
            "DELETE FROM log_entries WHERE seq IN (SELECT seq FROM log_entries ORDER BY seq ASC LIMIT 500)",
            "DELETE FROM sessions WHERE session_id IN (SELECT session_id FROM sessions ORDER BY started_at ASC LIMIT 500)",
        ] {
            loop {
                if self.get_db_file_size() <= max_bytes {
                    break;
                }
                let deleted = {
                    let conn = self.conn()?;
                    let deleted = conn.execute(sql, [])?;
                    // Space is only returned to the file system by VACUUM.
                    conn.execute_batch("VACUUM")?;
                    deleted
                };
                if deleted == 0 {
                    break;
                }
                total_deleted += deleted as u64;
            }
        }

        Ok(total_deleted)
    }
}

impl Repository for Database {
    fn load_rules(&self) -> DbResult<Vec<Rule>> {
        self.select_rules()
    }

    fn save_rules(&self, rules: &[Rule]) -> DbResult<()> {
        self.replace_rules(rules)
    }

    fn load_sessions(&self) -> DbResult<Vec<Session>> {
        self.select_sessions()
    }

    fn save_sessions(&self, sessions: &[Session]) -> DbResult<()> {
        self.replace_sessions(sessions)
    }

    fn load_log_entries(&self) -> DbResult<Vec<LogEntry>> {
        self.select_log_entries()
    }

    fn save_log_entries(&self, entries: &[LogEntry]) -> DbResult<()> {
        self.replace_log_entries(entries)
    }

    fn update_rule_status(&self, rule_id: &str, status: &RuleStatus) -> DbResult<bool> {
        self.set_rule_status(rule_id, status)
    }

    fn append_session_event(&self, session_id: &str, event: &SessionEvent) -> DbResult<()> {
        self.push_session_event(session_id, event)
    }

    fn append_log_entry(&self, entry: &LogEntry) -> DbResult<()> {
        self.insert_log_entry(entry)
    }

    fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> DbResult<PruneReport> {
        // An empty cutoff sorts before every timestamp, disabling the age limit.
        let cutoff = if policy.max_age_days > 0 {
            ts(&(now - chrono::Duration::days(policy.max_age_days as i64)))
        } else {
            String::new()
        };
        Ok(PruneReport {
            entries_removed: self.prune_old_logs(&cutoff, policy.max_entries)?,
            sessions_removed: self.prune_sessions(&cutoff, policy.max_sessions)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EntryStatus, EventType, LogLevel};
    use crate::rules::RunResult;

    fn entry(session: &str, rule: &str, age_days: i64) -> LogEntry {
        let mut e = LogEntry::new(session, rule, LogLevel::Info, EntryStatus::Start, "start");
        e.timestamp = Utc::now() - chrono::Duration::days(age_days);
        e
    }

    #[test]
    fn rules_keep_order_and_status_updates() {
        let db = Database::open_in_memory().unwrap();
        let rules: Vec<Rule> = ["b", "a", "c"]
            .iter()
            .map(|id| Rule {
                id: id.to_string(),
                active: true,
                ..Default::default()
            })
            .collect();
        db.save_rules(&rules).unwrap();

        let status = RuleStatus {
            last_run: Some(Utc::now()),
            result: RunResult::Success,
            message: "3 rows".into(),
        };
        assert!(db.update_rule_status("a", &status).unwrap());
        assert!(!db.update_rule_status("zzz", &status).unwrap());

        let loaded = db.load_rules().unwrap();
        let ids: Vec<&str> = loaded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(loaded[1].status.result, RunResult::Success);
        assert_eq!(loaded[0].status.result, RunResult::New);
    }

    #[test]
    fn session_events_append_in_order() {
        let db = Database::open_in_memory().unwrap();
        for (i, kind) in [EventType::Start, EventType::Processing, EventType::Success]
            .iter()
            .enumerate()
        {
            db.append_session_event(
                "s1",
                &SessionEvent {
                    event_type: *kind,
                    message: format!("event {}", i),
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        }
        let sessions = db.load_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        let types: Vec<EventType> = sessions[0].events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::Start, EventType::Processing, EventType::Success]
        );
    }

    #[test]
    fn prune_by_age_and_count() {
        let db = Database::open_in_memory().unwrap();
        db.append_log_entry(&entry("old", "r", 40)).unwrap();
        for i in 0..5 {
            db.append_log_entry(&entry("new", &format!("r{}", i), 0)).unwrap();
        }
        let report = db
            .prune(
                &RetentionPolicy {
                    max_entries: 3,
                    max_sessions: 0,
                    max_age_days: 30,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(report.entries_removed, 3);

        let left = db.load_log_entries().unwrap();
        let rules: Vec<&str> = left.iter().map(|e| e.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["r2", "r3", "r4"]);
    }

    #[test]
    fn table_stats_count_rows() {
        let db = Database::open_in_memory().unwrap();
        db.append_log_entry(&entry("s", "r", 0)).unwrap();
        let stats = db.get_table_stats().unwrap();
        let log = stats.iter().find(|t| t.table_name == "log_entries").unwrap();
        assert_eq!(log.row_count, 1);
        assert_eq!(db.get_db_file_size(), 0);
    }

    #[test]
    fn size_limit_drops_oldest_entries_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("data.db")).unwrap();
        for i in 0..3000 {
            let mut e = entry("s", &format!("r{}", i), 0);
            e.message = format!("transfer of rule r{} finished with a long status line", i);
            db.insert_log_entry(&e).unwrap();
        }
        let before = db.get_db_file_size();
        assert!(before > 0);

        let deleted = db.enforce_size_limit(before / 4).unwrap();
        assert!(deleted > 0);
        assert_eq!(deleted % 500, 0);
        assert!(db.get_db_file_size() < before);

        let left = db.load_log_entries().unwrap();
        assert_eq!(left.len() as u64, 3000 - deleted);
        assert_eq!(left.last().unwrap().rule_id, "r2999");
        assert!(left.iter().all(|e| e.rule_id != "r0"));
        assert_eq!(db.enforce_size_limit(0).unwrap(), 0);
    }
}
