use rusqlite::params;

use super::models::LogEntry;
use super::{ts, Database, DbResult};

impl Database {
    pub fn insert_log_entry(&self, entry: &LogEntry) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO log_entries (session_id, timestamp, level, rule_id, status, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.session_id,
                ts(&entry.timestamp),
                entry.level.as_str(),
                entry.rule_id,
                entry.status.as_str(),
                serde_json::to_string(entry)?
            ],
        )?;
        Ok(())
    }

    pub fn select_log_entries(&self) -> DbResult<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM log_entries ORDER BY seq ASC")?;
        let bodies = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for body in bodies {
            entries.push(serde_json::from_str(&body?)?);
        }
        Ok(entries)
    }

    /// Entries of one session, oldest first.
    pub fn select_session_entries(&self, session_id: &str) -> DbResult<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM log_entries WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let bodies = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for body in bodies {
            entries.push(serde_json::from_str(&body?)?);
        }
        Ok(entries)
    }

    pub fn replace_log_entries(&self, entries: &[LogEntry]) -> DbResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM log_entries", [])?;
        for entry in entries {
            tx.execute(
                "INSERT INTO log_entries (session_id, timestamp, level, rule_id, status, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.session_id,
                    ts(&entry.timestamp),
                    entry.level.as_str(),
                    entry.rule_id,
                    entry.status.as_str(),
                    serde_json::to_string(entry)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn prune_old_logs(&self, before: &str, max_entries: usize) -> DbResult<usize> {
        let conn = self.conn()?;
        let mut removed = conn.execute(
            "DELETE FROM log_entries WHERE timestamp < ?1",
            params![before],
        )?;
        if max_entries > 0 {
            removed += conn.execute(
                "DELETE FROM log_entries WHERE seq NOT IN
                 (SELECT seq FROM log_entries ORDER BY seq DESC LIMIT ?1)",
                params![max_entries as i64],
            )?;
        }
        Ok(removed)
    }
}
