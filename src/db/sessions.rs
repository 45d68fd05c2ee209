use rusqlite::{params, OptionalExtension};

use super::models::{Session, SessionEvent};
use super::{ts, Database, DbResult};

impl Database {
    pub fn select_sessions(&self) -> DbResult<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, started_at, events FROM sessions ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, started_at, events) = row?;
            sessions.push(Session {
                session_id,
                started_at: serde_json::from_value(serde_json::Value::String(started_at))?,
                events: serde_json::from_str(&events)?,
            });
        }
        Ok(sessions)
    }

    pub fn replace_sessions(&self, sessions: &[Session]) -> DbResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sessions", [])?;
        for session in sessions {
            tx.execute(
                "INSERT INTO sessions (session_id, started_at, events) VALUES (?1, ?2, ?3)",
                params![
                    session.session_id,
                    ts(&session.started_at),
                    serde_json::to_string(&session.events)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn push_session_event(&self, session_id: &str, event: &SessionEvent) -> DbResult<()> {
        let conn = self.conn()?;
        let events: Option<String> = conn
            .query_row(
                "SELECT events FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match events {
            Some(json) => {
                let mut events: Vec<SessionEvent> = serde_json::from_str(&json)?;
                events.push(event.clone());
                conn.execute(
                    "UPDATE sessions SET events = ?1 WHERE session_id = ?2",
                    params![serde_json::to_string(&events)?, session_id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO sessions (session_id, started_at, events) VALUES (?1, ?2, ?3)",
                    params![
                        session_id,
                        ts(&event.timestamp),
                        serde_json::to_string(&vec![event])?
                    ],
                )?;
            }
        }
        Ok(())
    }

    pub fn prune_sessions(&self, before: &str, max_sessions: usize) -> DbResult<usize> {
        let conn = self.conn()?;
        let mut removed = conn.execute(
            "DELETE FROM sessions WHERE started_at < ?1",
            params![before],
        )?;
        if max_sessions > 0 {
            removed += conn.execute(
                "DELETE FROM sessions WHERE session_id NOT IN
                 (SELECT session_id FROM sessions ORDER BY started_at DESC LIMIT ?1)",
                params![max_sessions as i64],
            )?;
        }
        Ok(removed)
    }
}
