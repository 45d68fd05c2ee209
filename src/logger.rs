//! Session-correlated audit trail.
//!
//! Two streams are kept: a [`Session`] per run with its ordered event list,
//! and a flat list of extended [`LogEntry`] records. Both go through the
//! repository; when the repository fails the record is written to the
//! diagnostic log instead and the caller carries on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::db::{DbResult, PruneReport, Repository, RetentionPolicy};
use crate::error::{ErrorCode, ErrorKind, TransferError};

pub use crate::db::{
    EntryStatus, EventType, LogEntry, LogLevel, Session, SessionEvent, SESSION_RULE_ID,
};

/// Error code and kind assigned to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub code: ErrorCode,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    #[serde(rename = "IN PROGRESS")]
    InProgress,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "COMPLETE WITH WARNINGS")]
    CompleteWithWarnings,
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "IN PROGRESS",
            SessionStatus::Error => "ERROR",
            SessionStatus::CompleteWithWarnings => "COMPLETE WITH WARNINGS",
            SessionStatus::Complete => "COMPLETE",
        }
    }
}

/// Derive a session's status from its events.
pub fn session_status(events: &[SessionEvent]) -> SessionStatus {
    if events.last().map(|e| e.event_type) == Some(EventType::Processing) {
        return SessionStatus::InProgress;
    }
    if events.iter().any(|e| e.event_type == EventType::Error) {
        SessionStatus::Error
    } else if events.iter().any(|e| e.event_type == EventType::Warning) {
        SessionStatus::CompleteWithWarnings
    } else {
        SessionStatus::Complete
    }
}

/// A session prepared for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub duration_ms: i64,
    pub counts: BTreeMap<&'static str, usize>,
    /// Sorted by timestamp.
    pub events: Vec<SessionEvent>,
}

impl SessionView {
    pub fn from_session(session: &Session) -> Self {
        let mut events = session.events.clone();
        events.sort_by_key(|e| e.timestamp);
        let duration_ms = match (events.first(), events.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds(),
            _ => 0,
        };
        let mut counts = BTreeMap::new();
        for event in &events {
            *counts.entry(event.event_type.as_str()).or_insert(0) += 1;
        }
        Self {
            session_id: session.session_id.clone(),
            status: session_status(&session.events),
            duration_ms,
            counts,
            events,
        }
    }
}

/// Per-session aggregate folded from the flat log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Status of the SESSION completion marker, or IN PROGRESS without one.
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub rule_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    pub cancelled_count: usize,
    pub total_rows: usize,
}

/// Fold log entries into per-session summaries, most recent session first.
///
/// A rule's outcome is its last terminal entry in the session, so failed
/// attempts that were retried successfully count as a success.
pub fn summarize(entries: &[LogEntry], limit: usize) -> Vec<SessionSummary> {
    struct Acc {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        completion: Option<EntryStatus>,
        rules: HashMap<String, EntryStatus>,
        rule_order: Vec<String>,
        total_rows: usize,
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_session: HashMap<String, Acc> = HashMap::new();

    for entry in entries {
        let acc = by_session.entry(entry.session_id.clone()).or_insert_with(|| {
            order.push(entry.session_id.clone());
            Acc {
                start: entry.timestamp,
                end: entry.timestamp,
                completion: None,
                rules: HashMap::new(),
                rule_order: Vec::new(),
                total_rows: 0,
            }
        });
        acc.start = acc.start.min(entry.timestamp);
        acc.end = acc.end.max(entry.timestamp);

        if entry.rule_id == SESSION_RULE_ID {
            if entry.status.is_terminal() {
                acc.completion = Some(entry.status);
            }
            continue;
        }
        if !acc.rules.contains_key(&entry.rule_id) {
            acc.rule_order.push(entry.rule_id.clone());
            acc.rules.insert(entry.rule_id.clone(), EntryStatus::Start);
        }
        if entry.status.is_terminal() {
            acc.rules.insert(entry.rule_id.clone(), entry.status);
            if entry.status == EntryStatus::Success {
                acc.total_rows += entry.rows_processed.unwrap_or(0);
            }
        }
    }

    let mut summaries: Vec<SessionSummary> = order
        .into_iter()
        .filter_map(|id| by_session.remove(&id).map(|acc| (id, acc)))
        .map(|(session_id, acc)| {
            let count = |status: EntryStatus| acc.rules.values().filter(|s| **s == status).count();
            SessionSummary {
                status: acc
                    .completion
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| SessionStatus::InProgress.as_str().to_string()),
                start_time: acc.start,
                end_time: acc.end,
                rule_count: acc.rule_order.len(),
                success_count: count(EntryStatus::Success),
                error_count: count(EntryStatus::Error),
                skipped_count: count(EntryStatus::Skipped),
                cancelled_count: count(EntryStatus::Cancelled),
                total_rows: acc.total_rows,
                session_id,
            }
        })
        .collect();

    summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    summaries.truncate(limit);
    summaries
}

/// Time-based, unique per invocation: `20261014-083000123-1a2b3c4d`.
pub fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S%3f"), &suffix[..8])
}

pub fn classify(err: &TransferError) -> Classification {
    let code = err.code();
    Classification {
        code,
        kind: code.kind(),
    }
}

pub struct SessionLogger {
    repo: Arc<dyn Repository>,
    min_level: LogLevel,
    retention: RetentionPolicy,
}

impl SessionLogger {
    pub fn new(repo: Arc<dyn Repository>, settings: &EngineSettings) -> Self {
        Self {
            repo,
            min_level: settings.min_log_level,
            retention: RetentionPolicy {
                max_entries: settings.max_log_entries,
                max_sessions: settings.max_sessions,
                max_age_days: settings.log_retention_days,
            },
        }
    }

    pub fn log_event(&self, session_id: &str, event_type: EventType, message: &str) {
        match event_type {
            EventType::Error => log::error!("[{}] {}", session_id, message),
            EventType::Warning => log::warn!("[{}] {}", session_id, message),
            _ => log::info!("[{}] {}: {}", session_id, event_type.as_str(), message),
        }
        let event = SessionEvent {
            event_type,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.repo.append_session_event(session_id, &event) {
            log::error!(
                "Failed to record session event ({}): [{}] {} {}",
                e,
                session_id,
                event_type.as_str(),
                message
            );
        }
    }

    /// START and terminal entries bypass the level filter.
    pub fn should_record(&self, entry: &LogEntry) -> bool {
        entry.status == EntryStatus::Start
            || entry.status.is_terminal()
            || entry.level >= self.min_level
    }

    /// Returns whether the entry passed the level filter.
    pub fn log_entry(&self, entry: LogEntry) -> bool {
        if !self.should_record(&entry) {
            log::debug!(
                "Filtered {} entry for rule {}: {}",
                entry.level.as_str(),
                entry.rule_id,
                entry.message
            );
            return false;
        }
        if let Err(e) = self.repo.append_log_entry(&entry) {
            log::error!(
                "Failed to record log entry ({}): [{}] {} {} {}",
                e,
                entry.session_id,
                entry.rule_id,
                entry.status.as_str(),
                entry.message
            );
        }
        true
    }

    /// Trim log entries and sessions per the retention policy.
    pub fn apply_retention(&self) -> PruneReport {
        match self.repo.prune(&self.retention, Utc::now()) {
            Ok(report) => {
                if report.entries_removed > 0 || report.sessions_removed > 0 {
                    log::info!(
                        "Retention removed {} log entries and {} sessions",
                        report.entries_removed,
                        report.sessions_removed
                    );
                }
                report
            }
            Err(e) => {
                log::error!("Failed to apply log retention: {}", e);
                PruneReport::default()
            }
        }
    }

    pub fn recent_sessions(&self, limit: usize) -> DbResult<Vec<SessionSummary>> {
        Ok(summarize(&self.repo.load_log_entries()?, limit))
    }

    pub fn session_view(&self, session_id: &str) -> DbResult<Option<SessionView>> {
        Ok(self
            .repo
            .load_sessions()?
            .iter()
            .find(|s| s.session_id == session_id)
            .map(SessionView::from_session))
    }

    pub fn session_entries(&self, session_id: &str) -> DbResult<Vec<LogEntry>> {
        Ok(self
            .repo
            .load_log_entries()?
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;

    fn events(types: &[EventType]) -> Vec<SessionEvent> {
        let base = Utc::now();
        types
            .iter()
            .enumerate()
            .map(|(i, t)| SessionEvent {
                event_type: *t,
                message: String::new(),
                timestamp: base + chrono::Duration::milliseconds(i as i64 * 10),
            })
            .collect()
    }

    fn logger(min_level: LogLevel) -> (Arc<MemoryRepository>, SessionLogger) {
        let repo = Arc::new(MemoryRepository::new());
        let settings = EngineSettings {
            min_log_level: min_level,
            ..Default::default()
        };
        let logger = SessionLogger::new(repo.clone(), &settings);
        (repo, logger)
    }

    #[test]
    fn status_derivation() {
        use EventType::*;
        assert_eq!(
            session_status(&events(&[Start, Processing, Error, Success])),
            SessionStatus::Error
        );
        assert_eq!(session_status(&events(&[Start, Success])), SessionStatus::Complete);
        assert_eq!(
            session_status(&events(&[Start, Warning, Success])),
            SessionStatus::CompleteWithWarnings
        );
        assert_eq!(
            session_status(&events(&[Start, Processing])),
            SessionStatus::InProgress
        );
    }

    #[test]
    fn view_sorts_and_counts() {
        let mut evs = events(&[EventType::Start, EventType::Success, EventType::Success]);
        evs.swap(0, 2);
        let view = SessionView::from_session(&Session {
            session_id: "s".into(),
            started_at: Utc::now(),
            events: evs,
        });
        assert_eq!(view.events[0].event_type, EventType::Start);
        assert_eq!(view.duration_ms, 20);
        assert_eq!(view.counts["SUCCESS"], 2);
    }

    #[test]
    fn level_filter_spares_start_and_terminal() {
        let (repo, logger) = logger(LogLevel::Warning);
        assert!(!logger.log_entry(LogEntry::new(
            "s", "r", LogLevel::Info, EntryStatus::Processing, "reading"
        )));
        assert!(logger.log_entry(LogEntry::new("s", "r", LogLevel::Info, EntryStatus::Start, "go")));
        assert!(logger.log_entry(LogEntry::new(
            "s", "r", LogLevel::Info, EntryStatus::Success, "done"
        )));
        assert!(logger.log_entry(LogEntry::new(
            "s", "r", LogLevel::Warning, EntryStatus::Warning, "hmm"
        )));
        assert_eq!(repo.load_log_entries().unwrap().len(), 3);
    }

    #[test]
    fn store_failure_does_not_panic() {
        let (repo, logger) = logger(LogLevel::Debug);
        repo.set_fail_log_writes(true);
        logger.log_event("s", EventType::Start, "go");
        assert!(logger.log_entry(LogEntry::new("s", "r", LogLevel::Info, EntryStatus::Start, "go")));
        assert!(repo.load_log_entries().unwrap().is_empty());
    }

    #[test]
    fn summaries_use_last_terminal_status_per_rule() {
        let mut entries = Vec::new();
        let mut push = |session: &str, rule: &str, status: EntryStatus, rows: Option<usize>| {
            let mut e = LogEntry::new(session, rule, LogLevel::Info, status, "");
            e.rows_processed = rows;
            entries.push(e);
        };
        push("s1", SESSION_RULE_ID, EntryStatus::Start, None);
        push("s1", "a", EntryStatus::Start, None);
        push("s1", "a", EntryStatus::Error, None);
        push("s1", "a", EntryStatus::Start, None);
        push("s1", "a", EntryStatus::Success, Some(7));
        push("s1", "b", EntryStatus::Error, None);
        push("s1", "c", EntryStatus::Skipped, None);
        push("s1", SESSION_RULE_ID, EntryStatus::Partial, None);
        push("s2", SESSION_RULE_ID, EntryStatus::Start, None);

        let summaries = summarize(&entries, 10);
        let s1 = summaries.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(s1.rule_count, 3);
        assert_eq!(s1.success_count, 1);
        assert_eq!(s1.error_count, 1);
        assert_eq!(s1.skipped_count, 1);
        assert_eq!(s1.total_rows, 7);
        assert_eq!(s1.status, "PARTIAL");

        let s2 = summaries.iter().find(|s| s.session_id == "s2").unwrap();
        assert_eq!(s2.status, "IN PROGRESS");
        assert_eq!(s2.rule_count, 0);

        assert_eq!(summarize(&entries, 1).len(), 1);
    }

    #[test]
    fn session_ids_are_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20261014-083000123-1a2b3c4d".len());
    }
}
