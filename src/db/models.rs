use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Type of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Processing,
    Success,
    Error,
    Warning,
    Info,
    Skipped,
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Processing => "PROCESSING",
            EventType::Success => "SUCCESS",
            EventType::Error => "ERROR",
            EventType::Warning => "WARNING",
            EventType::Info => "INFO",
            EventType::Skipped => "SKIPPED",
            EventType::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One execution sweep with its append-only event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
}

/// Outcome recorded on a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Start,
    Processing,
    Success,
    Error,
    Skipped,
    Cancelled,
    /// Session finished with a mix of successes and failures.
    Partial,
    Info,
    Warning,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Success
                | EntryStatus::Error
                | EntryStatus::Skipped
                | EntryStatus::Cancelled
                | EntryStatus::Partial
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Start => "START",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Error => "ERROR",
            EntryStatus::Skipped => "SKIPPED",
            EntryStatus::Cancelled => "CANCELLED",
            EntryStatus::Partial => "PARTIAL",
            EntryStatus::Info => "INFO",
            EntryStatus::Warning => "WARNING",
        }
    }
}

/// Rule id used for session start/completion markers.
pub const SESSION_RULE_ID: &str = "SESSION";

/// Extended log record, one per significant engine action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub rule_id: String,
    pub status: EntryStatus,
    pub message: String,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub rows_processed: Option<usize>,
    #[serde(default)]
    pub columns_processed: Option<usize>,
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_identifier: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub retry_attempt: Option<u32>,
    #[serde(default)]
    pub destination_id: Option<String>,
    #[serde(default)]
    pub destination_tab: Option<String>,
    #[serde(default)]
    pub processing_mode: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        session_id: &str,
        rule_id: &str,
        level: LogLevel,
        status: EntryStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            level,
            rule_id: rule_id.to_string(),
            status,
            message: message.into(),
            execution_time_ms: None,
            rows_processed: None,
            columns_processed: None,
            file_size_bytes: None,
            source_type: None,
            source_identifier: None,
            error_code: None,
            error_type: None,
            retry_attempt: None,
            destination_id: None,
            destination_tab: None,
            processing_mode: None,
            metadata: None,
        }
    }
}

/// Limits applied to the audit trail after every run. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_entries: usize,
    pub max_sessions: usize,
    pub max_age_days: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub entries_removed: usize,
    pub sessions_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStats {
    pub table_name: String,
    pub row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub db_size_bytes: u64,
    pub tables: Vec<TableStats>,
}
