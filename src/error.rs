//! Error types and the failure taxonomy used for operator triage.
//!
//! Rule-level failures are [`TransferError`]s. Each one maps to an
//! [`ErrorCode`] which in turn belongs to an [`ErrorKind`] and decides whether
//! the engine retries. Failures reported by collaborators (mail, sheets) arrive
//! as [`CollaboratorError`]s: when the collaborator knows what went wrong it
//! attaches a [`FailureHint`], otherwise the message is run through
//! [`CLASSIFICATION_RULES`] in order.

use serde::{Deserialize, Serialize};

// ── Taxonomy ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Source,
    Processing,
    Destination,
    Permission,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Source => "SOURCE",
            ErrorKind::Processing => "PROCESSING",
            ErrorKind::Destination => "DESTINATION",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationMissingField,
    ValidationInvalidMethod,
    ValidationInvalidPattern,
    ValidationInvalidResource,
    SourceNotFound,
    SourceEmpty,
    SourceAccessDenied,
    SourceRateLimited,
    ProcessingAmbiguousMatch,
    ProcessingMalformedContent,
    ProcessingTooLarge,
    ProcessingLimitExceeded,
    ProcessingParseFailed,
    DestinationCreateFailed,
    DestinationWriteFailed,
    DestinationAccessDenied,
    DestinationRateLimited,
    PermissionDenied,
    SystemTimeout,
    SystemQuotaExceeded,
    SystemRateLimited,
    SystemUnknownError,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            ValidationMissingField
            | ValidationInvalidMethod
            | ValidationInvalidPattern
            | ValidationInvalidResource => ErrorKind::Validation,
            SourceNotFound | SourceEmpty | SourceAccessDenied | SourceRateLimited => {
                ErrorKind::Source
            }
            ProcessingAmbiguousMatch
            | ProcessingMalformedContent
            | ProcessingTooLarge
            | ProcessingLimitExceeded
            | ProcessingParseFailed => ErrorKind::Processing,
            DestinationCreateFailed
            | DestinationWriteFailed
            | DestinationAccessDenied
            | DestinationRateLimited => ErrorKind::Destination,
            PermissionDenied => ErrorKind::Permission,
            SystemTimeout | SystemQuotaExceeded | SystemRateLimited | SystemUnknownError => {
                ErrorKind::System
            }
        }
    }

    /// Transient failures that a later attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SourceAccessDenied
                | ErrorCode::SourceRateLimited
                | ErrorCode::DestinationAccessDenied
                | ErrorCode::DestinationRateLimited
                | ErrorCode::SystemTimeout
                | ErrorCode::SystemRateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ValidationMissingField => "VALIDATION_MISSING_FIELD",
            ValidationInvalidMethod => "VALIDATION_INVALID_METHOD",
            ValidationInvalidPattern => "VALIDATION_INVALID_PATTERN",
            ValidationInvalidResource => "VALIDATION_INVALID_RESOURCE",
            SourceNotFound => "SOURCE_NOT_FOUND",
            SourceEmpty => "SOURCE_EMPTY",
            SourceAccessDenied => "SOURCE_ACCESS_DENIED",
            SourceRateLimited => "SOURCE_RATE_LIMITED",
            ProcessingAmbiguousMatch => "PROCESSING_AMBIGUOUS_MATCH",
            ProcessingMalformedContent => "PROCESSING_MALFORMED_CONTENT",
            ProcessingTooLarge => "PROCESSING_TOO_LARGE",
            ProcessingLimitExceeded => "PROCESSING_LIMIT_EXCEEDED",
            ProcessingParseFailed => "PROCESSING_PARSE_FAILED",
            DestinationCreateFailed => "DESTINATION_CREATE_FAILED",
            DestinationWriteFailed => "DESTINATION_WRITE_FAILED",
            DestinationAccessDenied => "DESTINATION_ACCESS_DENIED",
            DestinationRateLimited => "DESTINATION_RATE_LIMITED",
            PermissionDenied => "PERMISSION_DENIED",
            SystemTimeout => "SYSTEM_TIMEOUT",
            SystemQuotaExceeded => "SYSTEM_QUOTA_EXCEEDED",
            SystemRateLimited => "SYSTEM_RATE_LIMITED",
            SystemUnknownError => "SYSTEM_UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Collaborator errors ─────────────────────────────────────

/// What a collaborator knows about its own failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    NotFound,
    /// Access refused for now; the same request may succeed later.
    Unavailable,
    PermissionDenied,
    RateLimited,
    Timeout,
    QuotaExceeded,
}

/// A failure reported by the mail or sheet store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub hint: Option<FailureHint>,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(message: impl Into<String>, hint: FailureHint) -> Self {
        Self {
            message: message.into(),
            hint: Some(hint),
        }
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        let hint = match err.kind() {
            std::io::ErrorKind::NotFound => Some(FailureHint::NotFound),
            std::io::ErrorKind::PermissionDenied => Some(FailureHint::PermissionDenied),
            std::io::ErrorKind::TimedOut => Some(FailureHint::Timeout),
            _ => None,
        };
        Self {
            message: err.to_string(),
            hint,
        }
    }
}

/// Which side of a transfer a collaborator failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
    System,
}

// ── Rule-level errors ───────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("Missing required field '{field}' for {method} rule")]
    MissingField { field: &'static str, method: String },

    #[error("Unknown method '{0}' (expected email, gSheet or push)")]
    UnknownMethod(String),

    #[error("Invalid attachment pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid sheet reference '{0}'")]
    InvalidResource(String),

    #[error("No active workbook is configured for push rules")]
    NoActiveWorkbook,

    #[error("{0}")]
    SourceNotFound(String),

    #[error("Source tab '{tab}' has no data")]
    SourceEmpty { tab: String },

    #[error("Message '{subject}' has {count} attachments matching '{pattern}'; refusing to guess")]
    AmbiguousAttachment {
        subject: String,
        pattern: String,
        count: usize,
    },

    #[error("Attachment '{name}' contains no rows")]
    EmptyAttachment { name: String },

    #[error("Attachment '{name}' is {size} bytes, over the {limit} byte limit")]
    AttachmentTooLarge { name: String, size: u64, limit: u64 },

    #[error("Data has {rows} rows x {columns} columns, over the limit ({limit})")]
    LimitExceeded {
        rows: usize,
        columns: usize,
        limit: String,
    },

    #[error("Failed to parse '{name}': {reason}")]
    Parse { name: String, reason: String },

    #[error("{0}")]
    Source(CollaboratorError),

    #[error("{0}")]
    Destination(CollaboratorError),

    #[error("Rule panicked: {0}")]
    Panicked(String),
}

impl TransferError {
    pub fn source(err: CollaboratorError) -> Self {
        TransferError::Source(err)
    }

    pub fn destination(err: CollaboratorError) -> Self {
        TransferError::Destination(err)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::MissingField { .. } | TransferError::NoActiveWorkbook => {
                ErrorCode::ValidationMissingField
            }
            TransferError::UnknownMethod(_) => ErrorCode::ValidationInvalidMethod,
            TransferError::InvalidPattern { .. } => ErrorCode::ValidationInvalidPattern,
            TransferError::InvalidResource(_) => ErrorCode::ValidationInvalidResource,
            TransferError::SourceNotFound(_) => ErrorCode::SourceNotFound,
            TransferError::SourceEmpty { .. } => ErrorCode::SourceEmpty,
            TransferError::AmbiguousAttachment { .. } => ErrorCode::ProcessingAmbiguousMatch,
            TransferError::EmptyAttachment { .. } => ErrorCode::ProcessingMalformedContent,
            TransferError::AttachmentTooLarge { .. } => ErrorCode::ProcessingTooLarge,
            TransferError::LimitExceeded { .. } => ErrorCode::ProcessingLimitExceeded,
            TransferError::Parse { .. } => ErrorCode::ProcessingParseFailed,
            TransferError::Source(e) => classify_collaborator(Side::Source, e),
            TransferError::Destination(e) => classify_collaborator(Side::Destination, e),
            TransferError::Panicked(msg) => classify_message(Side::System, msg),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

// ── Classification ──────────────────────────────────────────

/// One ordered classification rule: the first rule whose hint matches, or
/// whose keywords appear in the lowercased message, decides the failure.
pub struct ClassificationRule {
    pub hint: FailureHint,
    pub keywords: &'static [&'static str],
}

/// Order matters: quota before rate limit ("quota exceeded: too many
/// requests" is not transient), permission before generic access failures.
pub const CLASSIFICATION_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        hint: FailureHint::Timeout,
        keywords: &["timed out", "timeout", "exceeded maximum execution time", "deadline"],
    },
    ClassificationRule {
        hint: FailureHint::QuotaExceeded,
        keywords: &["quota", "out of memory", "memory limit", "storage full"],
    },
    ClassificationRule {
        hint: FailureHint::RateLimited,
        keywords: &["rate limit", "too many requests", "429", "throttl"],
    },
    ClassificationRule {
        hint: FailureHint::PermissionDenied,
        keywords: &["permission denied", "do not have permission", "forbidden", "unauthorized"],
    },
    ClassificationRule {
        hint: FailureHint::Unavailable,
        keywords: &["access denied", "temporarily", "unavailable", "try again"],
    },
    ClassificationRule {
        hint: FailureHint::NotFound,
        keywords: &["not found", "does not exist", "no such"],
    },
];

fn code_for_hint(side: Side, hint: FailureHint) -> ErrorCode {
    match (hint, side) {
        (FailureHint::Timeout, _) => ErrorCode::SystemTimeout,
        (FailureHint::QuotaExceeded, _) => ErrorCode::SystemQuotaExceeded,
        (FailureHint::PermissionDenied, _) => ErrorCode::PermissionDenied,
        (FailureHint::RateLimited, Side::Source) => ErrorCode::SourceRateLimited,
        (FailureHint::RateLimited, Side::Destination) => ErrorCode::DestinationRateLimited,
        (FailureHint::RateLimited, Side::System) => ErrorCode::SystemRateLimited,
        (FailureHint::Unavailable, Side::Source) => ErrorCode::SourceAccessDenied,
        (FailureHint::Unavailable, Side::Destination) => ErrorCode::DestinationAccessDenied,
        (FailureHint::Unavailable, Side::System) => ErrorCode::SystemUnknownError,
        (FailureHint::NotFound, Side::Source) => ErrorCode::SourceNotFound,
        (FailureHint::NotFound, Side::Destination) => ErrorCode::DestinationCreateFailed,
        (FailureHint::NotFound, Side::System) => ErrorCode::SystemUnknownError,
    }
}

/// Classify free text (panic payloads, foreign errors) with the ordered rules.
pub fn classify_message(side: Side, message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    for rule in CLASSIFICATION_RULES {
        if rule.keywords.iter().any(|k| lower.contains(k)) {
            return code_for_hint(side, rule.hint);
        }
    }
    match side {
        Side::Destination => ErrorCode::DestinationWriteFailed,
        Side::Source | Side::System => ErrorCode::SystemUnknownError,
    }
}

pub fn classify_collaborator(side: Side, err: &CollaboratorError) -> ErrorCode {
    match err.hint {
        Some(hint) => code_for_hint(side, hint),
        None => classify_message(side, &err.message),
    }
}

// ── Infrastructure errors ───────────────────────────────────

/// Repository (rules / sessions / log) failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Send(String),
}

/// Failures that stop a whole run before any rule is attempted.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to load rules: {0}")]
    LoadRules(#[source] DbError),

    #[error("Another run holds the lock at {0}")]
    Locked(String),

    #[error("Lock file error: {0}")]
    Lock(#[from] std::io::Error),
}

/// Top-level failures of the command-line front end.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid rules file: {0}")]
    Rules(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    NotFound(String),
}
