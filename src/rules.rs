//! Rule model and validation.
//!
//! Rules are persisted in a loose form so that a rule with an unknown method
//! or handling mode still loads; [`validate`] turns a stored [`Rule`] into a
//! typed [`Job`] or rejects it before any I/O happens.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::resolver;

// ── Stored form ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    /// `email`, `gSheet` or `push`
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub source: RuleSource,
    #[serde(default)]
    pub destination: RuleDestination,
    /// `clearAndReuse`, `append`, `recreate` or `copyFormat`
    #[serde(default)]
    pub handling_mode: Option<String>,
    /// Comma-separated addresses for the session summary
    #[serde(default)]
    pub email_recipients: Option<String>,
    #[serde(default)]
    pub status: RuleStatus,
}

/// Source fields; which ones are required depends on the method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSource {
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub attachment_pattern: Option<String>,
    /// Workbook id or shareable URL (gSheet)
    #[serde(default)]
    pub sheet: Option<String>,
    /// Tab name (gSheet and push)
    #[serde(default)]
    pub tab: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDestination {
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub tab: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    #[default]
    New,
    Success,
    Error,
    Skipped,
    Cancelled,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::New => "NEW",
            RunResult::Success => "SUCCESS",
            RunResult::Error => "ERROR",
            RunResult::Skipped => "SKIPPED",
            RunResult::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleStatus {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: RunResult,
    #[serde(default)]
    pub message: String,
}

fn filled(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Rule {
    /// A row with nothing filled in besides its id (and maybe the toggle).
    pub fn is_blank(&self) -> bool {
        self.method.trim().is_empty()
            && filled(&self.source.search_query).is_none()
            && filled(&self.source.attachment_pattern).is_none()
            && filled(&self.source.sheet).is_none()
            && filled(&self.source.tab).is_none()
            && filled(&self.destination.sheet).is_none()
            && filled(&self.destination.tab).is_none()
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Recipient addresses, trimmed, empty entries dropped.
    pub fn recipients(&self) -> Vec<String> {
        self.email_recipients
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Case-insensitive union of all recipients of the given rules, first spelling wins.
pub fn collect_recipients<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for rule in rules {
        for address in rule.recipients() {
            if seen.insert(address.to_lowercase()) {
                out.push(address);
            }
        }
    }
    out
}

// ── Typed form ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Email,
    SheetImport,
    Push,
}

impl Method {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "email" => Some(Method::Email),
            "gSheet" => Some(Method::SheetImport),
            "push" => Some(Method::Push),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Email => "email",
            Method::SheetImport => "gSheet",
            Method::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlingMode {
    #[default]
    ClearAndReuse,
    Append,
    Recreate,
    CopyFormat,
}

impl HandlingMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "clearAndReuse" => Some(HandlingMode::ClearAndReuse),
            "append" => Some(HandlingMode::Append),
            "recreate" => Some(HandlingMode::Recreate),
            "copyFormat" => Some(HandlingMode::CopyFormat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlingMode::ClearAndReuse => "clearAndReuse",
            HandlingMode::Append => "append",
            HandlingMode::Recreate => "recreate",
            HandlingMode::CopyFormat => "copyFormat",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Source {
    Email { query: String, pattern: Regex },
    SheetImport { workbook_id: String, tab: String },
    Push { tab: String },
}

impl Source {
    pub fn method(&self) -> Method {
        match self {
            Source::Email { .. } => Method::Email,
            Source::SheetImport { .. } => Method::SheetImport,
            Source::Push { .. } => Method::Push,
        }
    }

    /// Short description for log entries.
    pub fn identifier(&self) -> String {
        match self {
            Source::Email { query, .. } => query.clone(),
            Source::SheetImport { workbook_id, tab } => format!("{}/{}", workbook_id, tab),
            Source::Push { tab } => tab.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestinationRef {
    pub workbook_id: String,
    pub tab: String,
}

/// A validated rule, ready for a strategy.
#[derive(Debug, Clone)]
pub struct Job {
    pub rule_id: String,
    pub source: Source,
    pub destination: DestinationRef,
    pub mode: HandlingMode,
    /// Set when the stored mode was missing or unknown and got defaulted.
    pub mode_warning: Option<String>,
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
    method: Method,
) -> Result<&'a str, TransferError> {
    filled(value).ok_or_else(|| TransferError::MissingField {
        field,
        method: method.as_str().to_string(),
    })
}

/// Check the fields a rule's method needs and build the typed job.
pub fn validate(rule: &Rule) -> Result<Job, TransferError> {
    let method = Method::parse(&rule.method)
        .ok_or_else(|| TransferError::UnknownMethod(rule.method.clone()))?;

    let source = match method {
        Method::Email => {
            let query = required(&rule.source.search_query, "search_query", method)?;
            let raw_pattern = required(&rule.source.attachment_pattern, "attachment_pattern", method)?;
            let pattern = Regex::new(raw_pattern).map_err(|e| TransferError::InvalidPattern {
                pattern: raw_pattern.to_string(),
                reason: e.to_string(),
            })?;
            Source::Email {
                query: query.to_string(),
                pattern,
            }
        }
        Method::SheetImport => {
            let sheet = required(&rule.source.sheet, "source.sheet", method)?;
            let tab = required(&rule.source.tab, "source.tab", method)?;
            Source::SheetImport {
                workbook_id: resolver::resolve_resource_id(sheet)?,
                tab: tab.to_string(),
            }
        }
        Method::Push => {
            let tab = required(&rule.source.tab, "source.tab", method)?;
            Source::Push {
                tab: tab.to_string(),
            }
        }
    };

    let dest_sheet = required(&rule.destination.sheet, "destination.sheet", method)?;
    let dest_tab = required(&rule.destination.tab, "destination.tab", method)?;
    let destination = DestinationRef {
        workbook_id: resolver::resolve_resource_id(dest_sheet)?,
        tab: dest_tab.to_string(),
    };

    let (mode, mode_warning) = match filled(&rule.handling_mode) {
        Some(raw) => match HandlingMode::parse(raw) {
            Some(mode) => (mode, None),
            None => (
                HandlingMode::ClearAndReuse,
                Some(format!(
                    "Unknown handling mode '{}' for rule {}; using clearAndReuse",
                    raw, rule.id
                )),
            ),
        },
        None => (
            HandlingMode::ClearAndReuse,
            Some(format!(
                "No handling mode set for rule {}; using clearAndReuse",
                rule.id
            )),
        ),
    };

    Ok(Job {
        rule_id: rule.id.clone(),
        source,
        destination,
        mode,
        mode_warning,
    })
}
