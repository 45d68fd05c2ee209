//! Per-method transfer strategies and the table that dispatches to them.

use std::collections::HashMap;
use std::time::Instant;

use regex::Regex;
use uuid::Uuid;

use crate::config::{decode_text, EngineSettings};
use crate::error::TransferError;
use crate::mail::{Attachment, MailMessage, MailStore, MailThread};
use crate::resolver::{self, prepare};
use crate::rules::{HandlingMode, Job, Method, Source};
use crate::sheets::{column_count, last_row, normalize_rows, Row, SheetStore, Workbook};

/// Collaborators and limits a strategy works with.
pub struct StrategyContext<'a> {
    pub sheets: &'a dyn SheetStore,
    pub mail: &'a dyn MailStore,
    pub settings: &'a EngineSettings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub rows: usize,
    pub columns: usize,
    pub duration_ms: u64,
    pub file_size_bytes: Option<u64>,
    pub source_identifier: String,
    pub destination_id: String,
}

pub trait MethodStrategy: Send + Sync {
    fn method(&self) -> Method;

    fn execute(&self, job: &Job, ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError>;
}

/// Strategies keyed by method.
pub struct StrategyTable {
    strategies: HashMap<Method, Box<dyn MethodStrategy>>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(Box::new(EmailStrategy));
        table.register(Box::new(SheetImportStrategy));
        table.register(Box::new(PushStrategy));
        table
    }
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Replaces any strategy already registered for the same method.
    pub fn register(&mut self, strategy: Box<dyn MethodStrategy>) {
        self.strategies.insert(strategy.method(), strategy);
    }

    pub fn execute(&self, job: &Job, ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError> {
        let method = job.source.method();
        let strategy = self
            .strategies
            .get(&method)
            .ok_or_else(|| TransferError::UnknownMethod(method.as_str().to_string()))?;
        let started = Instant::now();
        let mut stats = strategy.execute(job, ctx)?;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }
}

// ── Shared helpers ──────────────────────────────────────────

fn check_limits(rows: &[Row], settings: &EngineSettings) -> Result<(), TransferError> {
    let (count, columns) = (rows.len(), column_count(rows));
    let exceeded = if settings.max_rows > 0 && count > settings.max_rows {
        Some(format!("{} rows", settings.max_rows))
    } else if settings.max_columns > 0 && columns > settings.max_columns {
        Some(format!("{} columns", settings.max_columns))
    } else if settings.max_cells > 0 && count.saturating_mul(columns) > settings.max_cells {
        Some(format!("{} cells", settings.max_cells))
    } else {
        None
    };
    match exceeded {
        Some(limit) => Err(TransferError::LimitExceeded {
            rows: count,
            columns,
            limit,
        }),
        None => Ok(()),
    }
}

fn autofit(workbook: &dyn Workbook, tab: &str, settings: &EngineSettings) {
    if !settings.autofit_columns {
        return;
    }
    if let Err(e) = workbook.autofit_columns(tab) {
        log::warn!("Could not auto-fit columns of '{}' in {}: {}", tab, workbook.id(), e);
    }
}

/// Write a block through the sheet-mode resolver and return the rows written.
fn write_to_destination(
    job: &Job,
    rows: &[Row],
    ctx: &StrategyContext<'_>,
) -> Result<usize, TransferError> {
    let dest = ctx
        .sheets
        .open(&job.destination.workbook_id)
        .map_err(TransferError::destination)?;
    let prepared = prepare(dest.as_ref(), &job.destination.tab, job.mode)?;
    let written = prepared.write(dest.as_ref(), rows)?;
    autofit(dest.as_ref(), &job.destination.tab, ctx.settings);
    Ok(written)
}

// ── Email ───────────────────────────────────────────────────

/// Imports the single CSV attachment matching the rule's pattern.
pub struct EmailStrategy;

/// Walk threads and their messages in order and return the first message with
/// exactly one matching attachment. A message with several matches stops the
/// search: picking one of them would be a guess.
pub fn find_attachment<'a>(
    threads: &'a [MailThread],
    pattern: &Regex,
) -> Result<Option<(&'a MailMessage, &'a Attachment)>, TransferError> {
    for message in threads.iter().flat_map(|t| t.messages.iter()) {
        let matching: Vec<&Attachment> = message
            .attachments
            .iter()
            .filter(|a| pattern.is_match(&a.name))
            .collect();
        match matching.as_slice() {
            [] => continue,
            [only] => return Ok(Some((message, *only))),
            many => {
                return Err(TransferError::AmbiguousAttachment {
                    subject: message.subject.clone(),
                    pattern: pattern.as_str().to_string(),
                    count: many.len(),
                })
            }
        }
    }
    Ok(None)
}

/// Decode attachment bytes as CSV. Trailing blank rows are dropped and ragged
/// rows padded.
pub fn parse_csv(attachment: &Attachment) -> Result<Vec<Row>, TransferError> {
    let parse_err = |reason: String| TransferError::Parse {
        name: attachment.name.clone(),
        reason,
    };
    let text = decode_text(&attachment.content).map_err(parse_err)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| parse_err(e.to_string()))?;
        rows.push(record.iter().map(str::to_string).collect::<Row>());
    }
    rows.truncate(last_row(&rows));
    Ok(normalize_rows(rows))
}

impl MethodStrategy for EmailStrategy {
    fn method(&self) -> Method {
        Method::Email
    }

    fn execute(&self, job: &Job, ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError> {
        let Source::Email { query, pattern } = &job.source else {
            return Err(TransferError::UnknownMethod(job.source.method().as_str().to_string()));
        };

        let threads = ctx.mail.search(query).map_err(TransferError::source)?;
        let Some((message, attachment)) = find_attachment(&threads, pattern)? else {
            return Err(TransferError::SourceNotFound(format!(
                "No attachment matching '{}' found for query '{}' ({} threads searched)",
                pattern.as_str(),
                query,
                threads.len()
            )));
        };
        log::info!(
            "Rule {}: using attachment '{}' from '{}' ({})",
            job.rule_id,
            attachment.name,
            message.subject,
            message.from
        );

        let limit = ctx.settings.max_attachment_bytes;
        if limit > 0 && attachment.size_bytes > limit {
            return Err(TransferError::AttachmentTooLarge {
                name: attachment.name.clone(),
                size: attachment.size_bytes,
                limit,
            });
        }

        let rows = parse_csv(attachment)?;
        if rows.is_empty() {
            return Err(TransferError::EmptyAttachment {
                name: attachment.name.clone(),
            });
        }
        check_limits(&rows, ctx.settings)?;

        let written = write_to_destination(job, &rows, ctx)?;
        Ok(TransferStats {
            rows: written,
            columns: column_count(&rows),
            duration_ms: 0,
            file_size_bytes: Some(attachment.size_bytes),
            source_identifier: format!("{} / {}", message.subject, attachment.name),
            destination_id: job.destination.workbook_id.clone(),
        })
    }
}

// ── Sheet import / push ─────────────────────────────────────

/// Copies a tab from another workbook.
pub struct SheetImportStrategy;

/// Copies a tab from the configured active workbook.
pub struct PushStrategy;

/// Copy `tab` of `workbook_id` into the job's destination.
fn transfer_tab(
    job: &Job,
    workbook_id: &str,
    tab: &str,
    ctx: &StrategyContext<'_>,
) -> Result<TransferStats, TransferError> {
    let source = ctx.sheets.open(workbook_id).map_err(TransferError::source)?;
    if source.tab(tab).map_err(TransferError::source)?.is_none() {
        return Err(TransferError::SourceNotFound(format!(
            "Tab '{}' not found in workbook {}",
            tab, workbook_id
        )));
    }

    let (rows, columns) = if job.mode == HandlingMode::CopyFormat {
        copy_with_format(job, source.as_ref(), tab, ctx)?
    } else {
        let mut rows = source.read_rows(tab).map_err(TransferError::source)?;
        rows.truncate(last_row(&rows));
        if rows.is_empty() {
            return Err(TransferError::SourceEmpty { tab: tab.to_string() });
        }
        let rows = normalize_rows(rows);
        check_limits(&rows, ctx.settings)?;
        let written = write_to_destination(job, &rows, ctx)?;
        (written, column_count(&rows))
    };

    Ok(TransferStats {
        rows,
        columns,
        duration_ms: 0,
        file_size_bytes: None,
        source_identifier: format!("{}/{}", workbook_id, tab),
        destination_id: job.destination.workbook_id.clone(),
    })
}

/// Duplicate the source tab with its formatting under a temporary name, then
/// swap it in for the destination tab.
fn copy_with_format(
    job: &Job,
    source: &dyn Workbook,
    tab: &str,
    ctx: &StrategyContext<'_>,
) -> Result<(usize, usize), TransferError> {
    let mut snapshot = source.snapshot(tab).map_err(TransferError::source)?;
    snapshot.rows.truncate(last_row(&snapshot.rows));
    if snapshot.rows.is_empty() {
        return Err(TransferError::SourceEmpty { tab: tab.to_string() });
    }
    check_limits(&snapshot.rows, ctx.settings)?;
    let (rows, columns) = (snapshot.rows.len(), column_count(&snapshot.rows));

    let dest = ctx
        .sheets
        .open(&job.destination.workbook_id)
        .map_err(TransferError::destination)?;
    let target = job.destination.tab.as_str();
    let temp = temporary_tab_name(dest.as_ref(), target)?;

    dest.insert_snapshot(&temp, snapshot)
        .map_err(TransferError::destination)?;
    if dest.tab(target).map_err(TransferError::destination)?.is_some() {
        dest.delete_tab(target).map_err(TransferError::destination)?;
    }
    dest.rename_tab(&temp, target)
        .map_err(TransferError::destination)?;

    Ok((rows, columns))
}

/// A tab name not yet used in `workbook`. Only the target tab is ever
/// replaced, so the staging copy must never collide with another tab.
fn temporary_tab_name(workbook: &dyn Workbook, target: &str) -> Result<String, TransferError> {
    loop {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}~{}", target, &suffix[..8]);
        if workbook.tab(&name).map_err(TransferError::destination)?.is_none() {
            return Ok(name);
        }
    }
}

impl MethodStrategy for SheetImportStrategy {
    fn method(&self) -> Method {
        Method::SheetImport
    }

    fn execute(&self, job: &Job, ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError> {
        let Source::SheetImport { workbook_id, tab } = &job.source else {
            return Err(TransferError::UnknownMethod(job.source.method().as_str().to_string()));
        };
        transfer_tab(job, workbook_id, tab, ctx)
    }
}

impl MethodStrategy for PushStrategy {
    fn method(&self) -> Method {
        Method::Push
    }

    fn execute(&self, job: &Job, ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError> {
        let Source::Push { tab } = &job.source else {
            return Err(TransferError::UnknownMethod(job.source.method().as_str().to_string()));
        };
        let active = ctx
            .settings
            .active_workbook
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(TransferError::NoActiveWorkbook)?;
        let workbook_id = resolver::resolve_resource_id(active)?;
        transfer_tab(job, &workbook_id, tab, ctx)
    }
}
