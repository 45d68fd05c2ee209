//! Rule execution engine.
//!
//! One call to [`RuleEngine::run`] is one session: every selected rule is
//! validated, dispatched through the strategy table, retried when the failure
//! is transient and given a terminal status. A failing or panicking rule never
//! stops the rules after it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::config::EngineSettings;
use crate::db::Repository;
use crate::error::{EngineError, TransferError};
use crate::logger::{
    self, EntryStatus, EventType, LogEntry, LogLevel, SessionLogger, SESSION_RULE_ID,
};
use crate::mail::MailStore;
use crate::notify::{render_template, Notifier};
use crate::rules::{self, collect_recipients, Job, Rule, RuleStatus, RunResult};
use crate::sheets::SheetStore;
use crate::strategy::{StrategyContext, StrategyTable, TransferStats};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    pub cancelled_count: usize,
    pub total_rows: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Status of the SESSION completion entry.
    pub fn status(&self) -> EntryStatus {
        if self.error_count == 0 {
            EntryStatus::Success
        } else if self.success_count == 0 {
            EntryStatus::Error
        } else {
            EntryStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success(usize),
    Error,
    Skipped,
    Cancelled,
}

/// Delay before retry number `attempt` (1-based attempt that just failed).
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct RuleEngine {
    repo: Arc<dyn Repository>,
    sheets: Arc<dyn SheetStore>,
    mail: Arc<dyn MailStore>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
    strategies: StrategyTable,
    logger: SessionLogger,
    cancel: Arc<AtomicBool>,
}

impl RuleEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        sheets: Arc<dyn SheetStore>,
        mail: Arc<dyn MailStore>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        let logger = SessionLogger::new(repo.clone(), &settings);
        Self {
            repo,
            sheets,
            mail,
            notifier,
            settings,
            strategies: StrategyTable::default(),
            logger,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    /// Setting the flag stops the run at the next rule or retry boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn logger(&self) -> &SessionLogger {
        &self.logger
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run all active rules, or exactly the rules named in `rule_ids`.
    pub fn run(&self, rule_ids: Option<&[String]>) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let session_id = logger::new_session_id();
        let rules = self.repo.load_rules().map_err(EngineError::LoadRules)?;

        self.logger
            .log_event(&session_id, EventType::Start, "Rule run started");
        self.logger.log_entry(LogEntry::new(
            &session_id,
            SESSION_RULE_ID,
            LogLevel::Info,
            EntryStatus::Start,
            "Session started",
        ));

        let selected: Vec<&Rule> = match rule_ids {
            None => rules.iter().filter(|r| r.active).collect(),
            Some(ids) => {
                for id in ids {
                    if !rules.iter().any(|r| &r.id == id) {
                        self.logger.log_event(
                            &session_id,
                            EventType::Warning,
                            &format!("Rule {} not found", id),
                        );
                    }
                }
                rules.iter().filter(|r| ids.contains(&r.id)).collect()
            }
        };

        let mut summary = RunSummary {
            session_id: session_id.clone(),
            ..Default::default()
        };

        for (index, rule) in selected.iter().enumerate() {
            if self.cancelled() {
                let remaining = selected.len() - index;
                summary.cancelled_count += remaining;
                self.logger.log_event(
                    &session_id,
                    EventType::Warning,
                    &format!("Run cancelled; {} rule(s) not processed", remaining),
                );
                break;
            }
            match self.process_rule(&session_id, rule) {
                Outcome::Success(rows) => {
                    summary.success_count += 1;
                    summary.total_rows += rows;
                }
                Outcome::Error => summary.error_count += 1,
                Outcome::Skipped => summary.skipped_count += 1,
                Outcome::Cancelled => summary.cancelled_count += 1,
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.finish_session(&summary);
        self.notify(&summary, &rules);
        self.logger.apply_retention();
        Ok(summary)
    }

    fn finish_session(&self, summary: &RunSummary) {
        let status = summary.status();
        let message = format!(
            "Run finished: {} succeeded, {} failed, {} skipped, {} cancelled, {} rows",
            summary.success_count,
            summary.error_count,
            summary.skipped_count,
            summary.cancelled_count,
            summary.total_rows
        );
        let level = match status {
            EntryStatus::Success => LogLevel::Info,
            EntryStatus::Partial => LogLevel::Warning,
            _ => LogLevel::Error,
        };
        let mut entry = LogEntry::new(&summary.session_id, SESSION_RULE_ID, level, status, &message);
        entry.execution_time_ms = Some(summary.duration_ms);
        entry.rows_processed = Some(summary.total_rows);
        entry.metadata = serde_json::to_value(summary).ok();
        self.logger.log_entry(entry);

        let event_type = if status == EntryStatus::Success {
            EventType::Success
        } else {
            EventType::Info
        };
        self.logger.log_event(&summary.session_id, event_type, &message);
    }

    /// Send the summary to every recipient listed on an active rule.
    fn notify(&self, summary: &RunSummary, rules: &[Rule]) {
        if !self.settings.notifications_enabled {
            return;
        }
        let recipients = collect_recipients(rules.iter().filter(|r| r.active));
        if recipients.is_empty() {
            return;
        }
        let vars = [
            ("status", summary.status().as_str().to_string()),
            ("success_count", summary.success_count.to_string()),
            ("error_count", summary.error_count.to_string()),
            ("skipped_count", summary.skipped_count.to_string()),
            ("total_rows", summary.total_rows.to_string()),
            (
                "duration",
                format!("{:.1}s", summary.duration_ms as f64 / 1000.0),
            ),
            ("session_id", summary.session_id.clone()),
        ];
        let subject = render_template(&self.settings.notification_subject, &vars);
        let body = render_template(&self.settings.notification_body, &vars);
        if let Err(e) = self.notifier.send(&recipients, &subject, &body) {
            log::warn!("Failed to send run notification: {}", e);
            self.logger.log_event(
                &summary.session_id,
                EventType::Warning,
                &format!("Notification failed: {}", e),
            );
        }
    }

    fn set_status(&self, rule: &Rule, result: RunResult, message: &str) {
        let status = RuleStatus {
            last_run: Some(Utc::now()),
            result,
            message: message.to_string(),
        };
        match self.repo.update_rule_status(&rule.id, &status) {
            Ok(true) => {}
            Ok(false) => log::warn!("Rule {} disappeared before its status was saved", rule.id),
            Err(e) => log::error!("Failed to save status of rule {}: {}", rule.id, e),
        }
    }

    fn process_rule(&self, session_id: &str, rule: &Rule) -> Outcome {
        let name = rule.display_name();

        if !rule.active || rule.is_blank() {
            let reason = if rule.active { "Rule is blank" } else { "Rule is inactive" };
            self.logger
                .log_event(session_id, EventType::Skipped, &format!("{}: {}", name, reason));
            self.logger.log_entry(LogEntry::new(
                session_id,
                &rule.id,
                LogLevel::Info,
                EntryStatus::Skipped,
                reason,
            ));
            self.set_status(rule, RunResult::Skipped, reason);
            return Outcome::Skipped;
        }

        self.logger
            .log_event(session_id, EventType::Processing, &format!("Processing {}", name));

        let job = match rules::validate(rule) {
            Ok(job) => job,
            Err(e) => {
                let message = e.to_string();
                let mut entry = self.failure_entry(session_id, &rule.id, &e, LogLevel::Error);
                entry.source_type = Some(rule.method.clone());
                self.logger.log_entry(entry);
                self.logger
                    .log_event(session_id, EventType::Error, &format!("{}: {}", name, message));
                self.set_status(rule, RunResult::Error, &message);
                return Outcome::Error;
            }
        };

        if let Some(warning) = &job.mode_warning {
            self.logger.log_event(session_id, EventType::Warning, warning);
            self.logger.log_entry(LogEntry::new(
                session_id,
                &rule.id,
                LogLevel::Warning,
                EntryStatus::Warning,
                warning.as_str(),
            ));
        }

        self.attempt(session_id, rule, &job)
    }

    fn attempt(&self, session_id: &str, rule: &Rule, job: &Job) -> Outcome {
        let name = rule.display_name();
        let max_attempts = self.settings.retry_attempts.max(1);
        let ctx = StrategyContext {
            sheets: self.sheets.as_ref(),
            mail: self.mail.as_ref(),
            settings: &self.settings,
        };

        for attempt in 1..=max_attempts {
            if attempt > 1 && self.cancelled() {
                let message = format!("Cancelled before attempt {}", attempt);
                let mut entry = self.job_entry(session_id, job, LogLevel::Warning, EntryStatus::Cancelled, &message);
                entry.retry_attempt = Some(attempt);
                self.logger.log_entry(entry);
                self.logger
                    .log_event(session_id, EventType::Cancelled, &format!("{}: {}", name, message));
                self.set_status(rule, RunResult::Cancelled, &message);
                return Outcome::Cancelled;
            }

            let mut start = self.job_entry(
                session_id,
                job,
                LogLevel::Info,
                EntryStatus::Start,
                &format!("Attempt {} of {}", attempt, max_attempts),
            );
            start.retry_attempt = Some(attempt);
            self.logger.log_entry(start);

            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.strategies.execute(job, &ctx)))
                .unwrap_or_else(|payload| Err(TransferError::Panicked(panic_message(payload))));

            match result {
                Ok(stats) => {
                    self.record_success(session_id, rule, job, attempt, &stats);
                    return Outcome::Success(stats.rows);
                }
                Err(e) => {
                    let will_retry = e.is_retryable() && attempt < max_attempts;
                    let level = if will_retry { LogLevel::Warning } else { LogLevel::Error };
                    let mut entry = self.failure_entry(session_id, &rule.id, &e, level);
                    self.fill_job_fields(&mut entry, job);
                    entry.retry_attempt = Some(attempt);
                    entry.execution_time_ms = Some(started.elapsed().as_millis() as u64);
                    self.logger.log_entry(entry);

                    if will_retry {
                        let delay = backoff_delay(self.settings.retry_base_delay_ms, attempt);
                        self.logger.log_event(
                            session_id,
                            EventType::Warning,
                            &format!(
                                "{}: attempt {} of {} failed ({}); retrying in {} ms",
                                name,
                                attempt,
                                max_attempts,
                                e,
                                delay.as_millis()
                            ),
                        );
                        std::thread::sleep(delay);
                        continue;
                    }

                    let message = e.to_string();
                    self.logger
                        .log_event(session_id, EventType::Error, &format!("{}: {}", name, message));
                    self.set_status(rule, RunResult::Error, &message);
                    return Outcome::Error;
                }
            }
        }

        // max_attempts >= 1, so every path above returns.
        Outcome::Error
    }

    fn record_success(&self, session_id: &str, rule: &Rule, job: &Job, attempt: u32, stats: &TransferStats) {
        let message = format!(
            "Wrote {} rows x {} columns to {}/{}",
            stats.rows, stats.columns, stats.destination_id, job.destination.tab
        );
        let mut entry = self.job_entry(session_id, job, LogLevel::Info, EntryStatus::Success, &message);
        entry.retry_attempt = Some(attempt);
        entry.execution_time_ms = Some(stats.duration_ms);
        entry.rows_processed = Some(stats.rows);
        entry.columns_processed = Some(stats.columns);
        entry.file_size_bytes = stats.file_size_bytes;
        entry.source_identifier = Some(stats.source_identifier.clone());
        entry.destination_id = Some(stats.destination_id.clone());
        self.logger.log_entry(entry);
        self.logger.log_event(
            session_id,
            EventType::Success,
            &format!("{}: {}", rule.display_name(), message),
        );
        self.set_status(rule, RunResult::Success, &message);
    }

    fn job_entry(
        &self,
        session_id: &str,
        job: &Job,
        level: LogLevel,
        status: EntryStatus,
        message: &str,
    ) -> LogEntry {
        let mut entry = LogEntry::new(session_id, &job.rule_id, level, status, message);
        self.fill_job_fields(&mut entry, job);
        entry
    }

    fn fill_job_fields(&self, entry: &mut LogEntry, job: &Job) {
        entry.source_type = Some(job.source.method().as_str().to_string());
        if entry.source_identifier.is_none() {
            entry.source_identifier = Some(job.source.identifier());
        }
        entry.destination_id = Some(job.destination.workbook_id.clone());
        entry.destination_tab = Some(job.destination.tab.clone());
        entry.processing_mode = Some(job.mode.as_str().to_string());
    }

    fn failure_entry(
        &self,
        session_id: &str,
        rule_id: &str,
        err: &TransferError,
        level: LogLevel,
    ) -> LogEntry {
        let class = logger::classify(err);
        let mut entry = LogEntry::new(session_id, rule_id, level, EntryStatus::Error, err.to_string());
        entry.error_code = Some(class.code.as_str().to_string());
        entry.error_type = Some(class.kind.as_str().to_string());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use crate::error::{CollaboratorError, FailureHint};
    use crate::logger::{session_status, SessionStatus};
    use crate::mail::MemoryMailStore;
    use crate::notify::RecordingNotifier;
    use crate::rules::tests::sheet_rule;
    use crate::rules::{HandlingMode, Method};
    use crate::sheets::{MemorySheetStore, Row};
    use crate::strategy::MethodStrategy;
    use std::sync::atomic::AtomicUsize;

    type Behaviour = dyn Fn(&Job) -> Result<TransferStats, TransferError> + Send + Sync;

    /// Sheet-import stand-in driven by a closure.
    struct Scripted {
        calls: Arc<AtomicUsize>,
        behaviour: Box<Behaviour>,
    }

    impl MethodStrategy for Scripted {
        fn method(&self) -> Method {
            Method::SheetImport
        }

        fn execute(&self, job: &Job, _ctx: &StrategyContext<'_>) -> Result<TransferStats, TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behaviour)(job)
        }
    }

    fn ok_stats(rows: usize) -> Result<TransferStats, TransferError> {
        Ok(TransferStats {
            rows,
            columns: 2,
            destination_id: "dest-book".into(),
            ..Default::default()
        })
    }

    struct Harness {
        repo: Arc<MemoryRepository>,
        sheets: Arc<MemorySheetStore>,
        notifier: Arc<RecordingNotifier>,
        calls: Arc<AtomicUsize>,
        engine: RuleEngine,
    }

    fn harness(rules: Vec<Rule>, behaviour: Option<Box<Behaviour>>) -> Harness {
        let repo = Arc::new(MemoryRepository::with_rules(rules));
        let sheets = Arc::new(MemorySheetStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let settings = EngineSettings {
            retry_base_delay_ms: 0,
            ..Default::default()
        };
        let mut engine = RuleEngine::new(
            repo.clone(),
            sheets.clone(),
            Arc::new(MemoryMailStore::new()),
            notifier.clone(),
            settings,
        );
        if let Some(behaviour) = behaviour {
            let mut table = StrategyTable::default();
            table.register(Box::new(Scripted {
                calls: calls.clone(),
                behaviour,
            }));
            engine = engine.with_strategies(table);
        }
        Harness {
            repo,
            sheets,
            notifier,
            calls,
            engine,
        }
    }

    fn status_of(repo: &MemoryRepository, id: &str) -> RuleStatus {
        repo.load_rules()
            .unwrap()
            .into_iter()
            .find(|r| r.id == id)
            .unwrap()
            .status
    }

    #[test]
    fn failing_rules_do_not_stop_the_run() {
        let rules = vec![
            sheet_rule("r1", "A", "Out1", "clearAndReuse"),
            sheet_rule("r2", "B", "Out2", "clearAndReuse"),
            sheet_rule("r3", "C", "Out3", "clearAndReuse"),
        ];
        let h = harness(
            rules,
            Some(Box::new(|job: &Job| match job.rule_id.as_str() {
                "r1" => panic!("strategy blew up"),
                "r2" => Err(TransferError::destination(CollaboratorError::new("disk full"))),
                _ => ok_stats(4),
            })),
        );

        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.status(), EntryStatus::Partial);

        assert_eq!(status_of(&h.repo, "r1").result, RunResult::Error);
        assert!(status_of(&h.repo, "r1").message.contains("strategy blew up"));
        assert_eq!(status_of(&h.repo, "r2").message, "disk full");
        assert_eq!(status_of(&h.repo, "r3").result, RunResult::Success);

        let entries = h.repo.load_log_entries().unwrap();
        let completion = entries
            .iter()
            .rev()
            .find(|e| e.rule_id == SESSION_RULE_ID)
            .unwrap();
        assert_eq!(completion.status, EntryStatus::Partial);

        for rule in ["r1", "r2", "r3"] {
            let of_rule: Vec<&LogEntry> = entries.iter().filter(|e| e.rule_id == rule).collect();
            assert!(of_rule.iter().any(|e| e.status == EntryStatus::Start));
            assert!(of_rule.iter().any(|e| e.status.is_terminal()));
            assert!(of_rule.iter().all(|e| e.session_id == summary.session_id));
        }
    }

    #[test]
    fn retryable_failure_hits_the_ceiling() {
        let h = harness(
            vec![sheet_rule("r1", "A", "Out", "clearAndReuse")],
            Some(Box::new(|_: &Job| {
                Err(TransferError::source(CollaboratorError::with_hint(
                    "upstream slow",
                    FailureHint::Timeout,
                )))
            })),
        );
        let summary = h.engine.run(None).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.status(), EntryStatus::Error);

        let failures: Vec<LogEntry> = h
            .repo
            .load_log_entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.rule_id == "r1" && e.status == EntryStatus::Error)
            .collect();
        let attempts: Vec<Option<u32>> = failures.iter().map(|e| e.retry_attempt).collect();
        assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(failures[2].error_code.as_deref(), Some("SYSTEM_TIMEOUT"));
        assert_eq!(status_of(&h.repo, "r1").result, RunResult::Error);
    }

    #[test]
    fn non_retryable_failure_is_attempted_once() {
        let h = harness(
            vec![sheet_rule("r1", "A", "Out", "clearAndReuse")],
            Some(Box::new(|_: &Job| {
                Err(TransferError::SourceEmpty { tab: "A".into() })
            })),
        );
        h.engine.run(None).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validation_errors_are_terminal() {
        let mut bad = sheet_rule("r1", "A", "Out", "clearAndReuse");
        bad.method = "ftp".into();
        let h = harness(vec![bad], Some(Box::new(|_: &Job| ok_stats(1))));
        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.error_count, 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        let entry = h
            .repo
            .load_log_entries()
            .unwrap()
            .into_iter()
            .find(|e| e.rule_id == "r1")
            .unwrap();
        assert_eq!(entry.error_code.as_deref(), Some("VALIDATION_INVALID_METHOD"));
        assert_eq!(entry.error_type.as_deref(), Some("VALIDATION"));
    }

    #[test]
    fn cancel_between_retries_marks_rule_cancelled() {
        let rules = vec![sheet_rule("r1", "A", "Out", "clearAndReuse")];
        let h = harness(rules, None);
        let cancel = h.engine.cancel_handle();
        let mut table = StrategyTable::default();
        table.register(Box::new(Scripted {
            calls: h.calls.clone(),
            behaviour: Box::new(move |_: &Job| {
                cancel.store(true, Ordering::SeqCst);
                Err(TransferError::destination(CollaboratorError::with_hint(
                    "429",
                    FailureHint::RateLimited,
                )))
            }),
        }));
        let engine = h.engine.with_strategies(table);

        let summary = engine.run(None).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.cancelled_count, 1);
        assert_eq!(status_of(&h.repo, "r1").result, RunResult::Cancelled);
    }

    #[test]
    fn cancel_between_rules_leaves_rest_untouched() {
        let rules = vec![
            sheet_rule("r1", "A", "Out1", "clearAndReuse"),
            sheet_rule("r2", "B", "Out2", "clearAndReuse"),
        ];
        let h = harness(rules, None);
        let cancel = h.engine.cancel_handle();
        let mut table = StrategyTable::default();
        table.register(Box::new(Scripted {
            calls: h.calls.clone(),
            behaviour: Box::new(move |_: &Job| {
                cancel.store(true, Ordering::SeqCst);
                ok_stats(1)
            }),
        }));
        let engine = h.engine.with_strategies(table);

        let summary = engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.cancelled_count, 1);
        assert_eq!(status_of(&h.repo, "r2").result, RunResult::New);
    }

    #[test]
    fn explicit_ids_skip_inactive_and_warn_on_unknown() {
        let mut inactive = sheet_rule("r2", "B", "Out2", "clearAndReuse");
        inactive.active = false;
        let h = harness(
            vec![sheet_rule("r1", "A", "Out1", "clearAndReuse"), inactive],
            Some(Box::new(|_: &Job| ok_stats(2))),
        );
        let ids = vec!["r2".to_string(), "ghost".to_string()];
        let summary = h.engine.run(Some(&ids)).unwrap();
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.success_count, 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(status_of(&h.repo, "r2").result, RunResult::Skipped);

        let session = h.repo.load_sessions().unwrap().pop().unwrap();
        assert!(session
            .events
            .iter()
            .any(|e| e.event_type == EventType::Warning && e.message.contains("ghost")));
        assert_eq!(session_status(&session.events), SessionStatus::CompleteWithWarnings);
    }

    #[test]
    fn defaulted_handling_mode_warns_and_still_runs() {
        let mut missing = sheet_rule("r1", "A", "Out1", "clearAndReuse");
        missing.handling_mode = None;
        let unknown = sheet_rule("r2", "B", "Out2", "overwriteAll");
        let h = harness(
            vec![missing, unknown],
            Some(Box::new(|job: &Job| {
                assert_eq!(job.mode, HandlingMode::ClearAndReuse);
                ok_stats(3)
            })),
        );

        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 2);
        assert_eq!(status_of(&h.repo, "r1").result, RunResult::Success);
        assert_eq!(status_of(&h.repo, "r2").result, RunResult::Success);

        let session = h.repo.load_sessions().unwrap().pop().unwrap();
        let warnings: Vec<&str> = session
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Warning)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|m| m.contains("clearAndReuse")));
        assert!(warnings.iter().any(|m| m.contains("overwriteAll")));

        let entries = h.repo.load_log_entries().unwrap();
        for rule in ["r1", "r2"] {
            assert!(entries.iter().any(|e| e.rule_id == rule
                && e.status == EntryStatus::Warning
                && e.level == LogLevel::Warning));
        }
    }

    #[test]
    fn append_to_empty_destination_through_the_engine() {
        let h = harness(vec![sheet_rule("r1", "Data", "All", "append")], None);
        let data: Vec<Row> = [["id", "v"], ["1", "a"], ["2", "b"], ["3", "c"], ["4", "d"]]
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        h.sheets.put_tab("src-book", "Data", data.clone());
        h.sheets.put_tab("dest-book", "All", Vec::new());

        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.total_rows, 5);
        assert_eq!(h.sheets.rows("dest-book", "All").unwrap(), data);
    }

    #[test]
    fn notification_goes_to_active_rule_recipients() {
        let mut a = sheet_rule("r1", "A", "Out1", "clearAndReuse");
        a.email_recipients = Some("ops@example.com, Lead@example.com".into());
        let mut b = sheet_rule("r2", "B", "Out2", "clearAndReuse");
        b.email_recipients = Some("lead@example.com".into());
        let mut c = sheet_rule("r3", "C", "Out3", "clearAndReuse");
        c.active = false;
        c.email_recipients = Some("nobody@example.com".into());

        let h = harness(vec![a, b, c], Some(Box::new(|_: &Job| ok_stats(1))));
        h.engine.run(None).unwrap();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            vec!["ops@example.com".to_string(), "Lead@example.com".to_string()]
        );
        assert!(sent[0].1.contains("SUCCESS"));
    }

    #[test]
    fn notification_failure_is_only_a_warning() {
        let mut a = sheet_rule("r1", "A", "Out1", "clearAndReuse");
        a.email_recipients = Some("ops@example.com".into());
        let h = harness(vec![a], Some(Box::new(|_: &Job| ok_stats(1))));
        h.notifier.set_fail(true);
        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        let session = h.repo.load_sessions().unwrap().pop().unwrap();
        assert!(session
            .events
            .iter()
            .any(|e| e.event_type == EventType::Warning && e.message.contains("Notification")));
    }

    #[test]
    fn end_to_end_sheet_import_with_real_strategies() {
        let h = harness(vec![sheet_rule("r1", "Data", "Copy", "recreate")], None);
        h.sheets.put_tab(
            "src-book",
            "Data",
            vec![
                vec!["id".into(), "v".into()],
                vec!["1".into(), "a".into()],
            ],
        );
        h.sheets.add_workbook("dest-book");

        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.total_rows, 2);
        assert_eq!(h.sheets.rows("dest-book", "Copy").unwrap().len(), 2);

        let recent = h.engine.logger().recent_sessions(5).unwrap();
        assert_eq!(recent[0].session_id, summary.session_id);
        assert_eq!(recent[0].status, "SUCCESS");
        assert_eq!(recent[0].total_rows, 2);
    }

    #[test]
    fn log_store_outage_does_not_abort_rules() {
        let h = harness(
            vec![sheet_rule("r1", "A", "Out", "clearAndReuse")],
            Some(Box::new(|_: &Job| ok_stats(3))),
        );
        h.repo.set_fail_log_writes(true);
        let summary = h.engine.run(None).unwrap();
        assert_eq!(summary.success_count, 1);
        assert_eq!(status_of(&h.repo, "r1").result, RunResult::Success);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 3), Duration::from_millis(4000));
    }
}
