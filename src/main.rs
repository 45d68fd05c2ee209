//! sheet-relay - rule-driven transfer of mail attachments and sheet tabs into
//! destination worksheets.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use sheet_relay::config::{self, read_file_strip_bom};
use sheet_relay::db::Repository;
use sheet_relay::error::AppError;
use sheet_relay::rules::{self, Rule};
use sheet_relay::scheduler::{self, ScheduleOptions};
use sheet_relay::App;

#[derive(Parser, Debug)]
#[command(name = "sheet-relay", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all active rules, or only the given ones
    Run {
        /// Rule id to run (repeatable)
        #[arg(long = "rule")]
        rules: Vec<String>,
    },
    /// Manage the rule table
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Summaries of recent sessions
    Sessions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Events of one session
    Session { id: String },
    /// Apply log retention and the database size limit
    Prune,
    /// Run all active rules on an interval until interrupted
    Schedule {
        /// Overrides schedule.interval_minutes
        #[arg(long)]
        every_minutes: Option<u32>,
    },
    /// Print the configuration file path
    ConfigPath,
}

#[derive(Subcommand, Debug)]
enum RuleCommands {
    /// List rules with their last result
    List,
    /// Replace the rule table with the rules in a JSON file
    Import { file: PathBuf },
    /// Write the rule table as JSON (stdout when no file is given)
    Export { file: Option<PathBuf> },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    if let Commands::ConfigPath = cli.command {
        println!("{}", config_path.display());
        return;
    }

    if let Err(e) = dispatch(cli.command, &config_path) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn dispatch(command: Commands, config_path: &Path) -> Result<(), AppError> {
    let app = App::open(config::load_config_from(config_path)?)?;

    match command {
        Commands::Run { rules } => {
            install_interrupt_handler(app.engine.cancel_handle());
            cmd_run(&app, rules)
        }
        Commands::Rules { command } => match command {
            RuleCommands::List => cmd_rules_list(&app),
            RuleCommands::Import { file } => cmd_rules_import(&app, &file),
            RuleCommands::Export { file } => cmd_rules_export(&app, file.as_deref()),
        },
        Commands::Sessions { limit } => cmd_sessions(&app, limit),
        Commands::Session { id } => cmd_session(&app, &id),
        Commands::Prune => {
            let report = app.engine.logger().apply_retention();
            let pruned = scheduler::run_maintenance(&app.db, app.config.storage.max_storage_mb);
            println!(
                "Removed {} log entries and {} sessions; {} rows pruned for size",
                report.entries_removed, report.sessions_removed, pruned
            );
            let stats = app.db.get_stats()?;
            println!("Database: {} bytes", stats.db_size_bytes);
            for table in &stats.tables {
                println!("  {:<12} {} rows", table.table_name, table.row_count);
            }
            Ok(())
        }
        Commands::Schedule { every_minutes } => {
            let minutes = every_minutes.unwrap_or(app.config.schedule.interval_minutes).max(1);
            let options = ScheduleOptions {
                interval: Duration::from_secs(minutes as u64 * 60),
                poll_slice: Duration::from_secs(1),
                stale_lock: app.stale_lock_age(),
                max_runs: None,
            };
            install_interrupt_handler(app.engine.cancel_handle());
            log::info!("Scheduling rule runs every {} minutes", minutes);
            let max_mb = app.config.storage.max_storage_mb;
            scheduler::run_scheduled(&app.engine, &app.lock_path(), &options, &|| {
                scheduler::run_maintenance(&app.db, max_mb);
            });
            Ok(())
        }
        Commands::ConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

/// First Ctrl-C stops the run at the next rule boundary; a second one exits.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if cancel.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        eprintln!("Interrupted; finishing the current rule (Ctrl-C again to abort)");
    });
    if let Err(e) = result {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }
}

fn cmd_run(app: &App, ids: Vec<String>) -> Result<(), AppError> {
    let selection = if ids.is_empty() { None } else { Some(ids.as_slice()) };
    let summary =
        scheduler::run_locked(&app.engine, &app.lock_path(), app.stale_lock_age(), selection)?;
    println!(
        "Session {}: {} ({} succeeded, {} failed, {} skipped, {} cancelled, {} rows, {} ms)",
        summary.session_id,
        summary.status().as_str(),
        summary.success_count,
        summary.error_count,
        summary.skipped_count,
        summary.cancelled_count,
        summary.total_rows,
        summary.duration_ms
    );
    if summary.error_count > 0 {
        process::exit(2);
    }
    Ok(())
}

fn cmd_rules_list(app: &App) -> Result<(), AppError> {
    let rules = app.db.load_rules()?;
    if rules.is_empty() {
        println!("No rules configured");
        return Ok(());
    }
    for rule in &rules {
        let last_run = rule
            .status
            .last_run
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<12} {:<8} {:<6} {:<10} {:<20} {}",
            rule.id,
            rule.method,
            if rule.active { "on" } else { "off" },
            rule.status.result.as_str(),
            last_run,
            rule.display_name()
        );
    }
    Ok(())
}

fn cmd_rules_import(app: &App, file: &Path) -> Result<(), AppError> {
    let data = read_file_strip_bom(file)?;
    let rules: Vec<Rule> = serde_json::from_str(&data)?;
    for rule in rules.iter().filter(|r| r.active && !r.is_blank()) {
        if let Err(e) = rules::validate(rule) {
            log::warn!("Rule {} will fail validation: {}", rule.id, e);
        }
    }
    app.db.save_rules(&rules)?;
    println!("Imported {} rules", rules.len());
    Ok(())
}

fn cmd_rules_export(app: &App, file: Option<&Path>) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(&app.db.load_rules()?)?;
    match file {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("Exported rules to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_sessions(app: &App, limit: usize) -> Result<(), AppError> {
    let summaries = app.engine.logger().recent_sessions(limit)?;
    if summaries.is_empty() {
        println!("No sessions recorded");
    }
    for s in summaries {
        println!(
            "{}  {:<12} rules={} ok={} err={} skip={} cancel={} rows={}  {}",
            s.session_id,
            s.status,
            s.rule_count,
            s.success_count,
            s.error_count,
            s.skipped_count,
            s.cancelled_count,
            s.total_rows,
            s.start_time.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_session(app: &App, id: &str) -> Result<(), AppError> {
    let view = app
        .engine
        .logger()
        .session_view(id)?
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;
    println!(
        "Session {}: {} ({} ms)",
        view.session_id,
        view.status.as_str(),
        view.duration_ms
    );
    for event in &view.events {
        println!(
            "  {} {:<10} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type.as_str(),
            event.message
        );
    }
    let counts: Vec<String> = view
        .counts
        .iter()
        .map(|(kind, n)| format!("{}={}", kind, n))
        .collect();
    println!("  {}", counts.join(" "));
    Ok(())
}
