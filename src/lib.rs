pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logger;
pub mod mail;
pub mod notify;
pub mod resolver;
pub mod rules;
pub mod scheduler;
pub mod sheets;
pub mod strategy;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::AppConfig;
use db::Database;
use engine::RuleEngine;
use error::AppError;
use mail::EmlDirMailStore;
use notify::{LogNotifier, Notifier, SmtpNotifier};
use sheets::CsvSheetStore;

/// Everything a front end needs, wired from one configuration.
pub struct App {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub engine: RuleEngine,
}

impl App {
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let db = Arc::new(Database::new(&config.storage.database_path())?);
        let notifier: Arc<dyn Notifier> = match &config.smtp {
            Some(smtp) => Arc::new(SmtpNotifier::new(smtp.clone())),
            None => Arc::new(LogNotifier),
        };
        let engine = RuleEngine::new(
            db.clone(),
            Arc::new(CsvSheetStore::new(config.storage.workbooks_root.clone())),
            Arc::new(EmlDirMailStore::new(config.storage.mail_root.clone())),
            notifier,
            config.settings.clone(),
        );
        log::info!(
            "Opened store {} (workbooks: {}, mail: {})",
            config.storage.database_path().display(),
            config.storage.workbooks_root.display(),
            config.storage.mail_root.display()
        );
        Ok(Self { config, db, engine })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.storage.database_path().with_extension("lock")
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.config.schedule.stale_lock_minutes as u64 * 60)
    }
}
