use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::logger::LogLevel;

/// Get the app data directory: <config dir>/sheet-relay/
pub fn app_data_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sheet-relay");
    fs::create_dir_all(&dir).ok();
    dir
}

pub fn config_path() -> PathBuf {
    app_data_dir().join("config.json")
}

// ── Data types ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

/// Immutable engine configuration, handed to the engine at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Total attempts per rule for retryable failures
    pub retry_attempts: u32,
    /// First backoff delay; doubles after every failed attempt
    pub retry_base_delay_ms: u64,
    /// Entries below this level are dropped (START and terminal entries never are)
    pub min_log_level: LogLevel,
    /// Maximum log entries kept after a run (0 = unlimited)
    pub max_log_entries: usize,
    /// Maximum sessions kept after a run (0 = unlimited)
    pub max_sessions: usize,
    /// Days to keep log entries and sessions (0 = forever)
    pub log_retention_days: u32,
    /// Send a summary email after each run
    pub notifications_enabled: bool,
    pub notification_subject: String,
    pub notification_body: String,
    /// Workbook id used as the source of push rules
    pub active_workbook: Option<String>,
    pub max_attachment_bytes: u64,
    pub max_rows: usize,
    pub max_columns: usize,
    pub max_cells: usize,
    /// Resize destination columns to fit after writing
    pub autofit_columns: bool,
}

pub const DEFAULT_SUBJECT: &str = "Sheet relay run {{status}}: {{success_count}} ok, {{error_count}} failed";

pub const DEFAULT_BODY: &str = "Session {{session_id}} finished with status {{status}}.\n\n\
Succeeded: {{success_count}}\n\
Failed: {{error_count}}\n\
Skipped: {{skipped_count}}\n\
Rows written: {{total_rows}}\n\
Elapsed: {{duration}}\n";

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            min_log_level: LogLevel::Info,
            max_log_entries: 5000,
            max_sessions: 200,
            log_retention_days: 30,
            notifications_enabled: true,
            notification_subject: DEFAULT_SUBJECT.to_string(),
            notification_body: DEFAULT_BODY.to_string(),
            active_workbook: None,
            max_attachment_bytes: 25 * 1024 * 1024,
            max_rows: 1_000_000,
            max_columns: 18_278,
            max_cells: 10_000_000,
            autofit_columns: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite file for rules, sessions and log entries (defaults to the app dir)
    pub database_path: Option<PathBuf>,
    /// Directory holding one sub-directory per workbook
    pub workbooks_root: PathBuf,
    /// Directory of .eml files searched by email rules
    pub mail_root: PathBuf,
    /// Maximum database size in MB (0 = unlimited)
    pub max_storage_mb: u32,
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| app_data_dir().join("data.db"))
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        let base = app_data_dir();
        Self {
            database_path: None,
            workbooks_root: base.join("workbooks"),
            mail_root: base.join("mail"),
            max_storage_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Minutes between scheduled runs
    pub interval_minutes: u32,
    /// A run lock older than this is considered abandoned
    pub stale_lock_minutes: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            stale_lock_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    /// Falls back to the SHEET_RELAY_SMTP_PASSWORD environment variable
    #[serde(default)]
    pub password: Option<String>,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl SmtpSettings {
    pub fn password(&self) -> String {
        self.password
            .clone()
            .or_else(|| std::env::var("SHEET_RELAY_SMTP_PASSWORD").ok())
            .unwrap_or_default()
    }
}

// ── Load / Save ─────────────────────────────────────────────

/// Read a file to string, handling BOM (UTF-8 BOM and UTF-16 LE/BE).
pub fn read_file_strip_bom(path: &Path) -> Result<String, ConfigError> {
    let raw = fs::read(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    decode_text(&raw).map_err(|reason| ConfigError::Read {
        path: path.display().to_string(),
        reason,
    })
}

/// Decode bytes to text, honouring a leading BOM. Shared with attachment decoding.
pub fn decode_text(raw: &[u8]) -> Result<String, String> {
    // UTF-16 LE BOM: FF FE
    if raw.len() >= 2 && raw[0] == 0xFF && raw[1] == 0xFE {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16(&units).map_err(|e| format!("Invalid UTF-16 LE: {}", e));
    }

    // UTF-16 BE BOM: FE FF
    if raw.len() >= 2 && raw[0] == 0xFE && raw[1] == 0xFF {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16(&units).map_err(|e| format!("Invalid UTF-16 BE: {}", e));
    }

    // UTF-8 BOM: EF BB BF
    let text = std::str::from_utf8(raw).map_err(|e| format!("Invalid UTF-8: {}", e))?;
    Ok(text.strip_prefix('\u{FEFF}').unwrap_or(text).to_string())
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if path.exists() {
        let data = read_file_strip_bom(path)?;
        Ok(serde_json::from_str(&data)?)
    } else {
        let config = AppConfig::default();
        if let Err(e) = save_config_to(path, &config) {
            log::warn!("Could not write default config to {}: {}", path.display(), e);
        }
        Ok(config)
    }
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_path())
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.settings.retry_attempts, 3);
        assert!(path.exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            "\u{FEFF}{\"settings\": {\"retry_attempts\": 5, \"min_log_level\": \"WARNING\"}}",
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.settings.retry_attempts, 5);
        assert_eq!(config.settings.min_log_level, LogLevel::Warning);
        assert_eq!(config.settings.retry_base_delay_ms, 1000);
        assert!(config.smtp.is_none());
    }

    #[test]
    fn decodes_utf16_le() {
        let mut raw = vec![0xFF, 0xFE];
        for unit in "a,b".encode_utf16() {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&raw).unwrap(), "a,b");
    }
}
