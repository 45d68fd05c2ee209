//! Mail collaborator interface.

use chrono::{DateTime, Utc};

use crate::error::CollaboratorError;

mod eml_dir;
mod memory;
mod query;

pub use eml_dir::EmlDirMailStore;
pub use memory::MemoryMailStore;
pub use query::{parse_query, MailQuery};

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub size_bytes: u64,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            size_bytes: content.len() as u64,
            content,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

/// Messages of one conversation, oldest first.
#[derive(Debug, Clone)]
pub struct MailThread {
    pub id: String,
    pub messages: Vec<MailMessage>,
}

pub trait MailStore: Send + Sync {
    /// Threads matching `query`, newest thread first.
    fn search(&self, query: &str) -> Result<Vec<MailThread>, CollaboratorError>;
}
