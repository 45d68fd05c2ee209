use std::cmp::Reverse;
use std::sync::RwLock;

use super::{parse_query, MailMessage, MailStore, MailThread};
use crate::error::CollaboratorError;

/// In-memory mailbox. Search returns every thread with at least one matching
/// message, complete, newest thread first.
#[derive(Debug, Default)]
pub struct MemoryMailStore {
    threads: RwLock<Vec<MailThread>>,
    failure: RwLock<Option<CollaboratorError>>,
}

impl MemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, id: &str, messages: Vec<MailMessage>) {
        self.threads.write().unwrap().push(MailThread {
            id: id.to_string(),
            messages,
        });
    }

    /// Make every search fail with `err` (None clears it).
    pub fn fail_searches(&self, err: Option<CollaboratorError>) {
        *self.failure.write().unwrap() = err;
    }
}

impl MailStore for MemoryMailStore {
    fn search(&self, query: &str) -> Result<Vec<MailThread>, CollaboratorError> {
        if let Some(err) = self.failure.read().unwrap().clone() {
            return Err(err);
        }
        let parsed = parse_query(query);
        let mut found: Vec<MailThread> = self
            .threads
            .read()
            .unwrap()
            .iter()
            .filter(|t| t.messages.iter().any(|m| parsed.matches(m)))
            .cloned()
            .collect();
        found.sort_by_key(|t| Reverse(t.messages.iter().map(|m| m.received_at).max()));
        Ok(found)
    }
}
