//! A mailbox backed by a directory of `.eml` files.
//!
//! Messages are grouped into threads by subject with reply/forward prefixes
//! removed, which is close enough to how mail clients thread for the purpose
//! of picking an attachment.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use super::{parse_query, Attachment, MailMessage, MailStore, MailThread};
use crate::error::{CollaboratorError, FailureHint};

pub struct EmlDirMailStore {
    root: PathBuf,
}

impl EmlDirMailStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load_messages(&self) -> Result<Vec<MailMessage>, CollaboratorError> {
        if !self.root.is_dir() {
            return Err(CollaboratorError::with_hint(
                format!("Mail directory {} does not exist", self.root.display()),
                FailureHint::NotFound,
            ));
        }
        let mut messages = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = match entry {
                Ok(e) => e.path(),
                Err(_) => continue,
            };
            if path.extension().and_then(|e| e.to_str()) != Some("eml") {
                continue;
            }
            match parse_eml(&path) {
                Some(message) => messages.push(message),
                None => log::warn!("Skipping unparseable message {}", path.display()),
            }
        }
        Ok(messages)
    }
}

fn parse_eml(path: &Path) -> Option<MailMessage> {
    let raw = fs::read(path).ok()?;
    let parsed = MessageParser::default().parse(&raw)?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .unwrap_or("unknown")
        .to_string();
    let received_at = parsed
        .date()
        .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
        .or_else(|| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })
        .unwrap_or_else(Utc::now);
    let id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| path.file_name().unwrap_or_default().to_string_lossy().to_string());

    let attachments = parsed
        .attachments()
        .map(|part| {
            let name = MimeHeaders::attachment_name(part)
                .unwrap_or("attachment")
                .to_string();
            Attachment::new(name, part.contents().to_vec())
        })
        .collect();

    Some(MailMessage {
        id,
        subject: parsed.subject().unwrap_or_default().to_string(),
        from,
        received_at,
        attachments,
    })
}

/// Subject with any leading `Re:` / `Fwd:` / `Fw:` prefixes removed, lowercased.
fn thread_key(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|p| lower.starts_with(*p))
            .map(|p| s[p.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => return lower,
        }
    }
}

impl MailStore for EmlDirMailStore {
    fn search(&self, query: &str) -> Result<Vec<MailThread>, CollaboratorError> {
        let parsed = parse_query(query);
        let mut threads: HashMap<String, Vec<MailMessage>> = HashMap::new();
        for message in self.load_messages()? {
            threads
                .entry(thread_key(&message.subject))
                .or_default()
                .push(message);
        }

        let mut found: Vec<MailThread> = threads
            .into_iter()
            .filter(|(_, msgs)| msgs.iter().any(|m| parsed.matches(m)))
            .map(|(key, mut messages)| {
                messages.sort_by_key(|m| m.received_at);
                MailThread { id: key, messages }
            })
            .collect();
        found.sort_by_key(|t| Reverse(t.messages.last().map(|m| m.received_at)));
        Ok(found)
    }
}
