//! Run-completion notifications.

#[cfg(test)]
use std::sync::Mutex;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpSettings;
use crate::error::NotifyError;

pub trait Notifier: Send + Sync {
    fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Substitute `{{key}}` placeholders. Unknown placeholders are left as is.
pub fn render_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Writes notifications to the diagnostic log. Used when no SMTP server is
/// configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        log::info!("Notification to {}: {}\n{}", recipients.join(", "), subject, body);
        Ok(())
    }
}

pub struct SmtpNotifier {
    settings: SmtpSettings,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
        address.parse().map_err(|e: lettre::address::AddressError| NotifyError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(Self::mailbox(&self.settings.from_address)?)
            .subject(subject);
        for recipient in recipients {
            builder = builder.to(Self::mailbox(recipient)?);
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        let creds = Credentials::new(self.settings.username.clone(), self.settings.password());
        let transport = SmtpTransport::relay(&self.settings.host)
            .map_err(|e| NotifyError::Send(format!("SMTP relay error: {}", e)))?
            .port(self.settings.port)
            .credentials(creds)
            .build();

        transport
            .send(&email)
            .map_err(|e| NotifyError::Send(e.to_string()))?;
        log::info!("Notification sent to {}", recipients.join(", "));
        Ok(())
    }
}

/// Keeps every notification in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<String>, String, String)>>,
    fail: Mutex<bool>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        if let Ok(mut flag) = self.fail.lock() {
            *flag = fail;
        }
    }

    /// `(recipients, subject, body)` per notification, oldest first.
    pub fn sent(&self) -> Vec<(Vec<String>, String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(NotifyError::Send("connection refused".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipients.to_vec(), subject.to_string(), body.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders() {
        let out = render_template(
            "{{status}}: {{success_count}} ok, {{missing}}",
            &[("status", "PARTIAL".into()), ("success_count", "2".into())],
        );
        assert_eq!(out, "PARTIAL: 2 ok, {{missing}}");
    }

    #[test]
    fn smtp_rejects_bad_recipient_before_connecting() {
        let notifier = SmtpNotifier::new(SmtpSettings {
            host: "localhost".into(),
            port: 2525,
            username: "u".into(),
            password: Some("p".into()),
            from_address: "relay@example.com".into(),
        });
        let err = notifier
            .send(&["not an address".into()], "s", "b")
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidAddress { .. }));
    }

    #[test]
    fn recording_notifier_keeps_messages() {
        let notifier = RecordingNotifier::new();
        notifier.send(&["a@example.com".into()], "s", "b").unwrap();
        notifier.set_fail(true);
        assert!(notifier.send(&["a@example.com".into()], "s", "b").is_err());
        assert_eq!(notifier.sent().len(), 1);
    }
}
