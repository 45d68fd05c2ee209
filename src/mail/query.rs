//! Gmail-style search subset understood by the local mail stores:
//! free-text terms (matched against the subject), `from:`, `subject:`,
//! `filename:` and `has:attachment`. Values may be quoted.

use super::MailMessage;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailQuery {
    pub terms: Vec<String>,
    pub from: Vec<String>,
    pub subject: Vec<String>,
    pub filename: Vec<String>,
    pub has_attachment: bool,
}

impl MailQuery {
    /// All parts must match, case-insensitively.
    pub fn matches(&self, message: &MailMessage) -> bool {
        let subject = message.subject.to_lowercase();
        let from = message.from.to_lowercase();

        if self.has_attachment && message.attachments.is_empty() {
            return false;
        }
        if !self.terms.iter().all(|t| subject.contains(t.as_str())) {
            return false;
        }
        if !self.subject.iter().all(|t| subject.contains(t.as_str())) {
            return false;
        }
        if !self.from.iter().all(|t| from.contains(t.as_str())) {
            return false;
        }
        self.filename.iter().all(|t| {
            message
                .attachments
                .iter()
                .any(|a| a.name.to_lowercase().contains(t.as_str()))
        })
    }
}

/// Parse a query; unknown operators are treated as free text.
pub fn parse_query(input: &str) -> MailQuery {
    let mut query = MailQuery::default();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let (token, consumed) = read_token(&chars[i..]);
        i += consumed;

        let Some((key, value)) = token.split_once(':') else {
            query.terms.push(token.to_lowercase());
            continue;
        };
        let value = value.trim_matches('"').to_lowercase();
        match key.to_lowercase().as_str() {
            "from" => query.from.push(value),
            "subject" => query.subject.push(value),
            "filename" => query.filename.push(value),
            "has" if value == "attachment" => query.has_attachment = true,
            _ => query.terms.push(token.to_lowercase()),
        }
    }

    query
}

/// Read one whitespace-delimited token, keeping quoted runs together.
fn read_token(chars: &[char]) -> (String, usize) {
    let mut out = String::new();
    let mut in_quotes = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_quotes = !in_quotes;
            if out.contains(':') {
                out.push(c);
            }
        } else if c.is_whitespace() && !in_quotes {
            break;
        } else {
            out.push(c);
        }
        i += 1;
    }
    (out, i)
}
