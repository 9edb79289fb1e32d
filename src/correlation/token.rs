//! Ticket-number tokens in subject lines, e.g. `[GH-0042]`.

use regex::Regex;

use crate::error::ConfigError;

/// Token syntax for one tracker prefix.
#[derive(Debug, Clone)]
pub struct TokenFormat {
    prefix: String,
    find: Regex,
    strip: Regex,
}

impl TokenFormat {
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.trim();
        if prefix.is_empty() || prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                key: "TICKET_PREFIX".into(),
                message: format!("'{prefix}' is not a usable token prefix"),
            });
        }
        let escaped = regex::escape(prefix);
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
                key: "TICKET_PREFIX".into(),
                message: e.to_string(),
            })
        };
        Ok(Self {
            prefix: prefix.to_string(),
            find: compile(format!(r"(?i)\[{escaped}-(\d+)\]"))?,
            strip: compile(format!(r"(?i)\[{escaped}-\d+\]\s*"))?,
        })
    }

    /// The token for `number`, zero-padded to four digits.
    pub fn render(&self, number: u64) -> String {
        format!("[{}-{number:04}]", self.prefix)
    }

    /// First valid ticket number tagged anywhere in `subject`.
    pub fn extract(&self, subject: &str) -> Option<u64> {
        self.find
            .captures_iter(subject)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            .find(|n| *n > 0)
    }

    /// Tag `subject` with `number`.
    ///
    /// Prior tokens of this syntax and reply/forward prefixes are removed
    /// first, so applying twice is the same as applying once. Tags in any
    /// other syntax are left alone.
    pub fn apply(&self, subject: &str, number: u64) -> String {
        let stripped = self.strip.replace_all(subject, "");
        let rest = normalize_subject(&stripped);
        let token = self.render(number);
        if rest.is_empty() {
            token
        } else {
            format!("{token} {rest}")
        }
    }
}

/// Strip leading `Re:`/`Fwd:`/`FW:` prefixes (any case, repeated) and trim.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(len) = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|p| lower.starts_with(**p))
            .map(|p| p.len())
        else {
            return rest.to_string();
        };
        rest = rest[len..].trim_start();
    }
}
