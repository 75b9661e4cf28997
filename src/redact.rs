//! Secret masking for text that leaves the engine.
//!
//! Everything exposed outside the raw terminal view (tails read by tools,
//! AI context, state events, autopilot events, logs) goes through a
//! [`Redact`] implementation first. The default [`SecretRedactor`] masks
//! credential-shaped substrings and keeps the surrounding text intact, so
//! `API_KEY=abc123` becomes `API_KEY=[REDACTED]`.

use regex::Regex;
use std::sync::OnceLock;

/// Replacement marker for masked values
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Redaction collaborator.
///
/// Implementations must be idempotent: `redact(redact(x)) == redact(x)`.
pub trait Redact: Send + Sync {
    fn redact(&self, text: &str) -> String;
}

struct SecretPattern {
    name: &'static str,
    regex: Regex,
    /// Replacement template (may reference capture groups)
    replacement: &'static str,
}

static PATTERNS: OnceLock<Vec<SecretPattern>> = OnceLock::new();

fn patterns() -> &'static [SecretPattern] {
    PATTERNS.get_or_init(|| {
        let table: [(&'static str, &'static str, &'static str); 8] = [
            (
                "private_key",
                r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
                "[REDACTED]",
            ),
            (
                "bearer_token",
                r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*",
                "$1 [REDACTED]",
            ),
            ("openai_key", r"\bsk-[A-Za-z0-9_-]{20,}", "[REDACTED]"),
            ("github_token", r"\bgh[pousr]_[A-Za-z0-9]{20,}", "[REDACTED]"),
            ("aws_access_key_id", r"\bAKIA[0-9A-Z]{16}\b", "[REDACTED]"),
            (
                "url_credentials",
                r"(://[^:/\s@]+):([^@\s]+)@",
                "$1:[REDACTED]@",
            ),
            (
                "secret_assignment",
                r#"(?i)\b([a-z0-9_.-]*(?:api[ _-]?key|apikey|token|secret|password|passwd|passphrase)[a-z0-9_.-]*)(\s*[=:]\s*)(["']?)[^\s"']+"#,
                "$1$2$3[REDACTED]",
            ),
            (
                "cli_secret_flag",
                r"(?i)(--(?:apikey|api-key|password|token|secret)(?:\s+|=))[^\s]+",
                "$1[REDACTED]",
            ),
        ];

        table
            .into_iter()
            .map(|(name, pattern, replacement)| SecretPattern {
                name,
                regex: Regex::new(pattern).expect("valid secret pattern"),
                replacement,
            })
            .collect()
    })
}

/// Regex-based default redactor
#[derive(Debug, Default, Clone, Copy)]
pub struct SecretRedactor;

impl SecretRedactor {
    pub fn new() -> Self {
        Self
    }

    /// Names of the patterns matching `text`, in table order
    pub fn detect(&self, text: &str) -> Vec<&'static str> {
        patterns()
            .iter()
            .filter(|p| p.regex.is_match(text))
            .map(|p| p.name)
            .collect()
    }
}

impl Redact for SecretRedactor {
    fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for pattern in patterns() {
            if pattern.regex.is_match(&result) {
                result = pattern
                    .regex
                    .replace_all(&result, pattern.replacement)
                    .into_owned();
            }
        }
        result
    }
}
