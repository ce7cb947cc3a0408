//! Secret redaction for persisted text.
//!
//! Every command line, reason string, and captured output line passes
//! through [`Redactor::line`] before it reaches the ledger. The pattern
//! catalog is an ordered list so operators can extend it without touching
//! the storage layer.

use std::sync::OnceLock;

use regex::Regex;

/// Replacement marker inserted wherever a secret was matched.
pub const REDACTED_MARKER: &str = "<REDACTED>";

/// A single redaction rule: the pattern and its replacement template.
#[derive(Debug, Clone)]
pub struct RedactionRule {
    /// Compiled pattern to match.
    pub pattern: Regex,
    /// Replacement, may reference capture groups (`$1`).
    pub replacement: String,
}

/// Ordered secret-pattern catalog applied to free-form text.
///
/// Rules run in order; later rules see the output of earlier ones. The
/// default catalog covers bearer tokens, `FLOWFORGE_API_KEY=` style
/// environment assignments, and the common CLI secret flags.
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<RedactionRule>,
}

impl Redactor {
    /// Builds the default catalog.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile, which would be a
    /// programming error caught by the module tests.
    #[must_use]
    pub fn new() -> Self {
        let rules = vec![
            rule(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+", "Bearer <REDACTED>"),
            rule(
                r"(?i)\b([A-Z0-9_]*(?:API_KEY|APIKEY|TOKEN|SECRET|PASSWORD))=(?:'[^']*'|\x22[^\x22]*\x22|\S+)",
                "$1=<REDACTED>",
            ),
            rule(
                r"(?i)(--(?:api-key|token|password|secret))(?:=|\s+)(?:'[^']*'|\x22[^\x22]*\x22|\S+)",
                "$1 <REDACTED>",
            ),
        ];
        Self { rules }
    }

    /// Builds a redactor from a custom ordered rule list.
    #[must_use]
    pub fn with_rules(rules: Vec<RedactionRule>) -> Self {
        Self { rules }
    }

    /// Appends an additional rule after the built-in catalog.
    pub fn push_rule(&mut self, pattern: Regex, replacement: impl Into<String>) {
        self.rules.push(RedactionRule {
            pattern,
            replacement: replacement.into(),
        });
    }

    /// Masks every known secret pattern in `input`.
    #[must_use]
    pub fn line(&self, input: &str) -> String {
        let mut out = input.to_string();
        for r in &self.rules {
            out = r.pattern.replace_all(&out, r.replacement.as_str()).into_owned();
        }
        out
    }

    /// Masks a command and its arguments, returning one printable string.
    #[must_use]
    pub fn command_line(&self, command: &str, args: &[String]) -> String {
        let mut joined = String::from(command);
        for a in args {
            joined.push(' ');
            joined.push_str(a);
        }
        self.line(&joined)
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

fn rule(pattern: &str, replacement: &str) -> RedactionRule {
    RedactionRule {
        pattern: Regex::new(pattern).expect("built-in redaction pattern"),
        replacement: replacement.to_string(),
    }
}

/// Shared process-wide redactor with the default catalog.
pub fn default_redactor() -> &'static Redactor {
    static REDACTOR: OnceLock<Redactor> = OnceLock::new();
    REDACTOR.get_or_init(Redactor::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_bearer_and_env_assignment() {
        let r = Redactor::new();
        let out = r.line("Authorization: Bearer secret-token FLOWFORGE_API_KEY=supersecret");
        assert!(!out.contains("secret-token"), "{out}");
        assert!(!out.contains("supersecret"), "{out}");
        assert!(out.contains("FLOWFORGE_API_KEY=<REDACTED>"), "{out}");
    }

    #[test]
    fn masks_cli_secret_flags() {
        let r = Redactor::new();
        let out = r.line("python3 worker.py --api-key supersecret --token abc123 --password 'letmein'");
        assert!(!out.contains("supersecret"), "{out}");
        assert!(!out.contains("abc123"), "{out}");
        assert!(!out.contains("letmein"), "{out}");
        assert!(out.contains("--api-key <REDACTED>"), "{out}");
        assert!(out.contains("--token <REDACTED>"), "{out}");
        assert!(out.contains("--password <REDACTED>"), "{out}");
    }

    #[test]
    fn masks_equals_form_flags() {
        let r = Redactor::new();
        let out = r.line("worker --api-key=sk-123 --password=\"hunter2\"");
        assert!(!out.contains("sk-123"), "{out}");
        assert!(!out.contains("hunter2"), "{out}");
    }

    #[test]
    fn leaves_plain_text_alone() {
        let r = Redactor::new();
        let input = "processing request 4242 failed, retrying endlessly";
        assert_eq!(r.line(input), input);
    }

    #[test]
    fn secret_corpus_never_survives() {
        // Property-style sweep over the known-secret dictionary.
        let r = Redactor::new();
        let corpus = [
            "Bearer sk-ant-verysecret",
            "FLOWFORGE_API_KEY=abc",
            "MY_SERVICE_TOKEN=deadbeef",
            "DB_PASSWORD=pg-secret",
            "--api-key sk-live-1234",
            "--token ghp_sekrit",
            "--password p4ssw0rd",
            "AWS_SECRET=wJalrXUtnFEMI",
        ];
        for sample in corpus {
            let out = r.line(&format!("prefix {sample} suffix"));
            let secret = sample
                .rsplit(|c| c == ' ' || c == '=')
                .next()
                .unwrap_or_default();
            assert!(!out.contains(secret), "secret survived in {out:?}");
            assert!(out.contains(REDACTED_MARKER), "no marker in {out:?}");
        }
    }

    #[test]
    fn command_line_joins_and_masks_args() {
        let r = Redactor::new();
        let out = r.command_line(
            "python3",
            &["worker.py".into(), "--api-key".into(), "supersecret".into()],
        );
        assert_eq!(out, "python3 worker.py --api-key <REDACTED>");
    }

    #[test]
    fn custom_rule_extends_catalog() {
        let mut r = Redactor::new();
        r.push_rule(Regex::new(r"sess_[a-z0-9]+").unwrap(), REDACTED_MARKER);
        let out = r.line("cookie sess_4f2a9 attached");
        assert_eq!(out, "cookie <REDACTED> attached");
    }
}
