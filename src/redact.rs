//! Secret redaction.
//!
//! Applied to every error message and detail string before it is logged, stored in the
//! failure log, classified, or surfaced to a client. Replacement is irreversible.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

struct RedactionRule {
    regex: Regex,
    replacement: &'static str,
}

fn rules() -> &'static [RedactionRule] {
    static RULES: OnceLock<Vec<RedactionRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let raw: [(&str, &str); 7] = [
            // OpenAI / Anthropic style keys: sk-..., sk-proj-..., sk-ant-...
            (r"sk-[A-Za-z0-9_\-]{20,}", "sk-[REDACTED]"),
            (r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*", "Bearer [REDACTED]"),
            (
                r#"(?i)\b(password|passwd|secret|token|api_key|apikey|access_token)(\s*[=:]\s*)["']?[^\s"'&,;]+["']?"#,
                "${1}${2}[REDACTED]",
            ),
            (r"AKIA[0-9A-Z]{16}", "[REDACTED_AWS_KEY]"),
            (r"AIza[0-9A-Za-z_\-]{35}", "[REDACTED_GOOGLE_KEY]"),
            (r"xox[abposr]-[A-Za-z0-9\-]+", "[REDACTED_SLACK_TOKEN]"),
            (r"ghp_[A-Za-z0-9]{36,}", "[REDACTED_GITHUB_TOKEN]"),
        ];
        raw.into_iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(regex) => Some(RedactionRule { regex, replacement }),
                Err(e) => {
                    tracing::error!(pattern, error = %e, "invalid redaction pattern");
                    None
                }
            })
            .collect()
    })
}

/// Replace credential-shaped substrings in `text`.
pub fn redact_secrets(text: &str) -> String {
    let mut out: Cow<'_, str> = Cow::Borrowed(text);
    for rule in rules() {
        if rule.regex.is_match(&out) {
            out = Cow::Owned(rule.regex.replace_all(&out, rule.replacement).into_owned());
        }
    }
    out.into_owned()
}

/// True when `text` contains anything [`redact_secrets`] would rewrite.
pub fn contains_secret(text: &str) -> bool {
    rules().iter().any(|r| r.regex.is_match(text))
}
