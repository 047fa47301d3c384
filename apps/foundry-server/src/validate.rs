//! Command allow-listing. Pure: no I/O, no clock.

/// Characters that never reach the dispatcher.
const FORBIDDEN: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>'];

pub(crate) const MAX_COMMAND_CHARS: usize = 1000;

/// Only this many leading characters of the normalized command are compared.
const PREFIX_WINDOW: usize = 20;

const ALLOWED_PREFIXES: &[&str] = &[
    "wp plugin",
    "wp theme",
    "wp core",
    "wp user",
    "wp option",
    "wp post",
    "wp content",
    "wp comment",
    "wp term",
    "wp media",
    "wp db",
    "wp cache",
    "wp transient",
    "wp site",
    "wp network",
    "wp menu",
    "wp widget",
    "wp rewrite",
    "wp cron",
    "wp language",
    "foundry",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ValidationError {
    #[error("command contains forbidden character {0:?}")]
    InjectionRejected(char),
    #[error("command exceeds {MAX_COMMAND_CHARS} characters")]
    TooLong,
    #[error("command is not allow-listed")]
    NotAllowlisted,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InjectionRejected(_) => "injection_rejected",
            ValidationError::TooLong => "too_long",
            ValidationError::NotAllowlisted => "not_allowlisted",
        }
    }
}

/// Returns the normalized command (always starting with `wp ` or `foundry `).
pub(crate) fn validate(raw: &str) -> Result<String, ValidationError> {
    if let Some(c) = raw.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(ValidationError::InjectionRejected(c));
    }
    if raw.chars().count() > MAX_COMMAND_CHARS {
        return Err(ValidationError::TooLong);
    }
    let normalized = if raw.starts_with("wp ") || raw.starts_with("foundry ") {
        raw.to_string()
    } else {
        format!("wp {raw}")
    };
    let head: String = normalized.chars().take(PREFIX_WINDOW).collect();
    let allowed = ALLOWED_PREFIXES.iter().any(|prefix| {
        head.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
    });
    if !allowed {
        return Err(ValidationError::NotAllowlisted);
    }
    Ok(normalized)
}
