//! Keyword classification of failure messages for dead-letter triage.
//!
//! Best-effort: the category only helps an operator decide what to do with a
//! dead-lettered job. Retry and backoff never look at it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use taxbridge_core::DomainError;

/// Why a job ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Payload failed pre-submission checks.
    Validation,
    /// Upstream transformation failure.
    Mapping,
    /// Network/timeout.
    Transport,
    /// The authority explicitly rejected the submission.
    RemoteReject,
    /// The upstream source system failed internally.
    RemoteError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::Validation,
        ErrorCategory::Mapping,
        ErrorCategory::Transport,
        ErrorCategory::RemoteReject,
        ErrorCategory::RemoteError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Mapping => "MAPPING",
            ErrorCategory::Transport => "TRANSPORT",
            ErrorCategory::RemoteReject => "REMOTE_REJECT",
            ErrorCategory::RemoteError => "REMOTE_ERROR",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Whether replaying without changing the payload can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Transport | ErrorCategory::RemoteError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("error category", s))
    }
}

/// Ordered rules; the first matching rule wins.
const RULES: &[(&[&str], ErrorCategory)] = &[
    (&["validation", "invalid"], ErrorCategory::Validation),
    (&["mapping", "transform"], ErrorCategory::Mapping),
    (&["timeout", "timed out", "connection", "network"], ErrorCategory::Transport),
    (&["rejected"], ErrorCategory::RemoteReject),
    (&["odata"], ErrorCategory::RemoteError),
];

/// Classify a failure message (case-insensitive substring match).
pub fn classify_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_category() {
        assert_eq!(classify_error("Validation failed: missing VAT id"), ErrorCategory::Validation);
        assert_eq!(classify_error("invalid CUI"), ErrorCategory::Validation);
        assert_eq!(classify_error("Mapping of line 3 failed"), ErrorCategory::Mapping);
        assert_eq!(classify_error("transform error"), ErrorCategory::Mapping);
        assert_eq!(classify_error("request TIMEOUT after 30s"), ErrorCategory::Transport);
        assert_eq!(classify_error("connection reset by peer"), ErrorCategory::Transport);
        assert_eq!(classify_error("document rejected by authority"), ErrorCategory::RemoteReject);
        assert_eq!(classify_error("OData service returned 500"), ErrorCategory::RemoteError);
        assert_eq!(classify_error("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn first_rule_wins() {
        // Contains both a validation and a transport keyword.
        assert_eq!(classify_error("invalid response: timeout"), ErrorCategory::Validation);
        assert_eq!(classify_error("connection rejected"), ErrorCategory::Transport);
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("REMOTE_REJECT".parse::<ErrorCategory>().unwrap(), ErrorCategory::RemoteReject);
        assert!("remote_reject".parse::<ErrorCategory>().is_err());
    }
}
