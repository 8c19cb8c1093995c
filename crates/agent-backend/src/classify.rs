//! Error classification for agents that only report free-form messages
//!
//! Structured kinds from the agent always win; these patterns are the fallback
//! for agents (and process-level failures) that only give us text.

use crate::error::ErrorKind;

/// Phrases that mean the upstream account is rate limited or out of quota.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "rate-limited",
    "too many requests",
    "5-hour",
    "5 hour",
    "usage limit",
    "quota",
    "all accounts rate limited",
];

/// Phrases that mean the agent process died under us.
const CRASH_PATTERNS: &[&str] = &[
    "exited with code",
    "process exited",
    "broken pipe",
    "connection closed",
    "killed by signal",
];

/// Phrases that mean the operation was aborted on request.
const ABORT_PATTERNS: &[&str] = &["abort", "cancelled", "canceled", "interrupted"];

/// Classify an error message by its text.
///
/// Order matters: a rate-limit message that also mentions the process exiting
/// is still a rate limit (rotation fixes it, a plain retry does not).
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) || contains_word(&lower, "429") {
        return ErrorKind::RateLimited;
    }
    if CRASH_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Crashed;
    }
    if ABORT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Aborted;
    }
    ErrorKind::Other
}

/// `needle` occurs with no alphanumeric character on either side.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages() {
        assert_eq!(
            classify_message("You've hit your 5-hour usage limit"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_message("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_message("All accounts rate limited"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn status_code_only_matches_as_a_word() {
        assert_eq!(classify_message("status 429"), ErrorKind::RateLimited);
        assert_eq!(classify_message("error (429)"), ErrorKind::RateLimited);
        assert_eq!(classify_message("line 4290 failed"), ErrorKind::Other);
        assert_eq!(classify_message("request id a429b"), ErrorKind::Other);
    }

    #[test]
    fn crash_messages() {
        assert_eq!(
            classify_message("Claude Code process exited with code 1"),
            ErrorKind::Crashed
        );
        assert_eq!(classify_message("write: Broken pipe"), ErrorKind::Crashed);
    }

    #[test]
    fn abort_messages() {
        assert_eq!(classify_message("Request was aborted"), ErrorKind::Aborted);
        assert_eq!(classify_message("operation cancelled"), ErrorKind::Aborted);
    }

    #[test]
    fn rate_limit_wins_over_crash() {
        assert_eq!(
            classify_message("rate limit hit, process exited with code 1"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn unknown_and_empty_are_other() {
        assert_eq!(classify_message("tool failed: file not found"), ErrorKind::Other);
        assert_eq!(classify_message(""), ErrorKind::Other);
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(classify_message("RATE LIMIT EXCEEDED"), ErrorKind::RateLimited);
    }
}
