//! Failure classification for HTTP login portals
//!
//! Maps a portal's HTTP status (and, for ambiguous statuses, its body) to an
//! `ErrorKind`. Only the HTTP portal needs this; the command portal receives
//! the kind directly from the automation script.

use crate::ErrorKind;

/// Body phrases that mark a 4xx response as a failed interactive challenge
/// rather than a rejected credential.
const CHALLENGE_PATTERNS: &[&str] = &["captcha", "challenge", "verification code"];

/// Classify a non-success login response by HTTP status and body.
///
/// 401/403 are Permission (credential rejected) unless the body says a
/// challenge failed, 404 is NotFound, 400/422 are Validation, 408/504 are
/// Timeout, 429 and the remaining 5xx are Network, everything else is Unknown.
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    match status {
        401 | 403 if mentions_challenge(body) => ErrorKind::Challenge,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        400 | 422 if mentions_challenge(body) => ErrorKind::Challenge,
        400 | 422 => ErrorKind::Validation,
        408 | 504 => ErrorKind::Timeout,
        429 | 500..=599 => ErrorKind::Network,
        _ => ErrorKind::Unknown,
    }
}

fn mentions_challenge(body: &str) -> bool {
    let lower = body.to_lowercase();
    CHALLENGE_PATTERNS.iter().any(|p| lower.contains(p))
}
