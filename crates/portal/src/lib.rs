//! Login portal abstraction for credential-based token acquisition
//!
//! Defines the `LoginPortal` trait that decouples acquisition logic from the
//! automation layer that actually drives a login UI. Portals are blocking by
//! contract: a login may run a headless browser or shell out to a script, so
//! callers must execute it on a blocking-capable thread.
//!
//! Every failure is classified at the point it happens with a closed
//! `ErrorKind`, so retry decisions never depend on parsing message text.

pub mod classify;
pub mod command;
pub mod http;

pub use classify::classify_status;
pub use command::CommandPortal;
pub use http::HttpPortal;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Classification of a login failure, produced by the portal layer.
///
/// Drives retry behaviour downstream:
/// - Network failures retry the whole login with exponential backoff
/// - Challenge failures (captcha misread, flaky form) retry just the attempt
/// - Permission/Validation failures are terminal for the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset, DNS failure, upstream 5xx
    Network,
    /// The portal or an intermediate hop did not answer in time
    Timeout,
    /// Visual challenge misread or interactive step failed
    Challenge,
    /// Credential rejected by the portal
    Permission,
    /// Login page or account does not exist
    NotFound,
    /// Malformed input or portal misconfiguration
    Validation,
    /// Anything the portal could not classify
    Unknown,
}

impl ErrorKind {
    /// Stable label for logs, metrics and history records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Challenge => "challenge",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether repeating a single attempt can change the outcome.
    ///
    /// Network failures are excluded because they are handled by the outer
    /// network loop, not by repeating the attempt in place.
    pub fn is_attempt_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Challenge | ErrorKind::Timeout | ErrorKind::NotFound | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified login failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} login failure: {message}")]
pub struct PortalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PortalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result alias for portal operations.
pub type Result<T> = std::result::Result<T, PortalError>;

/// Token issued by a successful login.
///
/// `expires_at` is an absolute unix timestamp in milliseconds when the portal
/// reports one; most portals do not, and the token's lifetime is then unknown.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: Secret<String>,
    pub expires_at: Option<u64>,
}

/// Abstraction over the automation layer that performs a login.
///
/// Implementations block the calling thread for the whole login flow. The
/// acquisition layer runs them on tokio's blocking pool; never call `login`
/// directly from an async task.
pub trait LoginPortal: Send + Sync {
    /// Identifier for logging (e.g. "command", "http")
    fn id(&self) -> &str;

    /// Perform one complete login for the given account.
    fn login(&self, account: &str, secret: &Secret<String>) -> Result<IssuedToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_labels_are_snake_case() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::Network.to_string(), "network");
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        let back: ErrorKind = serde_json::from_str("\"challenge\"").unwrap();
        assert_eq!(back, ErrorKind::Challenge);
    }

    #[test]
    fn only_transient_attempt_failures_are_retryable_in_place() {
        assert!(ErrorKind::Challenge.is_attempt_retryable());
        assert!(ErrorKind::Timeout.is_attempt_retryable());
        assert!(ErrorKind::Unknown.is_attempt_retryable());
        assert!(!ErrorKind::Network.is_attempt_retryable());
        assert!(!ErrorKind::Permission.is_attempt_retryable());
        assert!(!ErrorKind::Validation.is_attempt_retryable());
    }

    #[test]
    fn portal_error_display_includes_kind() {
        let err = PortalError::new(ErrorKind::Challenge, "captcha text mismatch");
        assert_eq!(
            err.to_string(),
            "challenge login failure: captcha text mismatch"
        );
    }
}
