//! Records persisted by the stores

use common::Secret;
use serde::{Deserialize, Serialize};

/// A login credential for one account on one site.
///
/// Timestamps are unix milliseconds. Statistics are only ever mutated through
/// `CredentialStore::update_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    pub site: String,
    pub account: String,
    pub secret: Secret<String>,
    #[serde(default)]
    pub is_preferred: bool,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

/// A token as persisted in the token store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: Secret<String>,
    /// Absolute expiry (unix ms) if the portal reported one
    #[serde(default)]
    pub expires_at: Option<u64>,
    pub issued_at: u64,
}

impl StoredToken {
    /// Whether the token can still be handed out at `now`, keeping `margin_ms`
    /// of remaining lifetime in reserve. Tokens with unknown expiry are always
    /// considered usable.
    pub fn is_usable(&self, now: u64, margin_ms: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now.saturating_add(margin_ms),
            None => true,
        }
    }
}

/// One login attempt as recorded in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Immutable audit entry for one completed acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub request_id: String,
    pub site: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub credential_id: Option<u64>,
    pub success: bool,
    /// How the token was obtained (`cache`, `store`, `login`, ...)
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_defaults_statistics() {
        let json = r#"{"id":7,"site":"portal.example","account":"alice","secret":"pw"}"#;
        let cred: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(cred.id, 7);
        assert!(!cred.is_preferred);
        assert_eq!(cred.last_success_at, None);
        assert_eq!(cred.success_count, 0);
        assert_eq!(cred.failure_count, 0);
        assert_eq!(cred.secret.expose(), "pw");
        assert!(!format!("{cred:?}").contains("\"pw\""));
    }

    #[test]
    fn token_without_expiry_is_usable() {
        let token = StoredToken {
            token: "t".into(),
            expires_at: None,
            issued_at: 0,
        };
        assert!(token.is_usable(u64::MAX - 1, 300_000));
    }

    #[test]
    fn token_inside_margin_is_not_usable() {
        let token = StoredToken {
            token: "t".into(),
            expires_at: Some(1_000_000),
            issued_at: 0,
        };
        assert!(token.is_usable(600_000, 300_000));
        assert!(!token.is_usable(700_000, 300_000));
        assert!(!token.is_usable(1_000_001, 0));
    }

    #[test]
    fn history_record_omits_empty_attempt_errors() {
        let attempt = AttemptRecord {
            index: 1,
            success: true,
            duration_ms: 1200,
            error_kind: None,
            error_message: None,
        };
        let json = serde_json::to_string(&attempt).unwrap();
        assert!(!json.contains("error_kind"), "got: {json}");
    }
}
