//! Acquisition results and per-call attempt bookkeeping

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::Secret;
use portal::{ErrorKind, PortalError};
use stores::AttemptRecord;

use crate::retry::RetryRecord;

/// How a token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMethod {
    Cache,
    Store,
    Login,
    /// A timed-out caller found the token written by a racing login
    LoginAfterTimeoutRace,
}

impl AcquisitionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionMethod::Cache => "cache",
            AcquisitionMethod::Store => "store",
            AcquisitionMethod::Login => "login",
            AcquisitionMethod::LoginAfterTimeoutRace => "login_after_timeout_race",
        }
    }
}

/// One try against the login portal.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginAttempt {
    /// 1-based ordinal within one acquisition
    pub index: u32,
    pub success: bool,
    pub duration: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl From<&LoginAttempt> for AttemptRecord {
    fn from(attempt: &LoginAttempt) -> Self {
        AttemptRecord {
            index: attempt.index,
            success: attempt.success,
            duration_ms: attempt.duration.as_millis() as u64,
            error_kind: attempt.error_kind.map(|k| k.as_str().to_string()),
            error_message: attempt.error_message.clone(),
        }
    }
}

/// Attempt list shared by every login made on behalf of one acquisition.
///
/// Cloning shares the underlying list, so attempts recorded inside retried
/// logins and abandoned (timed-out) futures all land in the same history.
#[derive(Debug, Clone, Default)]
pub struct AttemptLog {
    attempts: Arc<Mutex<Vec<LoginAttempt>>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt outcome and return its ordinal.
    pub fn record(&self, duration: Duration, error: Option<&PortalError>) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let index = attempts.len() as u32 + 1;
        attempts.push(LoginAttempt {
            index,
            success: error.is_none(),
            duration,
            error_kind: error.map(|e| e.kind),
            error_message: error.map(|e| e.message.clone()),
        });
        index
    }

    pub fn snapshot(&self) -> Vec<LoginAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Successful outcome of one `acquire` call.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub request_id: String,
    pub site: String,
    pub account: String,
    pub credential_id: u64,
    pub token: Secret<String>,
    pub expires_at: Option<u64>,
    pub method: AcquisitionMethod,
    pub duration: Duration,
    pub attempts: Vec<LoginAttempt>,
    /// Retry-policy runs behind a `Login` result; empty otherwise
    pub retries: Vec<RetryRecord>,
}

/// Process-lifetime counters exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub acquisition_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// `success_count / acquisition_count`, 0.0 before the first acquisition
    pub success_rate: f64,
    pub active_acquisitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_log_numbers_attempts_across_clones() {
        let log = AttemptLog::new();
        let shared = log.clone();

        assert_eq!(
            log.record(
                Duration::from_millis(5),
                Some(&PortalError::new(ErrorKind::Network, "reset"))
            ),
            1
        );
        assert_eq!(shared.record(Duration::from_millis(7), None), 2);

        let attempts = log.snapshot();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::Network));
        assert!(attempts[1].success);
        assert_eq!(attempts[1].error_message, None);
    }

    #[test]
    fn attempt_converts_to_history_record() {
        let attempt = LoginAttempt {
            index: 3,
            success: false,
            duration: Duration::from_millis(1500),
            error_kind: Some(ErrorKind::Challenge),
            error_message: Some("captcha misread".into()),
        };
        let record = AttemptRecord::from(&attempt);
        assert_eq!(record.index, 3);
        assert_eq!(record.duration_ms, 1500);
        assert_eq!(record.error_kind.as_deref(), Some("challenge"));
    }

    #[test]
    fn method_labels() {
        assert_eq!(
            AcquisitionMethod::LoginAfterTimeoutRace.as_str(),
            "login_after_timeout_race"
        );
        assert_eq!(AcquisitionMethod::Cache.as_str(), "cache");
    }
}
