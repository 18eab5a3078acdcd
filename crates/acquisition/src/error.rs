//! Error types for token acquisition

use std::fmt;
use std::time::Duration;

use portal::ErrorKind;

use crate::model::LoginAttempt;
use crate::retry::RetryClass;

/// Which wait ran out of time.
///
/// Coordinator waits (`Queue`, `Lock`) are distinct from the login's own hard
/// timeout and from the orchestration deadline around the whole locked section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Queue,
    Lock,
    Login,
    Acquisition,
}

impl TimeoutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutStage::Queue => "queue",
            TimeoutStage::Lock => "lock",
            TimeoutStage::Login => "login",
            TimeoutStage::Acquisition => "acquisition",
        }
    }
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from token acquisition.
///
/// Callers of `AcquisitionOrchestrator::acquire_token` only ever see
/// `Validation`, `NoAvailableAccount`, `Timeout` or `AutoTokenAcquisition`;
/// the remaining variants are absorbed by retries or wrapped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no available account for site {site}")]
    NoAvailableAccount { site: String },

    #[error("network failure after {} login attempts: {message}", .attempts.len())]
    Network {
        message: String,
        attempts: Vec<LoginAttempt>,
    },

    #[error("login failed ({kind}) after {} attempts: {message}", .attempts.len())]
    LoginFailed {
        kind: ErrorKind,
        message: String,
        attempts: Vec<LoginAttempt>,
    },

    #[error("{stage} wait timed out after {elapsed:?}")]
    Timeout {
        stage: TimeoutStage,
        elapsed: Duration,
        attempts: Vec<LoginAttempt>,
    },

    #[error("store error: {0}")]
    Store(#[from] stores::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("automatic token acquisition failed for site {}: {}", .0.site, .0.cause)]
    AutoTokenAcquisition(Box<AcquisitionFailure>),
}

/// Terminal failure detail carried by `Error::AutoTokenAcquisition`.
#[derive(Debug)]
pub struct AcquisitionFailure {
    pub site: String,
    pub account: Option<String>,
    pub class: RetryClass,
    pub cause: Error,
    pub attempts: Vec<LoginAttempt>,
    pub elapsed: Duration,
}

impl Error {
    /// Retry classification of this error.
    pub fn class(&self) -> RetryClass {
        match self {
            Error::Validation(_) | Error::Config(_) => RetryClass::Validation,
            Error::NoAvailableAccount { .. } => RetryClass::NotFound,
            Error::Network { .. } => RetryClass::Network,
            Error::LoginFailed { kind, .. } => RetryClass::from(*kind),
            Error::Timeout { .. } => RetryClass::Timeout,
            Error::Store(_) => RetryClass::Unknown,
            Error::AutoTokenAcquisition(failure) => failure.class,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::AutoTokenAcquisition(failure) => failure.cause.is_timeout(),
            _ => false,
        }
    }

    /// Login attempts carried by this error, if any.
    pub fn attempts(&self) -> &[LoginAttempt] {
        match self {
            Error::Network { attempts, .. }
            | Error::LoginFailed { attempts, .. }
            | Error::Timeout { attempts, .. } => attempts,
            Error::AutoTokenAcquisition(failure) => &failure.attempts,
            _ => &[],
        }
    }

    /// Stable label for history records and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NoAvailableAccount { .. } => "no_available_account",
            Error::Network { .. } => "network",
            Error::LoginFailed { .. } => "login_failed",
            Error::Timeout { .. } => "timeout",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::AutoTokenAcquisition(failure) => failure.cause.kind_label(),
        }
    }
}

/// Result alias for acquisition operations.
pub type Result<T> = std::result::Result<T, Error>;
