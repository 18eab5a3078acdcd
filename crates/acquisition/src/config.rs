//! Acquisition configuration
//!
//! One immutable value assembled at startup and handed to the orchestrator.
//! Nothing in the acquisition path re-reads configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::Jitter;

/// Root configuration for the acquisition subsystem.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionConfig {
    pub login: LoginConfig,
    pub retry: RetryConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub orchestration: OrchestrationConfig,
}

/// Nested retry loops inside a single login.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub max_network_retries: u32,
    /// First network retry waits this long, doubling each time
    pub network_base_delay: Duration,
    pub max_captcha_retries: u32,
    pub captcha_retry_delay: Duration,
    /// Hard bound on one `LoginExecutor::login` call, retries included
    pub login_timeout: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_network_retries: 3,
            network_base_delay: Duration::from_secs(2),
            max_captcha_retries: 3,
            captcha_retry_delay: Duration::from_secs(1),
            login_timeout: Duration::from_secs(120),
        }
    }
}

/// Class-based retry policy around whole logins.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Cumulative ceiling across all attempts of one operation
    pub total_timeout: Duration,
    pub not_found_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            total_timeout: Duration::from_secs(300),
            not_found_delay: Duration::from_secs(5),
            jitter: Jitter::None,
        }
    }
}

/// Concurrency ceilings and coordinator waits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_global: usize,
    pub max_per_site: usize,
    pub max_per_account: usize,
    pub max_queue_length: usize,
    pub queue_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_global: 10,
            max_per_site: 5,
            max_per_account: 1,
            max_queue_length: 100,
            queue_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(300),
        }
    }
}

/// Token cache lifetimes.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for tokens whose expiry the portal did not report
    pub default_token_ttl: Duration,
    /// Lifetime reserved before a known expiry
    pub expiry_margin: Duration,
    pub credential_list_ttl: Duration,
    pub blacklist_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_token_ttl: Duration::from_secs(3600),
            expiry_margin: Duration::from_secs(300),
            credential_list_ttl: Duration::from_secs(60),
            blacklist_ttl: Duration::from_secs(10),
        }
    }
}

/// Orchestration deadline and timeout-race handling.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Bound on permit acquisition plus login for one call
    pub acquisition_timeout: Duration,
    /// Wait before the final store re-check after a timeout
    pub race_recheck_grace: Duration,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout: Duration::from_secs(600),
            race_recheck_grace: Duration::from_secs(1),
        }
    }
}

impl AcquisitionConfig {
    /// Reject configurations that would deadlock or never admit a request.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_global == 0 || limits.max_per_site == 0 || limits.max_per_account == 0 {
            return Err(Error::Config(
                "concurrency ceilings must be greater than 0".into(),
            ));
        }
        if limits.queue_timeout.is_zero() || limits.lock_timeout.is_zero() {
            return Err(Error::Config(
                "queue_timeout and lock_timeout must be greater than 0".into(),
            ));
        }
        if self.login.login_timeout.is_zero() {
            return Err(Error::Config("login_timeout must be greater than 0".into()));
        }
        if self.orchestration.acquisition_timeout.is_zero() {
            return Err(Error::Config(
                "acquisition_timeout must be greater than 0".into(),
            ));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(Error::Config(format!(
                "retry factor must be >= 1.0, got {}",
                self.retry.factor
            )));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(Error::Config(
                "retry max_delay must not be smaller than base_delay".into(),
            ));
        }
        Ok(())
    }
}
