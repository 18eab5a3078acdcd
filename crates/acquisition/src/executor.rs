//! Login execution with nested retry loops
//!
//! One `login` call drives the portal through two loops:
//!
//! - outer: network failures retry the whole attempt sequence with
//!   exponential backoff (`network_base_delay · 2^(n-1)`)
//! - inner: challenge-type failures retry a single attempt in place after a
//!   fixed delay; permission and validation failures stop immediately
//!
//! The whole call is bounded by `login_timeout`. Portal calls block, so each
//! attempt runs on tokio's blocking pool. An attempt abandoned by the timeout
//! keeps running on its thread and its result is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use portal::{ErrorKind, IssuedToken, LoginPortal, PortalError};
use stores::Credential;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LoginConfig;
use crate::error::{Error, Result, TimeoutStage};
use crate::metrics;
use crate::model::AttemptLog;

pub struct LoginExecutor {
    portal: Arc<dyn LoginPortal>,
    config: LoginConfig,
    invocations: AtomicU64,
}

impl LoginExecutor {
    pub fn new(portal: Arc<dyn LoginPortal>, config: LoginConfig) -> Self {
        Self {
            portal,
            config,
            invocations: AtomicU64::new(0),
        }
    }

    /// Number of `login` calls made so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Log in with `credential`, appending every portal attempt to `log`.
    ///
    /// Errors carry the attempt history as of the failure:
    /// `Network` when the outer loop is exhausted, `LoginFailed` for any other
    /// terminal portal failure, `Timeout { stage: Login }` when
    /// `login_timeout` elapses.
    pub async fn login(&self, credential: &Credential, log: &AttemptLog) -> Result<IssuedToken> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        debug!(
            portal = self.portal.id(),
            site = %credential.site,
            account = %credential.account,
            "starting login"
        );

        match tokio::time::timeout(self.config.login_timeout, self.network_loop(credential, log))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    site = %credential.site,
                    account = %credential.account,
                    timeout_secs = self.config.login_timeout.as_secs(),
                    "login timed out"
                );
                Err(Error::Timeout {
                    stage: TimeoutStage::Login,
                    elapsed: started.elapsed(),
                    attempts: log.snapshot(),
                })
            }
        }
    }

    async fn network_loop(&self, credential: &Credential, log: &AttemptLog) -> Result<IssuedToken> {
        let mut network_retries = 0u32;
        loop {
            match self.challenge_loop(credential, log).await {
                Ok(token) => {
                    info!(
                        site = %credential.site,
                        account = %credential.account,
                        attempts = log.len(),
                        "login succeeded"
                    );
                    return Ok(token);
                }
                Err(e) if e.kind == ErrorKind::Network => {
                    if network_retries >= self.config.max_network_retries {
                        return Err(Error::Network {
                            message: e.message,
                            attempts: log.snapshot(),
                        });
                    }
                    network_retries += 1;
                    let delay = self.network_delay(network_retries);
                    warn!(
                        account = %credential.account,
                        retry = network_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "network failure, retrying login"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::LoginFailed {
                        kind: e.kind,
                        message: e.message,
                        attempts: log.snapshot(),
                    });
                }
            }
        }
    }

    /// Retry a single attempt in place. Network failures escape to the
    /// outer loop untouched.
    async fn challenge_loop(
        &self,
        credential: &Credential,
        log: &AttemptLog,
    ) -> std::result::Result<IssuedToken, PortalError> {
        let mut retries = 0u32;
        loop {
            let error = match self.attempt(credential, log).await {
                Ok(token) => return Ok(token),
                Err(e) => e,
            };
            let retryable = error.kind != ErrorKind::Network
                && error.kind.is_attempt_retryable()
                && retries < self.config.max_captcha_retries;
            if !retryable {
                return Err(error);
            }
            retries += 1;
            debug!(
                account = %credential.account,
                retry = retries,
                kind = error.kind.as_str(),
                "retrying login attempt"
            );
            tokio::time::sleep(self.config.captcha_retry_delay).await;
        }
    }

    async fn attempt(
        &self,
        credential: &Credential,
        log: &AttemptLog,
    ) -> std::result::Result<IssuedToken, PortalError> {
        let portal = Arc::clone(&self.portal);
        let account = credential.account.clone();
        let secret = credential.secret.clone();
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || portal.login(&account, &secret))
            .await
            .unwrap_or_else(|e| {
                Err(PortalError::new(
                    ErrorKind::Unknown,
                    format!("login task failed: {e}"),
                ))
            });

        let error = outcome.as_ref().err();
        let index = log.record(started.elapsed(), error);
        metrics::record_login_attempt(error.map(|e| e.kind));
        if let Some(e) = error {
            debug!(account = %credential.account, attempt = index, kind = e.kind.as_str(), "login attempt failed");
        }
        outcome
    }

    fn network_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.config.network_base_delay.saturating_mul(1 << exponent)
    }
}
