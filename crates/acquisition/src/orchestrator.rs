//! Token acquisition orchestration
//!
//! `acquire` resolves a credential, serves an existing token without locking
//! when one exists, and otherwise logs in under a coordinator permit:
//!
//! 1. validate the site and resolve the credential (explicit id or selector)
//! 2. fast path: cache, then store
//! 3. take a permit for (site, account) and re-check cache and store
//! 4. log in under the retry policy; persist, cache and record statistics
//! 5. on a timeout, wait the race grace period and re-check the store, since a
//!    racing login may have landed the token in the meantime
//!
//! Steps 3 and 4 run on a spawned task that owns the permit. The caller waits
//! on it for at most `acquisition_timeout`. A login that outlives the caller
//! keeps its permit until it finishes, so its token still reaches the store
//! and no second login for the same account can start. Every outcome past
//! validation is written to history before `acquire` returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use portal::LoginPortal;
use stores::{Credential, CredentialStore, HistoryStore, StoredToken, TokenStore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TokenCache;
use crate::config::AcquisitionConfig;
use crate::coordinator::ResourceCoordinator;
use crate::error::{AcquisitionFailure, Error, Result, TimeoutStage};
use crate::executor::LoginExecutor;
use crate::history::HistoryRecorder;
use crate::metrics;
use crate::model::{AcquisitionMethod, AcquisitionResult, AttemptLog, Statistics};
use crate::retry::{RetryPolicy, RetryRecord};
use crate::selector::AccountSelector;

/// External capabilities the orchestrator is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub portal: Arc<dyn LoginPortal>,
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub history: Arc<dyn HistoryStore>,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    active: AtomicU64,
}

struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decides who wins when the caller's deadline races the login task taking
/// its permit: either the task commits to logging in, or the caller abandons
/// it while it is still waiting.
#[derive(Default)]
struct Claim(AtomicU8);

impl Claim {
    const WAITING: u8 = 0;
    const COMMITTED: u8 = 1;
    const ABANDONED: u8 = 2;

    fn commit(&self) -> bool {
        self.swap_from_waiting(Self::COMMITTED)
    }

    fn abandon(&self) -> bool {
        self.swap_from_waiting(Self::ABANDONED)
    }

    fn swap_from_waiting(&self, to: u8) -> bool {
        self.0
            .compare_exchange(Self::WAITING, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A token plus how it was obtained.
struct Obtained {
    token: StoredToken,
    method: AcquisitionMethod,
    retries: Vec<RetryRecord>,
}

impl Obtained {
    fn existing(token: StoredToken, method: AcquisitionMethod) -> Self {
        Self {
            token,
            method,
            retries: Vec::new(),
        }
    }
}

pub struct AcquisitionOrchestrator {
    credentials: Arc<dyn CredentialStore>,
    history: HistoryRecorder,
    worker: Arc<Worker>,
    counters: Counters,
}

impl AcquisitionOrchestrator {
    pub fn new(config: AcquisitionConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(TokenCache::new(config.cache.clone()));
        let worker = Worker {
            selector: AccountSelector::new(collaborators.credentials.clone(), cache.clone()),
            executor: LoginExecutor::new(collaborators.portal, config.login.clone()),
            coordinator: ResourceCoordinator::new(config.limits.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            tokens: collaborators.tokens,
            cache,
            config,
        };
        Ok(Self {
            credentials: collaborators.credentials,
            history: HistoryRecorder::new(collaborators.history),
            worker: Arc::new(worker),
            counters: Counters::default(),
        })
    }

    /// Obtain a token for `site`, returning the full acquisition detail.
    ///
    /// Callers see `Validation`, `NoAvailableAccount`, `Timeout` (coordinator
    /// or deadline) or `AutoTokenAcquisition` wrapping anything else.
    pub async fn acquire(
        &self,
        site: &str,
        credential_id: Option<u64>,
    ) -> Result<AcquisitionResult> {
        let started = Instant::now();
        self.counters.acquisitions.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard::enter(&self.counters.active);

        let outcome = self.run(site, credential_id, started).await;
        match &outcome {
            Ok(result) => {
                self.counters.successes.fetch_add(1, Ordering::SeqCst);
                metrics::record_acquisition(Some(result.method), true, result.duration);
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                metrics::record_acquisition(None, false, started.elapsed());
            }
        }
        outcome
    }

    /// Obtain just the token for `site`.
    pub async fn acquire_token(
        &self,
        site: &str,
        credential_id: Option<u64>,
    ) -> Result<Secret<String>> {
        self.acquire(site, credential_id).await.map(|result| result.token)
    }

    pub fn statistics(&self) -> Statistics {
        let acquisition_count = self.counters.acquisitions.load(Ordering::SeqCst);
        let success_count = self.counters.successes.load(Ordering::SeqCst);
        Statistics {
            acquisition_count,
            success_count,
            failure_count: self.counters.failures.load(Ordering::SeqCst),
            success_rate: if acquisition_count == 0 {
                0.0
            } else {
                success_count as f64 / acquisition_count as f64
            },
            active_acquisitions: self.counters.active.load(Ordering::SeqCst),
        }
    }

    pub fn selector(&self) -> &AccountSelector {
        &self.worker.selector
    }

    pub fn history(&self) -> &HistoryRecorder {
        &self.history
    }

    pub fn coordinator(&self) -> &ResourceCoordinator {
        &self.worker.coordinator
    }

    pub fn cache(&self) -> &TokenCache {
        &self.worker.cache
    }

    /// Total `LoginExecutor::login` invocations.
    pub fn login_invocations(&self) -> u64 {
        self.worker.executor.invocations()
    }

    async fn run(
        &self,
        site: &str,
        credential_id: Option<u64>,
        started: Instant,
    ) -> Result<AcquisitionResult> {
        let site = site.trim();
        if site.is_empty() {
            return Err(Error::Validation("site must not be empty".into()));
        }
        let request_id = format!("acq_{}", Uuid::new_v4().as_simple());

        let credential = match self.resolve(site, credential_id).await {
            Ok(credential) => credential,
            Err(e) => {
                let e = wrap(e, site, None, &[], started.elapsed());
                warn!(request_id = %request_id, site, error = %e, "credential resolution failed");
                self.history
                    .record_failure(&request_id, site, None, &e, started.elapsed())
                    .await;
                return Err(e);
            }
        };

        let log = AttemptLog::new();
        match self.obtain(&request_id, &credential, &log).await {
            Ok(obtained) => {
                let result = AcquisitionResult {
                    request_id,
                    site: credential.site.clone(),
                    account: credential.account.clone(),
                    credential_id: credential.id,
                    expires_at: obtained.token.expires_at,
                    token: obtained.token.token,
                    method: obtained.method,
                    duration: started.elapsed(),
                    attempts: log.snapshot(),
                    retries: obtained.retries,
                };
                info!(
                    request_id = %result.request_id,
                    site,
                    account = %result.account,
                    method = result.method.as_str(),
                    duration_ms = result.duration.as_millis() as u64,
                    "token acquired"
                );
                self.history.record_success(&result).await;
                Ok(result)
            }
            Err(e) => {
                let elapsed = started.elapsed();
                let e = wrap(e, site, Some(&credential), &log.snapshot(), elapsed);
                warn!(
                    request_id = %request_id,
                    site,
                    account = %credential.account,
                    error = %e,
                    "token acquisition failed"
                );
                self.history
                    .record_failure(&request_id, site, Some(&credential), &e, elapsed)
                    .await;
                Err(e)
            }
        }
    }

    async fn resolve(&self, site: &str, credential_id: Option<u64>) -> Result<Credential> {
        match credential_id {
            Some(id) => match self.credentials.get(id).await? {
                Some(credential) if credential.site == site => Ok(credential),
                Some(credential) => Err(Error::Validation(format!(
                    "credential {id} belongs to site {}, not {site}",
                    credential.site
                ))),
                None => Err(Error::Validation(format!("credential {id} not found"))),
            },
            None => self
                .worker
                .selector
                .select_account(site, &[])
                .await?
                .ok_or_else(|| Error::NoAvailableAccount {
                    site: site.to_string(),
                }),
        }
    }

    async fn obtain(
        &self,
        request_id: &str,
        credential: &Credential,
        log: &AttemptLog,
    ) -> Result<Obtained> {
        let worker = &self.worker;
        if let Some(hit) = worker.lookup(&credential.site, &credential.account).await? {
            debug!(request_id, account = %credential.account, method = hit.method.as_str(), "existing token");
            return Ok(hit);
        }

        let claim = Arc::new(Claim::default());
        let mut task = tokio::spawn({
            let worker = Arc::clone(worker);
            let claim = Arc::clone(&claim);
            let request_id = request_id.to_string();
            let credential = credential.clone();
            let log = log.clone();
            async move {
                worker
                    .obtain_locked(&request_id, &credential, &log, &claim)
                    .await
            }
        });

        let deadline = worker.config.orchestration.acquisition_timeout;
        let locked = match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // cancelled by runtime shutdown
            Ok(Err(_)) => Err(Error::Timeout {
                stage: TimeoutStage::Acquisition,
                elapsed: deadline,
                attempts: log.snapshot(),
            }),
            Err(_) => {
                if claim.abandon() {
                    task.abort();
                } else {
                    debug!(request_id, account = %credential.account, "login continues past caller deadline");
                }
                metrics::record_timeout(TimeoutStage::Acquisition);
                Err(Error::Timeout {
                    stage: TimeoutStage::Acquisition,
                    elapsed: deadline,
                    attempts: log.snapshot(),
                })
            }
        };

        match locked {
            Err(e @ Error::Timeout { stage, .. }) if stage != TimeoutStage::Login => {
                match worker.recheck_after_grace(credential).await {
                    Some(token) => {
                        info!(request_id, account = %credential.account, stage = stage.as_str(), "token appeared after timeout");
                        Ok(Obtained::existing(token, AcquisitionMethod::LoginAfterTimeoutRace))
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }
}

/// The parts of the orchestrator a spawned login task needs.
struct Worker {
    config: AcquisitionConfig,
    tokens: Arc<dyn TokenStore>,
    cache: Arc<TokenCache>,
    selector: AccountSelector,
    executor: LoginExecutor,
    coordinator: ResourceCoordinator,
    retry: RetryPolicy,
}

impl Worker {
    /// Everything done while holding the (site, account) permit.
    async fn obtain_locked(
        &self,
        request_id: &str,
        credential: &Credential,
        log: &AttemptLog,
        claim: &Claim,
    ) -> Result<Obtained> {
        let (site, account) = (credential.site.as_str(), credential.account.as_str());
        let permit = self.coordinator.acquire(request_id, site, account).await?;
        if !claim.commit() {
            debug!(request_id, account, "caller gave up before the permit was granted");
            return Err(Error::Timeout {
                stage: TimeoutStage::Acquisition,
                elapsed: self.config.orchestration.acquisition_timeout,
                attempts: Vec::new(),
            });
        }

        if let Some(hit) = self.lookup(site, account).await? {
            debug!(request_id, account, "token landed while waiting for permit");
            return Ok(hit);
        }

        let run = self
            .retry
            .execute(move |_| self.executor.login(credential, log))
            .await;
        debug!(request_id, account, policy_attempts = run.records.len(), "login run finished");

        let outcome = match run.result {
            Ok(issued) => {
                let token = StoredToken {
                    token: issued.token,
                    expires_at: issued.expires_at,
                    issued_at: common::now_millis(),
                };
                let saved = self.tokens.save(site, account, token.clone()).await;
                if saved.is_ok() {
                    self.cache.put(site, account, &token).await;
                }
                self.update_statistics(credential, true).await;
                saved
                    .map(|()| Obtained {
                        token,
                        method: AcquisitionMethod::Login,
                        retries: run.records,
                    })
                    .map_err(Error::from)
            }
            Err(e @ Error::Timeout { .. }) => match self.recheck_after_grace(credential).await {
                Some(token) => {
                    info!(request_id, account, "token appeared after login timeout");
                    Ok(Obtained::existing(token, AcquisitionMethod::LoginAfterTimeoutRace))
                }
                None => {
                    self.update_statistics(credential, false).await;
                    Err(e)
                }
            },
            Err(e) => {
                self.update_statistics(credential, false).await;
                Err(e)
            }
        };

        permit.release();
        outcome
    }

    /// Cache, then store. Store hits are written back into the cache.
    async fn lookup(&self, site: &str, account: &str) -> Result<Option<Obtained>> {
        if let Some(token) = self.cache.get(site, account).await {
            return Ok(Some(Obtained::existing(token, AcquisitionMethod::Cache)));
        }
        let margin = self.config.cache.expiry_margin.as_millis() as u64;
        match self.tokens.get(site, account).await? {
            Some(token) if token.is_usable(common::now_millis(), margin) => {
                self.cache.put(site, account, &token).await;
                Ok(Some(Obtained::existing(token, AcquisitionMethod::Store)))
            }
            _ => Ok(None),
        }
    }

    async fn recheck_after_grace(&self, credential: &Credential) -> Option<StoredToken> {
        tokio::time::sleep(self.config.orchestration.race_recheck_grace).await;
        let (site, account) = (credential.site.as_str(), credential.account.as_str());
        let margin = self.config.cache.expiry_margin.as_millis() as u64;
        match self.tokens.get(site, account).await {
            Ok(Some(token)) if token.is_usable(common::now_millis(), margin) => {
                self.cache.put(site, account, &token).await;
                Some(token)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(site, account, error = %e, "store re-check after timeout failed");
                None
            }
        }
    }

    async fn update_statistics(&self, credential: &Credential, success: bool) {
        if let Err(e) = self.selector.update_statistics(credential, success).await {
            warn!(
                site = %credential.site,
                account = %credential.account,
                error = %e,
                "failed to update credential statistics"
            );
        }
    }
}

/// Wrap login-path and store failures for the caller. Input problems and
/// coordinator or deadline timeouts pass through unchanged.
fn wrap(
    err: Error,
    site: &str,
    credential: Option<&Credential>,
    attempts: &[crate::model::LoginAttempt],
    elapsed: Duration,
) -> Error {
    match err {
        Error::Validation(_) | Error::NoAvailableAccount { .. } | Error::AutoTokenAcquisition(_) => {
            err
        }
        Error::Timeout { stage, .. } if stage != TimeoutStage::Login => err,
        cause => {
            let attempts = if attempts.is_empty() {
                cause.attempts().to_vec()
            } else {
                attempts.to_vec()
            };
            Error::AutoTokenAcquisition(Box::new(AcquisitionFailure {
                site: site.to_string(),
                account: credential.map(|c| c.account.clone()),
                class: cause.class(),
                cause,
                attempts,
                elapsed,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryClass;
    use crate::testing::{ScriptedPortal, credential, issued, portal_error};
    use portal::ErrorKind;
    use stores::{MemoryCredentialStore, MemoryHistoryStore, MemoryTokenStore};

    struct Harness {
        orchestrator: Arc<AcquisitionOrchestrator>,
        portal: Arc<ScriptedPortal>,
        credentials: Arc<MemoryCredentialStore>,
        tokens: Arc<MemoryTokenStore>,
        history: Arc<MemoryHistoryStore>,
    }

    fn fast_config() -> AcquisitionConfig {
        let mut config = AcquisitionConfig::default();
        config.login.network_base_delay = Duration::from_millis(5);
        config.login.captcha_retry_delay = Duration::from_millis(1);
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_secs(1);
        config.retry.not_found_delay = Duration::from_millis(10);
        config.orchestration.race_recheck_grace = Duration::from_millis(10);
        config
    }

    fn harness(portal: ScriptedPortal, credentials: Vec<Credential>, config: AcquisitionConfig) -> Harness {
        let portal = Arc::new(portal);
        let credentials = Arc::new(MemoryCredentialStore::new(credentials));
        let tokens = Arc::new(MemoryTokenStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let orchestrator = AcquisitionOrchestrator::new(
            config,
            Collaborators {
                portal: portal.clone(),
                credentials: credentials.clone(),
                tokens: tokens.clone(),
                history: history.clone(),
            },
        )
        .unwrap();
        Harness {
            orchestrator: Arc::new(orchestrator),
            portal,
            credentials,
            tokens,
            history,
        }
    }

    fn stored(token: &str) -> StoredToken {
        StoredToken {
            token: token.into(),
            expires_at: None,
            issued_at: common::now_millis(),
        }
    }

    #[tokio::test]
    async fn empty_site_touches_nothing() {
        let h = harness(
            ScriptedPortal::issuing("tok"),
            vec![credential(1, "site", "a")],
            fast_config(),
        );

        let err = h.orchestrator.acquire_token("   ", None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.credentials.calls(), 0);
        assert_eq!(h.tokens.gets(), 0);
        assert_eq!(h.portal.calls(), 0);
        assert!(h.history.records().await.is_empty());
        assert_eq!(h.orchestrator.statistics().failure_count, 1);
    }

    #[tokio::test]
    async fn stored_token_is_returned_without_login() {
        let h = harness(
            ScriptedPortal::issuing("fresh"),
            vec![credential(1, "site", "a")],
            fast_config(),
        );
        h.tokens.save("site", "a", stored("existing")).await.unwrap();

        let result = h.orchestrator.acquire("site", None).await.unwrap();
        assert_eq!(result.token.expose(), "existing");
        assert_eq!(result.method, AcquisitionMethod::Store);
        assert_eq!(h.orchestrator.login_invocations(), 0);

        // the store hit was cached
        let result = h.orchestrator.acquire("site", None).await.unwrap();
        assert_eq!(result.method, AcquisitionMethod::Cache);
        assert_eq!(h.portal.calls(), 0);
        assert_eq!(h.history.records().await.len(), 2);
    }

    #[tokio::test]
    async fn login_persists_caches_and_records() {
        let h = harness(
            ScriptedPortal::issuing("fresh"),
            vec![credential(1, "site", "a")],
            fast_config(),
        );

        let result = h.orchestrator.acquire("site", Some(1)).await.unwrap();
        assert_eq!(result.method, AcquisitionMethod::Login);
        assert_eq!(result.attempts.len(), 1);
        assert!(result.request_id.starts_with("acq_"));

        let saved = h.tokens.get("site", "a").await.unwrap().unwrap();
        assert_eq!(saved.token.expose(), "fresh");
        assert!(h.orchestrator.cache().get("site", "a").await.is_some());

        let cred = h.credentials.get(1).await.unwrap().unwrap();
        assert_eq!(cred.success_count, 1);

        let records = h.history.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method.as_deref(), Some("login"));

        let stats = h.orchestrator.statistics();
        assert_eq!(stats.acquisition_count, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.active_acquisitions, 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let h = harness(
            ScriptedPortal::issuing("shared").with_delay(Duration::from_millis(100)),
            vec![credential(1, "site", "a")],
            fast_config(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = h.orchestrator.clone();
            handles.push(tokio::spawn(async move { orchestrator.acquire("site", None).await }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.token.expose(), "shared");
        }

        assert_eq!(h.portal.calls(), 1);
        assert_eq!(h.orchestrator.login_invocations(), 1);
        assert_eq!(h.history.records().await.len(), 8);
    }

    #[tokio::test]
    async fn unknown_credential_id_is_validation_error() {
        let h = harness(
            ScriptedPortal::issuing("tok"),
            vec![credential(1, "other", "a")],
            fast_config(),
        );

        let err = h.orchestrator.acquire("site", Some(1)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");
        let err = h.orchestrator.acquire("site", Some(99)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");

        let records = h.history.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].error_kind.as_deref(), Some("validation"));
    }

    #[tokio::test]
    async fn no_credentials_is_no_available_account() {
        let h = harness(ScriptedPortal::issuing("tok"), Vec::new(), fast_config());

        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableAccount { .. }));
        assert_eq!(h.portal.calls(), 0);
    }

    #[tokio::test]
    async fn network_failures_are_retried_by_policy() {
        let mut config = fast_config();
        config.login.max_network_retries = 0;
        let portal = ScriptedPortal::scripted(
            vec![
                Err(portal_error(ErrorKind::Network)),
                Err(portal_error(ErrorKind::Network)),
                Err(portal_error(ErrorKind::Network)),
            ],
            Ok(issued("fourth")),
        );
        let h = harness(portal, vec![credential(1, "site", "a")], config);
        let started = std::time::Instant::now();

        let result = h.orchestrator.acquire("site", None).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.token.expose(), "fourth");
        assert_eq!(h.portal.calls(), 4);
        assert_eq!(result.attempts.len(), 4);
        assert_eq!(result.retries.len(), 4);
        assert_eq!(result.retries[0].class, Some(RetryClass::Network));
        assert_eq!(result.retries[3].class, None);
        // 10ms + 20ms + 40ms of backoff
        assert!(elapsed >= Duration::from_millis(70), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn permanent_failure_blacklists_and_wraps() {
        let h = harness(
            ScriptedPortal::failing(ErrorKind::Permission),
            vec![credential(1, "site", "a")],
            fast_config(),
        );

        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        match &err {
            Error::AutoTokenAcquisition(failure) => {
                assert_eq!(failure.class, RetryClass::Permission);
                assert_eq!(failure.account.as_deref(), Some("a"));
                assert_eq!(failure.attempts.len(), 1);
            }
            other => panic!("expected AutoTokenAcquisition, got {other:?}"),
        }
        assert_eq!(h.portal.calls(), 1);
        assert!(h.orchestrator.selector().blacklisted("site").await.contains("a"));
        assert_eq!(h.credentials.get(1).await.unwrap().unwrap().failure_count, 1);

        // blacklisted: nothing left to select
        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableAccount { .. }));

        let records = h.history.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].error_kind.as_deref(), Some("login_failed"));
        assert_eq!(records[0].attempts.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_caller_finds_racing_token() {
        let mut config = fast_config();
        config.limits.queue_timeout = Duration::from_millis(50);
        config.orchestration.race_recheck_grace = Duration::from_millis(400);
        let h = harness(
            ScriptedPortal::issuing("raced").with_delay(Duration::from_millis(200)),
            vec![credential(1, "site", "a")],
            config,
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.acquire("site", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = h.orchestrator.acquire("site", None).await.unwrap();

        assert_eq!(second.method, AcquisitionMethod::LoginAfterTimeoutRace);
        assert_eq!(second.token.expose(), "raced");
        assert_eq!(first.await.unwrap().unwrap().method, AcquisitionMethod::Login);
        assert_eq!(h.portal.calls(), 1);
    }

    #[tokio::test]
    async fn coordinator_timeout_without_token_surfaces_as_timeout() {
        let mut config = fast_config();
        config.limits.queue_timeout = Duration::from_millis(30);
        let h = harness(
            ScriptedPortal::issuing("slow").with_delay(Duration::from_millis(300)),
            vec![credential(1, "site", "a")],
            config,
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.acquire("site", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = h.orchestrator.acquire("site", None).await.unwrap_err();

        assert!(
            matches!(
                err,
                Error::Timeout {
                    stage: TimeoutStage::Queue,
                    ..
                }
            ),
            "got {err:?}"
        );
        first.await.unwrap().unwrap();
        // no statistics update for a request that never logged in
        let cred = h.credentials.get(1).await.unwrap().unwrap();
        assert_eq!(cred.failure_count, 0);
        assert_eq!(cred.success_count, 1);
    }

    #[tokio::test]
    async fn login_timeout_is_wrapped() {
        let mut config = fast_config();
        config.login.login_timeout = Duration::from_millis(30);
        config.retry.max_retries = 1;
        let h = harness(
            ScriptedPortal::issuing("late").with_delay(Duration::from_millis(100)),
            vec![credential(1, "site", "a")],
            config,
        );

        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, Error::AutoTokenAcquisition(_)), "got {err:?}");
        assert_eq!(err.class(), RetryClass::Timeout);
        assert_eq!(h.credentials.get(1).await.unwrap().unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn login_outliving_deadline_still_lands_once() {
        let mut config = fast_config();
        config.orchestration.acquisition_timeout = Duration::from_millis(50);
        config.orchestration.race_recheck_grace = Duration::from_millis(400);
        let h = harness(
            ScriptedPortal::issuing("slow").with_delay(Duration::from_millis(300)),
            vec![credential(1, "site", "a")],
            config,
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.acquire("site", Some(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = h.orchestrator.acquire("site", Some(1)).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.method, AcquisitionMethod::LoginAfterTimeoutRace);
        assert_eq!(second.method, AcquisitionMethod::LoginAfterTimeoutRace);
        assert_eq!(second.token.expose(), "slow");
        assert_eq!(h.portal.calls(), 1);
        assert_eq!(h.orchestrator.login_invocations(), 1);

        let cred = h.credentials.get(1).await.unwrap().unwrap();
        assert_eq!(cred.success_count, 1);
        assert_eq!(cred.failure_count, 0);
        assert!(h.orchestrator.selector().blacklisted("site").await.is_empty());
    }

    #[tokio::test]
    async fn failed_login_after_deadline_is_recorded_by_the_login() {
        let mut config = fast_config();
        config.orchestration.acquisition_timeout = Duration::from_millis(50);
        let h = harness(
            ScriptedPortal::failing(ErrorKind::Permission).with_delay(Duration::from_millis(150)),
            vec![credential(1, "site", "a")],
            config,
        );

        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Timeout {
                    stage: TimeoutStage::Acquisition,
                    ..
                }
            ),
            "got {err:?}"
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.portal.calls(), 1);
        assert_eq!(h.credentials.get(1).await.unwrap().unwrap().failure_count, 1);
        assert!(h.orchestrator.selector().blacklisted("site").await.contains("a"));
        assert_eq!(h.orchestrator.coordinator().snapshot().active_global, 0);
    }

    #[tokio::test]
    async fn caller_deadline_while_queued_gives_up_the_slot() {
        let mut config = fast_config();
        config.orchestration.acquisition_timeout = Duration::from_millis(50);
        let h = harness(
            ScriptedPortal::issuing("slow").with_delay(Duration::from_millis(300)),
            vec![credential(1, "site", "a")],
            config,
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.acquire("site", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = h.orchestrator.acquire("site", None).await.unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        // only the detached first login still holds capacity
        assert_eq!(h.orchestrator.coordinator().snapshot().active_global, 1);

        first.await.unwrap().unwrap_err();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.portal.calls(), 1);
        assert_eq!(h.orchestrator.coordinator().snapshot().active_global, 0);
        assert!(h.tokens.get("site", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expiring_stored_token_triggers_login() {
        let h = harness(
            ScriptedPortal::issuing("renewed"),
            vec![credential(1, "site", "a")],
            fast_config(),
        );
        let mut old = stored("stale");
        old.expires_at = Some(common::now_millis() + 60_000);
        h.tokens.save("site", "a", old).await.unwrap();

        let result = h.orchestrator.acquire("site", None).await.unwrap();
        assert_eq!(result.method, AcquisitionMethod::Login);
        assert_eq!(result.token.expose(), "renewed");
    }
}
