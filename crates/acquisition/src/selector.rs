//! Credential scoring and per-site blacklist
//!
//! Selection is deterministic: every eligible credential gets a score and the
//! highest wins, ties going to the lowest credential id.
//!
//! ```text
//! score = 1000·preferred
//!       + max(0, 100 − hours since last success)   (0 if never succeeded)
//!       + min(success_count, 50)
//!       + 20·success ratio                          (10 if never attempted)
//! ```
//!
//! The blacklist is process-local. A failed login adds the account, a
//! successful one removes it, and an admin can clear it explicitly. Entries
//! are not time-boxed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use stores::{Credential, CredentialStore};
use tracing::{debug, info, warn};

use crate::cache::TokenCache;
use crate::error::Result;

const PREFERRED_WEIGHT: f64 = 1000.0;
const RECENCY_HOURS: f64 = 100.0;
const SUCCESS_COUNT_CAP: u64 = 50;
const RATIO_WEIGHT: f64 = 20.0;
const UNTRIED_RATIO_SCORE: f64 = 10.0;
const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Score a credential at `now_ms` (unix milliseconds).
pub fn score(credential: &Credential, now_ms: u64) -> f64 {
    let preferred = if credential.is_preferred {
        PREFERRED_WEIGHT
    } else {
        0.0
    };

    let recency = match credential.last_success_at {
        Some(at) => {
            let hours = now_ms.saturating_sub(at) as f64 / MILLIS_PER_HOUR;
            (RECENCY_HOURS - hours).max(0.0)
        }
        None => 0.0,
    };

    let volume = credential.success_count.min(SUCCESS_COUNT_CAP) as f64;

    let total = credential.success_count + credential.failure_count;
    let ratio = if total == 0 {
        UNTRIED_RATIO_SCORE
    } else {
        RATIO_WEIGHT * credential.success_count as f64 / total as f64
    };

    preferred + recency + volume + ratio
}

/// Per-site blacklist plus a generation bumped on every change that makes
/// cached snapshots stale.
#[derive(Default)]
struct SiteHealth {
    blacklist: BTreeSet<String>,
    generation: u64,
}

/// Picks the best credential for a site and tracks per-account health.
pub struct AccountSelector {
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<TokenCache>,
    sites: Mutex<HashMap<String, SiteHealth>>,
}

impl AccountSelector {
    pub fn new(credentials: Arc<dyn CredentialStore>, cache: Arc<TokenCache>) -> Self {
        Self {
            credentials,
            cache,
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// Highest-scoring credential for `site` that is neither blacklisted nor
    /// in `excluded`. `None` when no candidate remains.
    pub async fn select_account(
        &self,
        site: &str,
        excluded: &[u64],
    ) -> Result<Option<Credential>> {
        let candidates = self.credentials_for(site).await?;
        let blacklisted = self.blacklisted(site).await;
        let now = common::now_millis();

        let mut best: Option<(f64, Credential)> = None;
        for credential in candidates {
            if excluded.contains(&credential.id) || blacklisted.contains(&credential.account) {
                continue;
            }
            let s = score(&credential, now);
            let better = match &best {
                None => true,
                Some((best_score, best_cred)) => {
                    s > *best_score || (s == *best_score && credential.id < best_cred.id)
                }
            };
            if better {
                best = Some((s, credential));
            }
        }

        match &best {
            Some((s, credential)) => {
                debug!(site, account = %credential.account, id = credential.id, score = s, "selected credential")
            }
            None => debug!(site, blacklisted = blacklisted.len(), "no eligible credential"),
        }
        Ok(best.map(|(_, credential)| credential))
    }

    /// Record a login outcome for a credential.
    ///
    /// Updates the persisted counters, adjusts the blacklist, and drops the
    /// cached selector snapshots for the site. The blacklist is updated even
    /// if the store write fails; the store error is returned.
    pub async fn update_statistics(&self, credential: &Credential, success: bool) -> Result<()> {
        {
            let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
            let health = sites.entry(credential.site.clone()).or_default();
            health.generation += 1;
            if success {
                if health.blacklist.remove(&credential.account) {
                    info!(site = %credential.site, account = %credential.account, "account removed from blacklist");
                }
            } else if health.blacklist.insert(credential.account.clone()) {
                warn!(site = %credential.site, account = %credential.account, "account blacklisted after failed login");
            }
        }
        self.cache.invalidate_site(&credential.site).await;

        let stored = self
            .credentials
            .update_stats(credential.id, success, common::now_millis())
            .await;
        // readers that listed credentials before the write must not cache it
        self.bump(&credential.site);
        self.cache.invalidate_site(&credential.site).await;
        stored?;
        Ok(())
    }

    /// Admin override: remove an account from the blacklist. Returns whether
    /// it was blacklisted.
    pub async fn clear_blacklist(&self, site: &str, account: &str) -> bool {
        let removed = {
            let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
            sites.get_mut(site).is_some_and(|health| {
                let removed = health.blacklist.remove(account);
                if removed {
                    health.generation += 1;
                }
                removed
            })
        };
        if removed {
            info!(site, account, "blacklist entry cleared");
            self.cache.invalidate_site(site).await;
        }
        removed
    }

    /// Snapshot of blacklisted accounts for a site.
    pub async fn blacklisted(&self, site: &str) -> BTreeSet<String> {
        if let Some(snapshot) = self.cache.blacklist(site).await {
            return snapshot;
        }
        let (snapshot, generation) = {
            let sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
            sites
                .get(site)
                .map(|health| (health.blacklist.clone(), health.generation))
                .unwrap_or_default()
        };
        self.cache.put_blacklist(site, snapshot.clone()).await;
        self.discard_if_stale(site, generation).await;
        snapshot
    }

    async fn credentials_for(&self, site: &str) -> Result<Vec<Credential>> {
        if let Some(list) = self.cache.credential_list(site).await {
            return Ok(list);
        }
        let generation = self.generation(site);
        let list = self.credentials.list_by_site(site).await?;
        self.cache.put_credential_list(site, list.clone()).await;
        self.discard_if_stale(site, generation).await;
        Ok(list)
    }

    fn generation(&self, site: &str) -> u64 {
        let sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        sites.get(site).map_or(0, |health| health.generation)
    }

    fn bump(&self, site: &str) {
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        sites.entry(site.to_string()).or_default().generation += 1;
    }

    /// Drop snapshots cached from a read that raced a change.
    async fn discard_if_stale(&self, site: &str, generation: u64) {
        if self.generation(site) != generation {
            debug!(site, "selector snapshot went stale while caching");
            self.cache.invalidate_site(site).await;
        }
    }
}
