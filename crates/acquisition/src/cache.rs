//! In-process token cache
//!
//! A disposable copy of tokens and selector inputs with per-entry expiry. The
//! cache is never the only copy of anything: callers mirror every token write
//! to the `TokenStore`, and every miss falls through to the store.
//!
//! Besides tokens it holds two short-lived snapshots per site, the credential
//! list and the blacklist, so that bursts of account selections do not hit
//! the credential store on every call.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stores::{Credential, StoredToken};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires: Instant,
}

impl<T: Clone> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires: Instant::now() + ttl,
        }
    }

    fn live(&self) -> Option<T> {
        (Instant::now() < self.expires).then(|| self.value.clone())
    }
}

/// Hit/miss counters for token lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Token, credential-list and blacklist cache.
pub struct TokenCache {
    config: CacheConfig,
    tokens: RwLock<HashMap<(String, String), Expiring<StoredToken>>>,
    credential_lists: RwLock<HashMap<String, Expiring<Vec<Credential>>>>,
    blacklists: RwLock<HashMap<String, Expiring<BTreeSet<String>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TokenCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            tokens: RwLock::new(HashMap::new()),
            credential_lists: RwLock::new(HashMap::new()),
            blacklists: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached token for (site, account), if present and not expired.
    pub async fn get(&self, site: &str, account: &str) -> Option<StoredToken> {
        let key = (site.to_string(), account.to_string());
        let found = self.tokens.read().await.get(&key).and_then(Expiring::live);
        match found {
            Some(token) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(token)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a token. Returns `false` when the token is already inside the
    /// expiry margin and was not cached.
    pub async fn put(&self, site: &str, account: &str, token: &StoredToken) -> bool {
        let Some(ttl) = self.token_ttl(token.expires_at, common::now_millis()) else {
            debug!(site, account, "token inside expiry margin, not caching");
            return false;
        };
        self.tokens.write().await.insert(
            (site.to_string(), account.to_string()),
            Expiring::new(token.clone(), ttl),
        );
        true
    }

    /// Drop the token entry for (site, account).
    pub async fn invalidate(&self, site: &str, account: &str) {
        self.tokens
            .write()
            .await
            .remove(&(site.to_string(), account.to_string()));
    }

    /// Lifetime a token may stay cached, `None` if it should not be cached.
    pub fn token_ttl(&self, expires_at: Option<u64>, now_ms: u64) -> Option<Duration> {
        match expires_at {
            None => Some(self.config.default_token_ttl),
            Some(expires_at) => {
                let margin = self.config.expiry_margin.as_millis() as u64;
                let remaining = expires_at.checked_sub(now_ms)?.checked_sub(margin)?;
                (remaining > 0).then(|| Duration::from_millis(remaining))
            }
        }
    }

    pub async fn credential_list(&self, site: &str) -> Option<Vec<Credential>> {
        self.credential_lists
            .read()
            .await
            .get(site)
            .and_then(Expiring::live)
    }

    pub async fn put_credential_list(&self, site: &str, credentials: Vec<Credential>) {
        self.credential_lists.write().await.insert(
            site.to_string(),
            Expiring::new(credentials, self.config.credential_list_ttl),
        );
    }

    pub async fn blacklist(&self, site: &str) -> Option<BTreeSet<String>> {
        self.blacklists.read().await.get(site).and_then(Expiring::live)
    }

    pub async fn put_blacklist(&self, site: &str, accounts: BTreeSet<String>) {
        self.blacklists.write().await.insert(
            site.to_string(),
            Expiring::new(accounts, self.config.blacklist_ttl),
        );
    }

    /// Drop both selector snapshots for a site after its data changed.
    pub async fn invalidate_site(&self, site: &str) {
        self.credential_lists.write().await.remove(site);
        self.blacklists.write().await.remove(site);
    }

    /// Remove expired token entries.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, entry| entry.expires > now);
        before - tokens.len()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.tokens.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: Option<u64>) -> StoredToken {
        StoredToken {
            token: "tok".into(),
            expires_at,
            issued_at: 0,
        }
    }

    #[test]
    fn ttl_subtracts_margin_from_known_expiry() {
        let cache = TokenCache::new(CacheConfig::default());
        let now = 1_000_000;
        // 10 minutes left, 5 minute margin
        assert_eq!(
            cache.token_ttl(Some(now + 600_000), now),
            Some(Duration::from_secs(300))
        );
        assert_eq!(cache.token_ttl(Some(now + 300_000), now), None);
        assert_eq!(cache.token_ttl(Some(now - 1), now), None);
        assert_eq!(cache.token_ttl(None, now), Some(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn token_without_expiry_lives_for_default_ttl() {
        let cache = TokenCache::new(CacheConfig::default());
        assert!(cache.put("site", "alice", &token(None)).await);
        assert!(cache.get("site", "alice").await.is_some());

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(cache.get("site", "alice").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn token_inside_margin_is_not_cached() {
        let cache = TokenCache::new(CacheConfig::default());
        let soon = common::now_millis() + 60_000;
        assert!(!cache.put("site", "alice", &token(Some(soon))).await);
        assert!(cache.get("site", "alice").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_token() {
        let cache = TokenCache::new(CacheConfig::default());
        cache.put("site", "alice", &token(None)).await;
        cache.invalidate("site", "alice").await;
        assert!(cache.get("site", "alice").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn site_snapshots_expire_and_invalidate() {
        let cache = TokenCache::new(CacheConfig::default());
        cache
            .put_blacklist("site", BTreeSet::from(["alice".to_string()]))
            .await;
        cache.put_credential_list("site", Vec::new()).await;
        assert!(cache.blacklist("site").await.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.blacklist("site").await.is_none());
        assert!(cache.credential_list("site").await.is_some());

        cache.invalidate_site("site").await;
        assert!(cache.credential_list("site").await.is_none());
    }
}
