//! In-process store implementations
//!
//! Used when the broker is embedded without persistence and throughout the
//! acquisition tests. Each store counts its calls so tests can assert that a
//! code path never touched a collaborator.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Credential, HistoryRecord, StoredToken};
use crate::{BoxFuture, CredentialStore, HistoryStore, TokenStore};

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<BTreeMap<u64, Credential>>,
    calls: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: Mutex::new(credentials.into_iter().map(|c| (c.id, c)).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Add or replace a credential.
    pub async fn insert(&self, credential: Credential) {
        self.credentials.lock().await.insert(credential.id, credential);
    }

    /// Number of trait calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: u64) -> BoxFuture<'_, Result<Option<Credential>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.credentials.lock().await.get(&id).cloned()) })
    }

    fn list_by_site<'a>(&'a self, site: &'a str) -> BoxFuture<'a, Result<Vec<Credential>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let credentials = self.credentials.lock().await;
            Ok(credentials
                .values()
                .filter(|c| c.site == site)
                .cloned()
                .collect())
        })
    }

    fn update_stats(&self, id: u64, success: bool, at: u64) -> BoxFuture<'_, Result<()>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let mut credentials = self.credentials.lock().await;
            let credential = credentials
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            if success {
                credential.success_count += 1;
                credential.last_success_at = Some(at);
            } else {
                credential.failure_count += 1;
            }
            Ok(())
        })
    }
}

/// In-memory token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<(String, String), StoredToken>>,
    gets: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `save` calls served so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get<'a>(
        &'a self,
        site: &'a str,
        account: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredToken>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let tokens = self.tokens.lock().await;
            Ok(tokens
                .get(&(site.to_string(), account.to_string()))
                .cloned())
        })
    }

    fn save<'a>(
        &'a self,
        site: &'a str,
        account: &'a str,
        token: StoredToken,
    ) -> BoxFuture<'a, Result<()>> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.tokens
                .lock()
                .await
                .insert((site.to_string(), account.to_string()), token);
            Ok(())
        })
    }
}

/// In-memory history log.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every appended record, oldest first.
    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().await.clone()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, record: HistoryRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.records.lock().await.push(record);
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryRecord>>> {
        Box::pin(async move {
            let records = self.records.lock().await;
            let skip = records.len().saturating_sub(limit);
            Ok(records[skip..].to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: u64, site: &str) -> Credential {
        Credential {
            id,
            site: site.into(),
            account: format!("acct-{id}"),
            secret: "pw".into(),
            is_preferred: false,
            last_success_at: None,
            success_count: 0,
            failure_count: 0,
        }
    }

    #[tokio::test]
    async fn credential_store_counts_calls() {
        let store = MemoryCredentialStore::new([credential(1, "a"), credential(2, "b")]);
        assert_eq!(store.calls(), 0);

        assert!(store.get(1).await.unwrap().is_some());
        assert_eq!(store.list_by_site("b").await.unwrap().len(), 1);
        store.update_stats(2, false, 5).await.unwrap();

        assert_eq!(store.calls(), 3);
        assert_eq!(store.get(2).await.unwrap().unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn token_store_round_trip() {
        let store = MemoryTokenStore::new();
        assert!(store.get("a", "x").await.unwrap().is_none());
        store
            .save(
                "a",
                "x",
                StoredToken {
                    token: "tok".into(),
                    expires_at: None,
                    issued_at: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.get("a", "x").await.unwrap().unwrap().token.expose(), "tok");
        assert_eq!(store.gets(), 2);
        assert_eq!(store.saves(), 1);
    }
}
