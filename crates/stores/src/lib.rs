//! Persistent stores consumed by token acquisition
//!
//! Three collaborators sit behind dyn-compatible traits so the acquisition
//! layer never knows where data lives:
//! - `CredentialStore`: site/account/secret records plus success statistics
//! - `TokenStore`: the authoritative copy of every issued token
//! - `HistoryStore`: append-only audit log of completed acquisitions
//!
//! `file` provides JSON-file implementations with atomic writes; `memory`
//! provides in-process implementations for embedding and tests.

pub mod error;
pub mod file;
pub mod memory;
pub mod model;

pub use error::{Error, Result};
pub use file::{FileCredentialStore, FileTokenStore, JsonlHistoryStore};
pub use memory::{MemoryCredentialStore, MemoryHistoryStore, MemoryTokenStore};
pub use model::{AttemptRecord, Credential, HistoryRecord, StoredToken};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store trait methods.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn TokenStore>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persisted credential records.
pub trait CredentialStore: Send + Sync {
    /// Fetch one credential by id.
    fn get(&self, id: u64) -> BoxFuture<'_, Result<Option<Credential>>>;

    /// All credentials registered for a site, in id order.
    fn list_by_site<'a>(&'a self, site: &'a str) -> BoxFuture<'a, Result<Vec<Credential>>>;

    /// Increment the success or failure counter; success also stamps
    /// `last_success_at` with `at` (unix ms).
    fn update_stats(&self, id: u64, success: bool, at: u64) -> BoxFuture<'_, Result<()>>;
}

/// Persisted tokens, keyed by (site, account).
pub trait TokenStore: Send + Sync {
    fn get<'a>(&'a self, site: &'a str, account: &'a str)
    -> BoxFuture<'a, Result<Option<StoredToken>>>;

    /// Insert or replace the token for (site, account).
    fn save<'a>(
        &'a self,
        site: &'a str,
        account: &'a str,
        token: StoredToken,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Durable audit sink for acquisition outcomes.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: HistoryRecord) -> BoxFuture<'_, Result<()>>;

    /// The most recent `limit` records, oldest first.
    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryRecord>>>;
}
