//! JSON-file backed stores
//!
//! Credentials and tokens live in JSON files rewritten atomically (temp file +
//! rename) on every mutation, with 0600 permissions since both contain
//! secrets. A tokio Mutex per store serializes writers; reads clone out of the
//! in-memory state so they never wait on disk I/O beyond the lock. A mutation
//! becomes visible only once its write has succeeded.
//!
//! History is an append-only JSON-lines file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Credential, HistoryRecord, StoredToken};
use crate::{BoxFuture, CredentialStore, HistoryStore, TokenStore};

/// Credential file manager: a JSON object mapping credential id to record.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<BTreeMap<u64, Credential>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// credentials).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = load_or_create(&path, "credentials").await?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Add or replace a credential and persist to disk.
    pub async fn add(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        let (id, site) = (credential.id, credential.site.clone());
        let mut next = state.clone();
        next.insert(id, credential);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!(credential_id = id, site = %site, "added credential");
        Ok(())
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, id: u64) -> BoxFuture<'_, Result<Option<Credential>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(&id).cloned()) })
    }

    fn list_by_site<'a>(&'a self, site: &'a str) -> BoxFuture<'a, Result<Vec<Credential>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.values().filter(|c| c.site == site).cloned().collect())
        })
    }

    fn update_stats(&self, id: u64, success: bool, at: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            let credential = next
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("credential {id} not in credential store")))?;
            if success {
                credential.success_count += 1;
                credential.last_success_at = Some(at);
            } else {
                credential.failure_count += 1;
            }
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(credential_id = id, success, "updated credential statistics");
            Ok(())
        })
    }
}

/// Token file manager: `{ site: { account: token } }`.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, BTreeMap<String, StoredToken>>>,
}

impl FileTokenStore {
    /// Load tokens from the given file path, creating an empty file on cold start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = load_or_create(&path, "tokens").await?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl TokenStore for FileTokenStore {
    fn get<'a>(
        &'a self,
        site: &'a str,
        account: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredToken>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(site).and_then(|accounts| accounts.get(account)).cloned())
        })
    }

    fn save<'a>(
        &'a self,
        site: &'a str,
        account: &'a str,
        token: StoredToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.entry(site.to_string())
                .or_default()
                .insert(account.to_string(), token);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(site, account, "saved token");
            Ok(())
        })
    }
}

/// Append-only JSON-lines history file.
pub struct JsonlHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn append(&self, record: HistoryRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut line = serde_json::to_string(&record)
                .map_err(|e| Error::Parse(format!("serializing history record: {e}")))?;
            line.push('\n');

            let _guard = self.write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| Error::Io(format!("opening history file: {e}")))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Io(format!("appending history record: {e}")))?;
            file.flush()
                .await
                .map_err(|e| Error::Io(format!("flushing history file: {e}")))?;
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryRecord>>> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&self.path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(Error::Io(format!("reading history file: {e}"))),
            };

            let mut records: Vec<HistoryRecord> = contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| match serde_json::from_str(line) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed history line");
                        None
                    }
                })
                .collect();
            let skip = records.len().saturating_sub(limit);
            Ok(records.split_off(skip))
        })
    }
}

/// Read a JSON store file, or create it empty if it doesn't exist yet.
async fn load_or_create<T>(path: &Path, label: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    if path.exists() {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("reading {label} file: {e}")))?;
        let state = serde_json::from_str(&contents)
            .map_err(|e| Error::Parse(format!("parsing {label} file: {e}")))?;
        info!(path = %path.display(), label, "loaded store");
        Ok(state)
    } else {
        info!(path = %path.display(), label, "store file not found, starting empty");
        let state = T::default();
        // Create the empty file so future loads don't need the cold-start path
        write_atomic(path, &state).await?;
        Ok(state)
    }
}

/// Write a store file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target so a crash mid-write never leaves a truncated file. Sets file
/// permissions to 0600 (owner read/write only).
async fn write_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}
