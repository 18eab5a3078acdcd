//! Credential-based token acquisition
//!
//! Obtains an access token for a site by logging in with a stored credential,
//! while guaranteeing that at most one login per (site, account) is in flight
//! and that callers observing an existing valid token never reach the login
//! path.
//!
//! Components:
//! - `AccountSelector` scores credentials and keeps a per-site blacklist
//! - `LoginExecutor` drives the blocking portal with nested retry loops
//! - `ResourceCoordinator` bounds concurrency and serialises per account
//! - `RetryPolicy` retries whole logins by failure class
//! - `TokenCache` holds disposable copies of tokens and selector snapshots
//! - `HistoryRecorder` writes one audit record per acquisition
//! - `AcquisitionOrchestrator` ties them together behind `acquire`

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod history;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod selector;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, TokenCache};
pub use config::{
    AcquisitionConfig, CacheConfig, LimitsConfig, LoginConfig, OrchestrationConfig, RetryConfig,
};
pub use coordinator::{CoordinatorSnapshot, Permit, ResourceCoordinator};
pub use error::{AcquisitionFailure, Error, Result, TimeoutStage};
pub use executor::LoginExecutor;
pub use history::{HistoryRecorder, HistorySummary};
pub use model::{AcquisitionMethod, AcquisitionResult, AttemptLog, LoginAttempt, Statistics};
pub use orchestrator::{AcquisitionOrchestrator, Collaborators};
pub use retry::{Jitter, RetryClass, RetryPolicy, RetryRecord, RetryRun, Strategy};
pub use selector::AccountSelector;
