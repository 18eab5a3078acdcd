//! Acquisition audit trail
//!
//! Builds one `HistoryRecord` per finished acquisition and appends it to the
//! `HistoryStore`. A failed write is logged and counted but never turns a
//! successful acquisition into a failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stores::{AttemptRecord, Credential, HistoryRecord, HistoryStore};
use tracing::error;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{AcquisitionResult, LoginAttempt};

/// Aggregates over a window of recent history records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySummary {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub by_method: BTreeMap<String, usize>,
    pub by_error_kind: BTreeMap<String, usize>,
    pub average_duration_ms: u64,
}

pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn record_success(&self, result: &AcquisitionResult) {
        let record = HistoryRecord {
            id: Uuid::new_v4().to_string(),
            request_id: result.request_id.clone(),
            site: result.site.clone(),
            account: Some(result.account.clone()),
            credential_id: Some(result.credential_id),
            success: true,
            method: Some(result.method.as_str().to_string()),
            error_kind: None,
            error_message: None,
            duration_ms: result.duration.as_millis() as u64,
            attempts: attempt_records(&result.attempts),
            created_at: common::now_millis(),
        };
        self.write(record).await;
    }

    pub async fn record_failure(
        &self,
        request_id: &str,
        site: &str,
        credential: Option<&Credential>,
        err: &Error,
        duration: Duration,
    ) {
        let record = HistoryRecord {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            site: site.to_string(),
            account: credential.map(|c| c.account.clone()),
            credential_id: credential.map(|c| c.id),
            success: false,
            method: None,
            error_kind: Some(err.kind_label().to_string()),
            error_message: Some(err.to_string()),
            duration_ms: duration.as_millis() as u64,
            attempts: attempt_records(err.attempts()),
            created_at: common::now_millis(),
        };
        self.write(record).await;
    }

    async fn write(&self, record: HistoryRecord) {
        let request_id = record.request_id.clone();
        if let Err(e) = self.store.append(record).await {
            metrics::record_history_write_failure();
            error!(request_id = %request_id, error = %e, "failed to write acquisition history");
        }
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        Ok(self.store.recent(limit).await?)
    }
}

fn attempt_records(attempts: &[LoginAttempt]) -> Vec<AttemptRecord> {
    attempts.iter().map(AttemptRecord::from).collect()
}

pub fn summarize(records: &[HistoryRecord]) -> HistorySummary {
    let mut summary = HistorySummary {
        total: records.len(),
        ..HistorySummary::default()
    };
    let mut total_ms: u64 = 0;
    for record in records {
        if record.success {
            summary.successes += 1;
        } else {
            summary.failures += 1;
        }
        if let Some(method) = &record.method {
            *summary.by_method.entry(method.clone()).or_default() += 1;
        }
        if let Some(kind) = &record.error_kind {
            *summary.by_error_kind.entry(kind.clone()).or_default() += 1;
        }
        total_ms = total_ms.saturating_add(record.duration_ms);
    }
    if !records.is_empty() {
        summary.average_duration_ms = total_ms / records.len() as u64;
    }
    summary
}
