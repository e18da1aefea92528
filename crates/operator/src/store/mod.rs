mod config;
mod factory;
mod memory;
mod replicated;

pub use config::{AlertStoreConfig, StoreBackend};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use replicated::{ClusterPhase, ReplicatedStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::models::{Alert, AlertStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to marshal alert record: {0}")]
    Marshal(#[source] serde_json::Error),
    #[error("failed to unmarshal alert record: {0}")]
    Unmarshal(#[source] serde_json::Error),
    #[error("failed to join cluster: {0}")]
    Join(#[from] ClusterError),
    #[error("failed to leave cluster: {0}")]
    Leave(#[source] ClusterError),
    #[error("alert store is closed")]
    Closed,
}

/// The job that was submitted for an alert, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(rename = "configMapName", default)]
    pub template_source_name: String,
    #[serde(rename = "jobName", default)]
    pub job_name: String,
    #[serde(default)]
    pub image: String,
}

/// An alert as it was processed by this dispatcher. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert: Alert,
    pub status: AlertStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "jobInfo", default, skip_serializing_if = "Option::is_none")]
    pub job_info: Option<JobInfo>,
}

impl AlertRecord {
    pub fn new(alert: Alert, status: AlertStatus, job_info: Option<JobInfo>) -> Self {
        Self {
            alert,
            status,
            timestamp: Utc::now(),
            job_info,
        }
    }

    /// Whether two records describe the same processed alert. Replicas compare
    /// the processing timestamp and the full label set, which is stricter than
    /// timestamp plus `alertname` alone.
    pub fn same_identity(&self, other: &AlertRecord) -> bool {
        self.timestamp == other.timestamp && self.alert.labels == other.alert.labels
    }

    /// Case-insensitive substring match over status, alert name, label values,
    /// annotation values and job info. `needle` must already be lower-cased.
    pub fn matches(&self, needle: &str) -> bool {
        let contains = |haystack: &str| haystack.to_lowercase().contains(needle);

        if contains(self.status.as_str()) || contains(self.alert.name()) {
            return true;
        }
        if self.alert.labels.values().any(|v| contains(v.as_str())) {
            return true;
        }
        if self.alert.annotations.values().any(|v| contains(v.as_str())) {
            return true;
        }
        match &self.job_info {
            Some(info) => {
                contains(info.template_source_name.as_str())
                    || contains(info.job_name.as_str())
                    || contains(info.image.as_str())
            }
            None => false,
        }
    }
}

/// Select up to `limit` records from a newest-first sequence. A `limit` of 0
/// means unbounded; an empty query matches everything.
pub(crate) fn select_records<'a, I>(records: I, query: &str, limit: usize) -> Vec<AlertRecord>
where
    I: Iterator<Item = &'a AlertRecord>,
{
    let limit = if limit == 0 { usize::MAX } else { limit };
    let needle = query.to_lowercase();

    records
        .filter(|record| needle.is_empty() || record.matches(&needle))
        .take(limit)
        .cloned()
        .collect()
}

/// Bounded history of processed alerts. Implementations are safe to share
/// between concurrently running dispatch tasks.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Prepare backend resources.
    async fn initialize(&self) -> Result<(), StoreError>;

    async fn save_alert(&self, alert: Alert, status: AlertStatus) -> Result<(), StoreError> {
        self.save_alert_with_job_info(alert, status, None).await
    }

    /// Append a record, evicting the oldest one when the store is full.
    async fn save_alert_with_job_info(
        &self,
        alert: Alert,
        status: AlertStatus,
        job_info: Option<JobInfo>,
    ) -> Result<(), StoreError>;

    /// Newest-first records matching `query`, at most `limit` of them
    /// (0 = unbounded).
    async fn get_alerts(&self, query: &str, limit: usize) -> Result<Vec<AlertRecord>, StoreError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}
