use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{Alert, AlertStatus};
use crate::store::{select_records, AlertRecord, AlertStore, JobInfo, StoreError};

/// Single-process ring buffer of alert records, oldest at the front.
pub struct MemoryStore {
    records: RwLock<VecDeque<AlertRecord>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_alert_with_job_info(
        &self,
        alert: Alert,
        status: AlertStatus,
        job_info: Option<JobInfo>,
    ) -> Result<(), StoreError> {
        let record = AlertRecord::new(alert, status, job_info);

        let mut records = self.records.write().await;
        if records.len() >= self.capacity {
            debug!("Alert store is full, dropping oldest alert");
            records.pop_front();
        }
        records.push_back(record);

        Ok(())
    }

    async fn get_alerts(&self, query: &str, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(select_records(records.iter().rev(), query, limit))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
