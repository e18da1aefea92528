use std::sync::Arc;
use tracing::debug;

use super::{JobStore, JobView};
use crate::groupkey::GROUP_KEY_LABEL;

/// Read-through view of previously submitted jobs, used for the group
/// deduplication check. Takes no lock of its own.
#[derive(Clone)]
pub struct ExistingJobIndex {
    jobs: Arc<dyn JobStore>,
}

impl ExistingJobIndex {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    pub async fn list_all(&self) -> Vec<JobView> {
        self.jobs.list().await
    }

    /// The first unfinished job labeled with `hashed_group_key`, if any.
    pub async fn find_active(&self, hashed_group_key: &str) -> Option<JobView> {
        if hashed_group_key.is_empty() {
            return None;
        }
        let found = self
            .list_all()
            .await
            .into_iter()
            .filter(|job| {
                job.labels.get(GROUP_KEY_LABEL).map(String::as_str) == Some(hashed_group_key)
            })
            .find(JobView::is_active);

        if let Some(job) = &found {
            debug!(
                job = %job.name,
                hashed_group_key,
                active = job.active,
                succeeded = job.succeeded,
                failed = job.failed,
                "Found existing job for group key"
            );
        }
        found
    }
}
