//! Kubernetes collaborators: the job store jobs are submitted to and the
//! template source job documents are read from.

pub mod cache;
pub mod client;
pub mod index;
pub mod jobs;

pub use cache::WatchCache;
pub use client::{current_namespace, service_account_namespace, KubeJobStore, KubeTemplateSource};
pub use index::ExistingJobIndex;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("job {name} already exists")]
    AlreadyExists { name: String },
    #[error("job store error: {0}")]
    BackendFailure(String),
    #[error("job submission timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid object key {0:?}, expected namespace/name")]
    InvalidKey(String),
    #[error("{0}")]
    Backend(String),
}

/// Typed view over a job held by the job store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobView {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    /// Image of the first container.
    pub image: Option<String>,
}

impl JobView {
    /// Running, or pending with neither success nor failure recorded yet.
    pub fn is_active(&self) -> bool {
        self.active > 0 || (self.succeeded == 0 && self.failed == 0)
    }
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let status = job.status.clone().unwrap_or_default();
        Self {
            name: job.name_any(),
            namespace: job.namespace().unwrap_or_default(),
            labels: job.labels().clone(),
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            image: jobs::first_container_image(job),
        }
    }
}

/// A template source entry: a mapping from alert name to a job document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateDocument {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

/// The workload executor's job API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Look up a job by `namespace/name`.
    async fn get_by_key(&self, key: &str) -> Result<Option<JobView>, LookupError>;

    /// Submit a job. Fails with `AlreadyExists` if a job with the same name is
    /// already known.
    async fn create(&self, job: Job) -> Result<JobView, SubmissionError>;

    async fn list(&self) -> Vec<JobView>;
}

/// Read-only source of job templates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Look up a template document by `namespace/name`.
    async fn get_by_key(&self, key: &str) -> Result<Option<TemplateDocument>, LookupError>;
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
