use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{
    object_key, JobStore, JobView, LookupError, SubmissionError, TemplateDocument, TemplateSource,
    WatchCache,
};
use crate::metrics::{JOBS_CREATED_TOTAL, JOBS_FAILED_TOTAL, JOBS_SUCCEEDED_TOTAL};

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace from the service account mount, when running in-cluster.
pub fn service_account_namespace() -> Option<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
}

/// Namespace the process runs in: the service account mount when in-cluster,
/// otherwise the client's default namespace.
pub fn current_namespace(client: &Client) -> String {
    service_account_namespace().unwrap_or_else(|| {
        debug!("Service account namespace not mounted, using client default");
        client.default_namespace().to_string()
    })
}

/// Job metrics derived from cache updates: a job seen for the first time
/// counts as created; `succeeded` or `failed` moving off zero counts once.
pub fn record_job_metrics(old: Option<&Job>, new: &Job) {
    let counts = |job: &Job| {
        let view = JobView::from(job);
        (view.succeeded, view.failed)
    };

    match old {
        None => {
            debug!(job = %new.name_any(), "Job added");
            JOBS_CREATED_TOTAL.inc();
        }
        Some(old) => {
            let (old_succeeded, old_failed) = counts(old);
            let (succeeded, failed) = counts(new);
            if succeeded > 0 && old_succeeded == 0 {
                debug!(job = %new.name_any(), "Job completed successfully");
                JOBS_SUCCEEDED_TOTAL.inc();
            }
            if failed > 0 && old_failed == 0 {
                debug!(job = %new.name_any(), "Job failed");
                JOBS_FAILED_TOTAL.inc();
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), LookupError> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(()),
        _ => Err(LookupError::InvalidKey(key.to_string())),
    }
}

fn submission_error(name: &str, err: kube::Error) -> SubmissionError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => SubmissionError::AlreadyExists {
            name: name.to_string(),
        },
        other => SubmissionError::BackendFailure(other.to_string()),
    }
}

/// Jobs in the destination namespace, read from a watch cache and created
/// through the API server.
pub struct KubeJobStore {
    api: Api<Job>,
    namespace: String,
    cache: Arc<WatchCache<Job>>,
    submit_timeout: Duration,
}

impl KubeJobStore {
    pub fn new(
        client: Client,
        namespace: &str,
        cache: Arc<WatchCache<Job>>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            cache,
            submit_timeout,
        }
    }

    /// A job cache that maintains the job metrics.
    pub fn metered_cache() -> WatchCache<Job> {
        WatchCache::new("Job").with_update_hook(Box::new(record_job_metrics))
    }
}

#[async_trait]
impl JobStore for KubeJobStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<JobView>, LookupError> {
        validate_key(key)?;
        Ok(self.cache.get(key).await.as_ref().map(JobView::from))
    }

    async fn create(&self, mut job: Job) -> Result<JobView, SubmissionError> {
        let name = job.name_any();
        if self
            .cache
            .get(&object_key(&self.namespace, &name))
            .await
            .is_some()
        {
            return Err(SubmissionError::AlreadyExists { name });
        }

        job.metadata.namespace = Some(self.namespace.clone());
        info!(job = %name, namespace = %self.namespace, "Creating job");

        let created = tokio::time::timeout(
            self.submit_timeout,
            self.api.create(&PostParams::default(), &job),
        )
        .await
        .map_err(|_| SubmissionError::Timeout)?
        .map_err(|e| {
            error!(job = %name, namespace = %self.namespace, "Error creating job: {}", e);
            submission_error(&name, e)
        })?;

        info!(job = %name, namespace = %self.namespace, "Job created successfully");
        Ok(JobView::from(&created))
    }

    async fn list(&self) -> Vec<JobView> {
        self.cache.list().await.iter().map(JobView::from).collect()
    }
}

/// Job templates stored as config maps.
pub struct KubeTemplateSource {
    cache: Arc<WatchCache<ConfigMap>>,
}

impl KubeTemplateSource {
    pub fn new(cache: Arc<WatchCache<ConfigMap>>) -> Self {
        Self { cache }
    }
}

fn template_document(cm: ConfigMap) -> TemplateDocument {
    TemplateDocument {
        name: cm.name_any(),
        data: cm.data.unwrap_or_default(),
    }
}

#[async_trait]
impl TemplateSource for KubeTemplateSource {
    async fn get_by_key(&self, key: &str) -> Result<Option<TemplateDocument>, LookupError> {
        validate_key(key)?;
        Ok(self.cache.get(key).await.map(template_document))
    }
}
