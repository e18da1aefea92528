//! Turns alerts into remediation jobs.
//!
//! Each alert goes through: group dedup check, template resolution, job
//! decoration, submission, and finally a record in the alert store. Every
//! path ends in exactly one record; only a successful submission carries job
//! info.
//!
//! The dedup check and the submission are not atomic. Two dispatches for the
//! same group that both see no active job will both submit. The job store's
//! name check does not close that window because job names are randomly
//! suffixed, so at most one active job per group is best-effort.

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::groupkey::hash_group_key;
use crate::kubernetes::{jobs, ExistingJobIndex, JobStore, TemplateSource};
use crate::metrics::JOBS_FAILED_TOTAL;
use crate::models::{sanitize_input, Alert, AlertStatus};
use crate::store::{AlertStore, JobInfo};
use crate::template::TemplateResolver;

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An unfinished job for the same group already exists.
    DedupSkip { existing_job: String },
    TemplateMissing,
    SubmitFailed,
    Submitted { job_name: String },
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Namespace holding the job templates.
    pub template_namespace: String,
    /// Labels every submitted job must carry.
    pub owner_labels: BTreeMap<String, String>,
    pub job_ttl_seconds: i32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            template_namespace: "default".to_string(),
            owner_labels: BTreeMap::from([("app".to_string(), "openfero".to_string())]),
            job_ttl_seconds: jobs::DEFAULT_TTL_SECONDS,
        }
    }
}

pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    index: ExistingJobIndex,
    templates: TemplateResolver,
    store: Arc<dyn AlertStore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        templates: Arc<dyn TemplateSource>,
        store: Arc<dyn AlertStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            index: ExistingJobIndex::new(jobs.clone()),
            templates: TemplateResolver::new(templates, settings.template_namespace.clone()),
            jobs,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Dispatch every alert of a webhook batch in its own task. The tasks are
    /// detached: dropping the returned handles does not cancel them.
    pub fn dispatch_batch(
        self: &Arc<Self>,
        alerts: Vec<Alert>,
        status: AlertStatus,
        group_key: &str,
    ) -> Vec<JoinHandle<DispatchOutcome>> {
        alerts
            .into_iter()
            .map(|alert| {
                let dispatcher = Arc::clone(self);
                let group_key = group_key.to_string();
                tokio::spawn(async move { dispatcher.dispatch(alert, status, &group_key).await })
            })
            .collect()
    }

    /// Dispatch one alert. Failures are logged and recorded, never returned.
    pub async fn dispatch(
        &self,
        alert: Alert,
        status: AlertStatus,
        group_key: &str,
    ) -> DispatchOutcome {
        let alert_name = sanitize_input(alert.name());

        if !group_key.is_empty() {
            let hashed = hash_group_key(group_key);
            if let Some(existing) = self.index.find_active(&hashed).await {
                info!(
                    alertname = %alert_name,
                    %status,
                    group_key,
                    job = %existing.name,
                    "Skipping job creation - job already exists for group"
                );
                self.record(alert, status, None).await;
                return DispatchOutcome::DedupSkip {
                    existing_job: existing.name,
                };
            }
        }

        let resolved = match self.templates.resolve_for(&alert_name, status).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(alertname = %alert_name, %status, "Failed to resolve job template: {}", e);
                self.record(alert, status, None).await;
                return DispatchOutcome::TemplateMissing;
            }
        };

        let job = self.decorate(resolved.job, &alert, group_key);
        let job_name = job.name_any();
        let image = jobs::first_container_image(&job).unwrap_or_default();

        match self.jobs.create(job).await {
            Ok(_) => {
                info!(job = %job_name, alertname = %alert_name, %status, "Successfully created remediation job");
                let info = JobInfo {
                    template_source_name: resolved.source_name,
                    job_name: job_name.clone(),
                    image,
                };
                self.record(alert, status, Some(info)).await;
                DispatchOutcome::Submitted { job_name }
            }
            Err(e) => {
                error!(job = %job_name, alertname = %alert_name, "Failed to create remediation job: {}", e);
                JOBS_FAILED_TOTAL.inc();
                self.record(alert, status, None).await;
                DispatchOutcome::SubmitFailed
            }
        }
    }

    fn decorate(&self, mut job: Job, alert: &Alert, group_key: &str) -> Job {
        jobs::add_labels_as_env_vars(&mut job, alert);
        if jobs::ensure_ttl(&mut job, self.settings.job_ttl_seconds) {
            debug!(job = %job.name_any(), "Added TTL to job");
        }
        if jobs::ensure_labels(&mut job, &self.settings.owner_labels) {
            debug!(job = %job.name_any(), "Added ownership labels to job");
        }
        jobs::add_group_key_label(&mut job, group_key);
        job
    }

    async fn record(&self, alert: Alert, status: AlertStatus, job_info: Option<JobInfo>) {
        let alert_name = alert.name().to_string();
        if let Err(e) = self
            .store
            .save_alert_with_job_info(alert, status, job_info)
            .await
        {
            error!(alertname = %alert_name, %status, "Failed to save alert: {}", e);
        }
    }
}
