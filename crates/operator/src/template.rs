//! Job templates: lookup by alert name and status, and instantiation into a
//! uniquely named job.

use k8s_openapi::api::batch::v1::Job;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::kubernetes::{object_key, LookupError, TemplateDocument, TemplateSource};
use crate::models::AlertStatus;

const TEMPLATE_PREFIX: &str = "openfero";
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LENGTH: usize = 5;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("template {source_name} has no job for alert {alert_name}")]
    TemplateNotFound {
        source_name: String,
        alert_name: String,
    },
    #[error("invalid job template for alert {alert_name}: {source}")]
    InvalidTemplate {
        alert_name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("incomplete job template for alert {alert_name}: {reason}")]
    IncompleteTemplate { alert_name: String, reason: String },
    #[error("template lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// A job instantiated from a template, ready for decoration.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    /// Name of the template source entry the job came from.
    pub source_name: String,
    pub job: Job,
}

/// Template source name for an alert: `openfero-<alertname>-<status>`, lower-cased.
pub fn template_name(alert_name: &str, status: AlertStatus) -> String {
    format!("{}-{}-{}", TEMPLATE_PREFIX, alert_name, status).to_lowercase()
}

/// Instantiate the job stored under `alert_name` in `document`. The job's
/// name gets a random suffix so repeated triggers never collide.
pub fn resolve(document: &TemplateDocument, alert_name: &str) -> Result<Job, ResolveError> {
    let body = document
        .data
        .get(alert_name)
        .filter(|body| !body.trim().is_empty())
        .ok_or_else(|| ResolveError::TemplateNotFound {
            source_name: document.name.clone(),
            alert_name: alert_name.to_string(),
        })?;

    let mut job: Job =
        serde_yaml::from_str(body).map_err(|source| ResolveError::InvalidTemplate {
            alert_name: alert_name.to_string(),
            source,
        })?;

    let incomplete = |reason: &str| ResolveError::IncompleteTemplate {
        alert_name: alert_name.to_string(),
        reason: reason.to_string(),
    };
    let base_name = job
        .metadata
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| incomplete("job has no metadata.name"))?;
    let has_container = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map_or(false, |pod| !pod.containers.is_empty());
    if !has_container {
        return Err(incomplete("job has no containers"));
    }

    let name = format!("{}-{}", base_name, random_suffix());
    debug!(original_name = %base_name, generated_name = %name, "Generated job name");
    job.metadata.name = Some(name);
    Ok(job)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LENGTH)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Looks up templates for alerts in one namespace of the template source.
#[derive(Clone)]
pub struct TemplateResolver {
    source: Arc<dyn TemplateSource>,
    namespace: String,
}

impl TemplateResolver {
    pub fn new(source: Arc<dyn TemplateSource>, namespace: impl Into<String>) -> Self {
        Self {
            source,
            namespace: namespace.into(),
        }
    }

    pub async fn resolve_for(
        &self,
        alert_name: &str,
        status: AlertStatus,
    ) -> Result<ResolvedTemplate, ResolveError> {
        let source_name = template_name(alert_name, status);
        debug!(configmap = %source_name, alertname = alert_name, %status, "Loading alert response template");

        let document = self
            .source
            .get_by_key(&object_key(&self.namespace, &source_name))
            .await?
            .ok_or_else(|| ResolveError::TemplateNotFound {
                source_name: source_name.clone(),
                alert_name: alert_name.to_string(),
            })?;

        let job = resolve(&document, alert_name)?;
        Ok(ResolvedTemplate { source_name, job })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::MockTemplateSource;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    const JOB_YAML: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: restart-deployment
spec:
  template:
    spec:
      containers:
        - name: kubectl
          image: bitnami/kubectl:1.30
          args: ["rollout", "restart", "deployment/web"]
      restartPolicy: Never
"#;

    fn document(alert_name: &str, body: &str) -> TemplateDocument {
        TemplateDocument {
            name: "openfero-highlatency-firing".to_string(),
            data: BTreeMap::from([(alert_name.to_string(), body.to_string())]),
        }
    }

    #[test]
    fn test_template_name_is_lowercase() {
        assert_eq!(
            template_name("HighLatency", AlertStatus::Firing),
            "openfero-highlatency-firing"
        );
        assert_eq!(
            template_name("DiskFull", AlertStatus::Resolved),
            "openfero-diskfull-resolved"
        );
    }

    #[test]
    fn test_resolve_appends_random_suffix() {
        let doc = document("HighLatency", JOB_YAML);
        let first = resolve(&doc, "HighLatency").unwrap();
        let second = resolve(&doc, "HighLatency").unwrap();

        let name = first.metadata.name.clone().unwrap();
        let suffix = name.strip_prefix("restart-deployment-").unwrap();
        assert_eq!(suffix.len(), SUFFIX_LENGTH);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        // 36^5 possible suffixes; a collision here would be a broken generator.
        assert_ne!(first.metadata.name, second.metadata.name);
    }

    #[test]
    fn test_missing_or_empty_template() {
        let doc = document("HighLatency", JOB_YAML);
        assert!(matches!(
            resolve(&doc, "Other"),
            Err(ResolveError::TemplateNotFound { .. })
        ));

        let empty = document("HighLatency", "  \n");
        assert!(matches!(
            resolve(&empty, "HighLatency"),
            Err(ResolveError::TemplateNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_template_keeps_parse_error() {
        let doc = document("HighLatency", "metadata: [unterminated");
        let err = resolve(&doc, "HighLatency").unwrap_err();
        assert!(matches!(err, ResolveError::InvalidTemplate { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_incomplete_templates() {
        let nameless = document("A", "spec:\n  template:\n    spec:\n      containers:\n        - name: c\n");
        assert!(matches!(
            resolve(&nameless, "A"),
            Err(ResolveError::IncompleteTemplate { .. })
        ));

        let no_containers = document("A", "metadata:\n  name: job\n");
        assert!(matches!(
            resolve(&no_containers, "A"),
            Err(ResolveError::IncompleteTemplate { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolver_looks_up_namespaced_template() {
        let mut source = MockTemplateSource::new();
        source
            .expect_get_by_key()
            .with(eq("ops/openfero-highlatency-firing"))
            .times(1)
            .returning(|_| Ok(Some(document("HighLatency", JOB_YAML))));
        source
            .expect_get_by_key()
            .with(eq("ops/openfero-highlatency-resolved"))
            .returning(|_| Ok(None));

        let resolver = TemplateResolver::new(Arc::new(source), "ops");
        let resolved = resolver
            .resolve_for("HighLatency", AlertStatus::Firing)
            .await
            .unwrap();
        assert_eq!(resolved.source_name, "openfero-highlatency-firing");
        assert!(resolved.job.metadata.name.unwrap().starts_with("restart-deployment-"));

        let err = resolver
            .resolve_for("HighLatency", AlertStatus::Resolved)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::TemplateNotFound { source_name, .. } if source_name == "openfero-highlatency-resolved"));
    }
}
