//! Decoration applied to a resolved job before it is submitted.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::EnvVar;
use std::collections::BTreeMap;

use crate::groupkey::{hash_group_key, GROUP_KEY_LABEL};
use crate::models::Alert;

pub const ENV_PREFIX: &str = "OPENFERO_";
pub const DEFAULT_TTL_SECONDS: i32 = 300;

/// Expose every alert label to the first container as `OPENFERO_<LABEL>`.
pub fn add_labels_as_env_vars(job: &mut Job, alert: &Alert) {
    let Some(container) = job
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
    else {
        return;
    };

    let env = container.env.get_or_insert_with(Vec::new);
    env.extend(alert.labels.iter().map(|(key, value)| EnvVar {
        name: format!("{}{}", ENV_PREFIX, key.to_uppercase()),
        value: Some(value.clone()),
        ..Default::default()
    }));
}

/// Set the time-to-live after finish unless the template already has one.
/// Returns whether the job was changed.
pub fn ensure_ttl(job: &mut Job, ttl_seconds: i32) -> bool {
    let spec = job.spec.get_or_insert_with(Default::default);
    if spec.ttl_seconds_after_finished.is_some() {
        return false;
    }
    spec.ttl_seconds_after_finished = Some(ttl_seconds);
    true
}

/// Insert the ownership labels the job cache selects on. Labels the template
/// already sets are kept. Returns whether the job was changed.
pub fn ensure_labels(job: &mut Job, owner_labels: &BTreeMap<String, String>) -> bool {
    let labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in owner_labels {
        if labels.get(key) != Some(value) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Attach the hashed group key label. Empty group keys leave the job untouched.
pub fn add_group_key_label(job: &mut Job, group_key: &str) {
    let hashed = hash_group_key(group_key);
    if hashed.is_empty() {
        return;
    }
    job.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(GROUP_KEY_LABEL.to_string(), hashed);
}

pub fn first_container_image(job: &Job) -> Option<String> {
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        serde_json::from_value(json!({
            "metadata": {"name": "restart-pod-abcde"},
            "spec": {
                "template": {
                    "spec": {
                        "containers": [
                            {"name": "main", "image": "bitnami/kubectl:1.30", "env": [{"name": "MODE", "value": "auto"}]},
                            {"name": "sidecar", "image": "busybox"}
                        ],
                        "restartPolicy": "Never"
                    }
                }
            }
        }))
        .unwrap()
    }

    fn env_of(job: &Job, index: usize) -> Vec<(String, String)> {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[index]
            .env
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.name, e.value.unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_labels_become_env_vars_on_first_container() {
        let mut job = job();
        let alert = Alert::new([("alertname", "PodCrashLooping"), ("pod", "web-0")]);
        add_labels_as_env_vars(&mut job, &alert);

        let env = env_of(&job, 0);
        assert!(env.contains(&("MODE".into(), "auto".into())));
        assert!(env.contains(&("OPENFERO_ALERTNAME".into(), "PodCrashLooping".into())));
        assert!(env.contains(&("OPENFERO_POD".into(), "web-0".into())));
        assert!(env_of(&job, 1).is_empty());
    }

    #[test]
    fn test_env_vars_without_containers() {
        let mut job = Job::default();
        add_labels_as_env_vars(&mut job, &Alert::new([("alertname", "A")]));
        assert!(job.spec.is_none());
    }

    #[test]
    fn test_ttl_only_set_when_absent() {
        let mut job = job();
        assert!(ensure_ttl(&mut job, DEFAULT_TTL_SECONDS));
        assert_eq!(job.spec.as_ref().unwrap().ttl_seconds_after_finished, Some(300));

        job.spec.as_mut().unwrap().ttl_seconds_after_finished = Some(30);
        assert!(!ensure_ttl(&mut job, DEFAULT_TTL_SECONDS));
        assert_eq!(job.spec.as_ref().unwrap().ttl_seconds_after_finished, Some(30));
    }

    #[test]
    fn test_owner_labels_are_merged() {
        let mut job = job();
        job.metadata.labels = Some(BTreeMap::from([("team".to_string(), "sre".to_string())]));
        let owner = BTreeMap::from([("app".to_string(), "openfero".to_string())]);

        assert!(ensure_labels(&mut job, &owner));
        let labels = job.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("sre"));
        assert_eq!(labels.get("app").map(String::as_str), Some("openfero"));

        assert!(!ensure_labels(&mut job, &owner));
    }

    #[test]
    fn test_group_key_label() {
        let mut job = job();
        add_group_key_label(&mut job, "");
        assert!(job.metadata.labels.is_none());

        add_group_key_label(&mut job, "{}:{alertname=\"A\"}");
        let labels = job.metadata.labels.unwrap();
        assert_eq!(
            labels.get(GROUP_KEY_LABEL),
            Some(&hash_group_key("{}:{alertname=\"A\"}"))
        );
    }

    #[test]
    fn test_first_container_image() {
        assert_eq!(first_container_image(&job()).as_deref(), Some("bitnami/kubectl:1.30"));
        assert_eq!(first_container_image(&Job::default()), None);
    }
}
