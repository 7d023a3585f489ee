//! Jobsync spec mapper: translates desired-state documents into batch/v1 Job
//! objects and back, and builds minimal update patches.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use jobsync_core::{
    document::{Metadata, PodSpecDoc, TemplateDoc, TemplateMetadata},
    ContainerDoc, EnvVarDoc, JobDocument, JobSnapshot, JobStatusSummary, ResourceId, SyncError,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Labels the Job controller stamps on the pod template and selector. Only
/// filtered from the template; on the Job itself they may be user-authored.
const SERVER_LABELS: &[&str] = &[
    "controller-uid",
    "job-name",
    "batch.kubernetes.io/controller-uid",
    "batch.kubernetes.io/job-name",
];

fn max_doc_bytes() -> usize {
    std::env::var("JOBSYNC_MAX_DOC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_doc_nodes() -> usize {
    std::env::var("JOBSYNC_MAX_DOC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a YAML/JSON document. Accepts either the native document shape or a
/// `batch/v1` Job manifest, which is reduced to its authorable fields.
pub fn parse_document(text: &str) -> Result<JobDocument, SyncError> {
    let target = "<input document>";
    if text.len() > max_doc_bytes() {
        return Err(SyncError::invalid_spec(target, format!("document too large (>{} bytes)", max_doc_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| SyncError::invalid_spec(target, format!("parsing YAML: {}", e)))?;
    let json = serde_json::to_value(val)
        .map_err(|e| SyncError::invalid_spec(target, format!("converting YAML to JSON: {}", e)))?;
    if json_node_budget_exceeded(&json, max_doc_nodes()) {
        return Err(SyncError::invalid_spec(target, format!("document too complex (>{} nodes)", max_doc_nodes())));
    }
    let is_manifest = json.get("apiVersion").is_some() || json.get("kind").is_some();
    if is_manifest {
        let api_version = json.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        let kind = json.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        if api_version != "batch/v1" || kind != "Job" {
            return Err(SyncError::invalid_spec(target, format!("expected batch/v1 Job manifest, got {}/{}", api_version, kind)));
        }
        let dropped = unmanaged_manifest_fields(&json);
        if !dropped.is_empty() {
            warn!(fields = ?dropped, "manifest fields outside the managed subset are ignored");
        }
        let job: Job = serde_json::from_value(json)
            .map_err(|e| SyncError::invalid_spec(target, format!("decoding Job manifest: {}", e)))?;
        return Ok(from_remote_snapshot(&job));
    }
    serde_json::from_value(json).map_err(|e| SyncError::invalid_spec(target, format!("decoding document: {}", e)))
}

const MANIFEST_KEYS: &[&str] = &["apiVersion", "kind", "metadata", "spec", "status"];
const METADATA_KEYS: &[&str] = &["name", "namespace", "labels", "annotations"];
/// Server-populated metadata; present in exported manifests, never authored.
const SERVER_METADATA_KEYS: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];
const JOB_SPEC_KEYS: &[&str] = &["parallelism", "completions", "backoffLimit", "activeDeadlineSeconds", "ttlSecondsAfterFinished", "template"];
const TEMPLATE_KEYS: &[&str] = &["metadata", "spec"];
const TEMPLATE_METADATA_KEYS: &[&str] = &["labels", "annotations", "creationTimestamp"];
const POD_SPEC_KEYS: &[&str] = &["containers", "restartPolicy", "serviceAccountName", "nodeSelector"];
const CONTAINER_KEYS: &[&str] = &["name", "image", "command", "args", "env", "workingDir", "imagePullPolicy"];

/// Paths of fields in a `batch/v1` Job manifest that the document shape
/// cannot carry, e.g. `spec.template.spec.volumes` or
/// `spec.template.spec.containers[hello].resources`.
pub fn unmanaged_manifest_fields(manifest: &Json) -> Vec<String> {
    fn extra(v: Option<&Json>, known: &[&[&str]], prefix: &str, out: &mut Vec<String>) {
        if let Some(Json::Object(map)) = v {
            for k in map.keys() {
                if !known.iter().any(|set| set.contains(&k.as_str())) {
                    out.push(if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) });
                }
            }
        }
    }
    let mut out = Vec::new();
    extra(Some(manifest), &[MANIFEST_KEYS], "", &mut out);
    extra(manifest.get("metadata"), &[METADATA_KEYS, SERVER_METADATA_KEYS], "metadata", &mut out);
    let spec = manifest.get("spec");
    extra(spec, &[JOB_SPEC_KEYS], "spec", &mut out);
    let template = spec.and_then(|s| s.get("template"));
    extra(template, &[TEMPLATE_KEYS], "spec.template", &mut out);
    extra(template.and_then(|t| t.get("metadata")), &[TEMPLATE_METADATA_KEYS], "spec.template.metadata", &mut out);
    let pod = template.and_then(|t| t.get("spec"));
    extra(pod, &[POD_SPEC_KEYS], "spec.template.spec", &mut out);
    if let Some(Json::Array(containers)) = pod.and_then(|p| p.get("containers")) {
        for (i, c) in containers.iter().enumerate() {
            let name = c.get("name").and_then(|n| n.as_str()).map(str::to_string).unwrap_or_else(|| i.to_string());
            let prefix = format!("spec.template.spec.containers[{}]", name);
            extra(Some(c), &[CONTAINER_KEYS], &prefix, &mut out);
            if let Some(Json::Array(env)) = c.get("env") {
                for e in env.iter().filter(|e| e.get("valueFrom").is_some()) {
                    let var = e.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                    out.push(format!("{}.env[{}].valueFrom", prefix, var));
                }
            }
        }
    }
    out
}

/// Full create request. Unset optionals stay unset so the API server applies
/// its own defaults.
pub fn to_remote_shape(doc: &JobDocument) -> Result<Job, SyncError> {
    doc.validate_for_create()?;
    let spec = &doc.spec;
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(doc.name().to_string()),
            namespace: Some(doc.namespace().to_string()),
            labels: non_empty(&doc.metadata.labels),
            annotations: non_empty(&doc.metadata.annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: spec.parallelism,
            completions: spec.completions,
            backoff_limit: spec.backoff_limit,
            active_deadline_seconds: spec.active_deadline_seconds,
            ttl_seconds_after_finished: spec.ttl_seconds_after_finished,
            template: template_to_remote(&spec.template),
            ..Default::default()
        }),
        status: None,
    })
}

fn template_to_remote(t: &TemplateDoc) -> PodTemplateSpec {
    let meta = if t.metadata.labels.is_empty() && t.metadata.annotations.is_empty() {
        None
    } else {
        Some(ObjectMeta {
            labels: non_empty(&t.metadata.labels),
            annotations: non_empty(&t.metadata.annotations),
            ..Default::default()
        })
    };
    PodTemplateSpec { metadata: meta, spec: Some(pod_spec_to_remote(&t.spec)) }
}

fn pod_spec_to_remote(p: &PodSpecDoc) -> PodSpec {
    PodSpec {
        containers: p.containers.iter().map(container_to_remote).collect(),
        restart_policy: p.restart_policy.clone(),
        service_account_name: p.service_account_name.clone(),
        node_selector: non_empty(&p.node_selector),
        ..Default::default()
    }
}

fn container_to_remote(c: &ContainerDoc) -> Container {
    Container {
        name: c.name.clone(),
        image: c.image.clone(),
        command: c.command.clone(),
        args: c.args.clone(),
        env: c.env.as_ref().map(|vars| {
            vars.iter().map(|e| EnvVar { name: e.name.clone(), value: e.value.clone(), value_from: None }).collect()
        }),
        working_dir: c.working_dir.clone(),
        image_pull_policy: c.image_pull_policy.clone(),
        ..Default::default()
    }
}

fn non_empty(m: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if m.is_empty() { None } else { Some(m.clone()) }
}

/// Inverse mapping, restricted to fields a caller can author.
pub fn from_remote_snapshot(job: &Job) -> JobDocument {
    let m = &job.metadata;
    let spec = job.spec.as_ref();
    let template = spec.map(|s| &s.template);
    let tmeta = template.and_then(|t| t.metadata.as_ref());
    let pod = template.and_then(|t| t.spec.as_ref());
    JobDocument {
        metadata: Metadata {
            name: m.name.clone().unwrap_or_default(),
            namespace: m.namespace.clone(),
            labels: m.labels.clone().unwrap_or_default(),
            annotations: m.annotations.clone().unwrap_or_default(),
        },
        spec: jobsync_core::document::JobSpecDoc {
            parallelism: spec.and_then(|s| s.parallelism),
            completions: spec.and_then(|s| s.completions),
            backoff_limit: spec.and_then(|s| s.backoff_limit),
            active_deadline_seconds: spec.and_then(|s| s.active_deadline_seconds),
            ttl_seconds_after_finished: spec.and_then(|s| s.ttl_seconds_after_finished),
            template: TemplateDoc {
                metadata: TemplateMetadata {
                    labels: authored_labels(tmeta.and_then(|t| t.labels.as_ref())),
                    annotations: tmeta.and_then(|t| t.annotations.clone()).unwrap_or_default(),
                },
                spec: PodSpecDoc {
                    containers: pod.map(|p| p.containers.iter().map(container_from_remote).collect()).unwrap_or_default(),
                    restart_policy: pod.and_then(|p| p.restart_policy.clone()),
                    service_account_name: pod.and_then(|p| p.service_account_name.clone()),
                    node_selector: pod.and_then(|p| p.node_selector.clone()).unwrap_or_default(),
                },
            },
        },
    }
}

fn authored_labels(labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .map(|m| m.iter().filter(|(k, _)| !SERVER_LABELS.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn container_from_remote(c: &Container) -> ContainerDoc {
    ContainerDoc {
        name: c.name.clone(),
        image: c.image.clone(),
        command: c.command.clone(),
        args: c.args.clone(),
        env: c.env.as_ref().map(|vars| vars.iter().map(|e| EnvVarDoc { name: e.name.clone(), value: e.value.clone() }).collect()),
        working_dir: c.working_dir.clone(),
        image_pull_policy: c.image_pull_policy.clone(),
    }
}

/// Snapshot of a live Job. `requested` fills in identity parts the server
/// omitted from the response.
pub fn snapshot_from_remote(requested: &ResourceId, job: &Job) -> JobSnapshot {
    let m = &job.metadata;
    let id = match (m.namespace.as_deref(), m.name.as_deref()) {
        (Some(ns), Some(name)) => ResourceId::new(ns, name).unwrap_or_else(|_| requested.clone()),
        (None, Some(name)) => ResourceId::new(requested.namespace(), name).unwrap_or_else(|_| requested.clone()),
        _ => requested.clone(),
    };
    let status = job.status.as_ref();
    JobSnapshot {
        id,
        uid: m.uid.clone(),
        resource_version: m.resource_version.clone(),
        generation: m.generation,
        self_link: m.self_link.clone(),
        creation_timestamp: m.creation_timestamp.as_ref().map(|t| t.0.to_rfc3339()),
        deleting: m.deletion_timestamp.is_some(),
        status: JobStatusSummary {
            active: status.and_then(|s| s.active).unwrap_or(0),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
            failed: status.and_then(|s| s.failed).unwrap_or(0),
        },
        document: from_remote_snapshot(job),
    }
}

/// Minimal patch moving `current` to `desired`, pinned to `resource_version`
/// so the server rejects it if the object moved underneath us.
///
/// Returns `None` when nothing would change. Containers are always sent as a
/// complete, name-keyed list whenever any pod-spec field changes.
pub fn update_patch(current: &JobDocument, desired: &JobDocument, resource_version: &str) -> Option<Job> {
    let labels = changed_keys(&current.metadata.labels, &desired.metadata.labels);
    let annotations = changed_keys(&current.metadata.annotations, &desired.metadata.annotations);
    let spec = job_spec_patch(&current.spec, &desired.spec);
    if labels.is_none() && annotations.is_none() && spec.is_none() {
        debug!(name = %desired.name(), "no patchable changes");
        return None;
    }
    Some(Job {
        metadata: ObjectMeta {
            name: Some(desired.name().to_string()),
            namespace: Some(desired.namespace().to_string()),
            resource_version: (!resource_version.is_empty()).then(|| resource_version.to_string()),
            labels,
            annotations,
            ..Default::default()
        },
        spec,
        status: None,
    })
}

fn job_spec_patch(c: &jobsync_core::document::JobSpecDoc, d: &jobsync_core::document::JobSpecDoc) -> Option<JobSpec> {
    let mut spec = JobSpec {
        parallelism: changed(&c.parallelism, &d.parallelism),
        completions: changed(&c.completions, &d.completions),
        backoff_limit: changed(&c.backoff_limit, &d.backoff_limit),
        active_deadline_seconds: changed(&c.active_deadline_seconds, &d.active_deadline_seconds),
        ttl_seconds_after_finished: changed(&c.ttl_seconds_after_finished, &d.ttl_seconds_after_finished),
        ..Default::default()
    };
    let mut touched = spec.parallelism.is_some()
        || spec.completions.is_some()
        || spec.backoff_limit.is_some()
        || spec.active_deadline_seconds.is_some()
        || spec.ttl_seconds_after_finished.is_some();

    let tlabels = changed_keys(&c.template.metadata.labels, &d.template.metadata.labels);
    let tannos = changed_keys(&c.template.metadata.annotations, &d.template.metadata.annotations);
    if tlabels.is_some() || tannos.is_some() {
        spec.template.metadata = Some(ObjectMeta { labels: tlabels, annotations: tannos, ..Default::default() });
        touched = true;
    }

    let (cp, dp) = (&c.template.spec, &d.template.spec);
    let node_selector = changed_keys(&cp.node_selector, &dp.node_selector);
    let restart_policy = changed(&cp.restart_policy, &dp.restart_policy);
    let service_account_name = changed(&cp.service_account_name, &dp.service_account_name);
    if cp.containers != dp.containers || node_selector.is_some() || restart_policy.is_some() || service_account_name.is_some() {
        spec.template.spec = Some(PodSpec {
            containers: dp.containers.iter().map(container_to_remote).collect(),
            restart_policy,
            service_account_name,
            node_selector,
            ..Default::default()
        });
        touched = true;
    }
    if touched { Some(spec) } else { None }
}

fn changed<T: PartialEq + Clone>(current: &Option<T>, desired: &Option<T>) -> Option<T> {
    match desired {
        Some(d) if current.as_ref() != Some(d) => Some(d.clone()),
        _ => None,
    }
}

fn changed_keys(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let out: BTreeMap<String, String> = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if out.is_empty() { None } else { Some(out) }
}
