//! Field-level drift between a desired document and a live one.
//!
//! Only fields the desired side sets are compared; anything it leaves unset
//! (or map keys it does not mention) is the server's business.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::document::{ContainerDoc, JobDocument};

/// One differing field, addressed by a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub desired: Json,
    /// `Null` when the live side has no value at all.
    pub live: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
}

impl DiffSummary {
    pub fn from_changes(changes: &[FieldChange]) -> Self {
        let adds = changes.iter().filter(|c| c.live.is_null()).count();
        DiffSummary { adds, updates: changes.len() - adds }
    }

    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0
    }
}

/// Fields where `live` does not match what `desired` asks for.
pub fn drift(desired: &JobDocument, live: &JobDocument) -> Vec<FieldChange> {
    let mut out = Vec::new();
    let (d, l) = (&desired.metadata, &live.metadata);
    if !d.name.is_empty() {
        cmp(&mut out, "metadata.name", &d.name, &l.name);
    }
    if d.namespace.is_some() {
        cmp(&mut out, "metadata.namespace", &desired.namespace(), &live.namespace());
    }
    cmp_map(&mut out, "metadata.labels", &d.labels, &l.labels);
    cmp_map(&mut out, "metadata.annotations", &d.annotations, &l.annotations);

    let (d, l) = (&desired.spec, &live.spec);
    cmp_opt(&mut out, "spec.parallelism", &d.parallelism, &l.parallelism);
    cmp_opt(&mut out, "spec.completions", &d.completions, &l.completions);
    cmp_opt(&mut out, "spec.backoff_limit", &d.backoff_limit, &l.backoff_limit);
    cmp_opt(&mut out, "spec.active_deadline_seconds", &d.active_deadline_seconds, &l.active_deadline_seconds);
    cmp_opt(&mut out, "spec.ttl_seconds_after_finished", &d.ttl_seconds_after_finished, &l.ttl_seconds_after_finished);
    cmp_map(&mut out, "spec.template.metadata.labels", &d.template.metadata.labels, &l.template.metadata.labels);
    cmp_map(&mut out, "spec.template.metadata.annotations", &d.template.metadata.annotations, &l.template.metadata.annotations);

    let (d, l) = (&d.template.spec, &l.template.spec);
    cmp_opt(&mut out, "spec.template.spec.restart_policy", &d.restart_policy, &l.restart_policy);
    cmp_opt(&mut out, "spec.template.spec.service_account_name", &d.service_account_name, &l.service_account_name);
    cmp_map(&mut out, "spec.template.spec.node_selector", &d.node_selector, &l.node_selector);
    for want in &d.containers {
        let base = format!("spec.template.spec.containers[{}]", want.name);
        match l.containers.iter().find(|c| c.name == want.name) {
            Some(have) => container_drift(&mut out, &base, want, have),
            None => out.push(FieldChange { path: base, desired: to_json(want), live: Json::Null }),
        }
    }
    out
}

fn container_drift(out: &mut Vec<FieldChange>, base: &str, d: &ContainerDoc, l: &ContainerDoc) {
    cmp_opt(out, &format!("{}.image", base), &d.image, &l.image);
    cmp_opt(out, &format!("{}.command", base), &d.command, &l.command);
    cmp_opt(out, &format!("{}.args", base), &d.args, &l.args);
    cmp_opt(out, &format!("{}.env", base), &d.env, &l.env);
    cmp_opt(out, &format!("{}.working_dir", base), &d.working_dir, &l.working_dir);
    cmp_opt(out, &format!("{}.image_pull_policy", base), &d.image_pull_policy, &l.image_pull_policy);
}

fn cmp<T: Serialize + PartialEq>(out: &mut Vec<FieldChange>, path: &str, d: &T, l: &T) {
    if d != l {
        out.push(FieldChange { path: path.to_string(), desired: to_json(d), live: to_json(l) });
    }
}

fn cmp_opt<T: Serialize + PartialEq>(out: &mut Vec<FieldChange>, path: &str, d: &Option<T>, l: &Option<T>) {
    if let Some(dv) = d {
        match l {
            Some(lv) => cmp(out, path, dv, lv),
            None => out.push(FieldChange { path: path.to_string(), desired: to_json(dv), live: Json::Null }),
        }
    }
}

fn cmp_map(out: &mut Vec<FieldChange>, path: &str, d: &BTreeMap<String, String>, l: &BTreeMap<String, String>) {
    for (k, dv) in d {
        let p = format!("{}.{}", path, k);
        match l.get(k) {
            Some(lv) => cmp(out, &p, dv, lv),
            None => out.push(FieldChange { path: p, desired: Json::String(dv.clone()), live: Json::Null }),
        }
    }
}

fn to_json<T: Serialize>(v: &T) -> Json {
    serde_json::to_value(v).unwrap_or(Json::Null)
}
