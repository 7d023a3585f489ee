//! Desired-state document for a batch Job.
//!
//! Every optional field is a statement of intent only when set: `None` (or an
//! empty map) means "no opinion", which lets the same type describe a full
//! create request and a partial update.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::id::ResourceId;

pub const DEFAULT_NAMESPACE: &str = "default";
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDocument {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: JobSpecDoc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpecDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    #[serde(default)]
    pub template: TemplateDoc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDoc {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub spec: PodSpecDoc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodSpecDoc {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Order-significant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVarDoc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvVarDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl JobDocument {
    pub fn builder(name: impl Into<String>) -> JobDocumentBuilder {
        JobDocumentBuilder { doc: JobDocument { metadata: Metadata { name: name.into(), ..Default::default() }, ..Default::default() } }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    /// Namespace the document targets; the API server's default when unset.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn containers(&self) -> &[ContainerDoc] { &self.spec.template.spec.containers }

    pub fn container(&self, name: &str) -> Option<&ContainerDoc> {
        self.containers().iter().find(|c| c.name == name)
    }

    /// Identifier this document resolves to once created.
    pub fn resource_id(&self) -> Result<ResourceId, SyncError> {
        ResourceId::new(self.namespace(), self.name())
    }

    fn target(&self) -> String {
        if self.metadata.name.is_empty() { "<unnamed job>".to_string() } else { format!("{}/{}", self.namespace(), self.name()) }
    }

    /// Full validation for a create request.
    pub fn validate_for_create(&self) -> Result<(), SyncError> {
        self.validate_common()?;
        let target = self.target();
        if self.containers().is_empty() {
            return Err(SyncError::invalid_spec(target, "spec.template.spec.containers must hold at least one container"));
        }
        for c in self.containers() {
            match c.image.as_deref() {
                Some(img) if !img.trim().is_empty() => {}
                _ => return Err(SyncError::invalid_spec(target, format!("container {:?} has no image", c.name))),
            }
        }
        Ok(())
    }

    /// Validation for an update document, where omitted fields keep their live value.
    pub fn validate_for_update(&self) -> Result<(), SyncError> {
        self.validate_common()?;
        for c in self.containers() {
            if matches!(c.image.as_deref(), Some(img) if img.trim().is_empty()) {
                return Err(SyncError::invalid_spec(self.target(), format!("container {:?} has an empty image", c.name)));
            }
        }
        Ok(())
    }

    fn validate_common(&self) -> Result<(), SyncError> {
        let target = self.target();
        if self.metadata.name.is_empty() {
            return Err(SyncError::invalid_spec(target, "metadata.name is required"));
        }
        check_dns_subdomain(&self.metadata.name, "metadata.name").map_err(|r| SyncError::invalid_spec(&target, r))?;
        if let Some(ns) = &self.metadata.namespace {
            check_dns_label(ns, "metadata.namespace").map_err(|r| SyncError::invalid_spec(&target, r))?;
        }
        let spec = &self.spec;
        for (field, v) in [
            ("spec.parallelism", spec.parallelism.map(i64::from)),
            ("spec.completions", spec.completions.map(i64::from)),
            ("spec.backoff_limit", spec.backoff_limit.map(i64::from)),
            ("spec.active_deadline_seconds", spec.active_deadline_seconds),
            ("spec.ttl_seconds_after_finished", spec.ttl_seconds_after_finished.map(i64::from)),
        ] {
            if let Some(v) = v {
                if v < 0 {
                    return Err(SyncError::invalid_spec(&target, format!("{} must be >= 0 (got {})", field, v)));
                }
            }
        }
        let mut seen = HashSet::new();
        for c in self.containers() {
            check_dns_label(&c.name, "container name").map_err(|r| SyncError::invalid_spec(&target, r))?;
            if !seen.insert(c.name.as_str()) {
                return Err(SyncError::invalid_spec(&target, format!("duplicate container name {:?}", c.name)));
            }
        }
        Ok(())
    }

    /// Lay `patch` over `self`: set fields win, unset fields keep the value
    /// held here, map keys merge, containers merge by name.
    pub fn overlay(&self, patch: &JobDocument) -> JobDocument {
        let mut out = self.clone();
        if !patch.metadata.name.is_empty() {
            out.metadata.name = patch.metadata.name.clone();
        }
        if patch.metadata.namespace.is_some() {
            out.metadata.namespace = patch.metadata.namespace.clone();
        }
        merge_map(&mut out.metadata.labels, &patch.metadata.labels);
        merge_map(&mut out.metadata.annotations, &patch.metadata.annotations);

        let (s, p) = (&mut out.spec, &patch.spec);
        overlay_opt(&mut s.parallelism, &p.parallelism);
        overlay_opt(&mut s.completions, &p.completions);
        overlay_opt(&mut s.backoff_limit, &p.backoff_limit);
        overlay_opt(&mut s.active_deadline_seconds, &p.active_deadline_seconds);
        overlay_opt(&mut s.ttl_seconds_after_finished, &p.ttl_seconds_after_finished);
        merge_map(&mut s.template.metadata.labels, &p.template.metadata.labels);
        merge_map(&mut s.template.metadata.annotations, &p.template.metadata.annotations);

        let (ps, pp) = (&mut s.template.spec, &p.template.spec);
        overlay_opt(&mut ps.restart_policy, &pp.restart_policy);
        overlay_opt(&mut ps.service_account_name, &pp.service_account_name);
        merge_map(&mut ps.node_selector, &pp.node_selector);
        for want in &pp.containers {
            match ps.containers.iter_mut().find(|c| c.name == want.name) {
                Some(have) => *have = have.overlay(want),
                None => ps.containers.push(want.clone()),
            }
        }
        out
    }
}

impl ContainerDoc {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self { name: name.into(), image: Some(image.into()), ..Default::default() }
    }

    /// A container entry that only names its target, for partial updates.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.get_or_insert_with(Vec::new).push(EnvVarDoc { name: name.into(), value: Some(value.into()) });
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn image_pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.image_pull_policy = Some(policy.into());
        self
    }

    fn overlay(&self, patch: &ContainerDoc) -> ContainerDoc {
        let mut out = self.clone();
        overlay_opt(&mut out.image, &patch.image);
        overlay_opt(&mut out.command, &patch.command);
        overlay_opt(&mut out.args, &patch.args);
        overlay_opt(&mut out.env, &patch.env);
        overlay_opt(&mut out.working_dir, &patch.working_dir);
        overlay_opt(&mut out.image_pull_policy, &patch.image_pull_policy);
        out
    }
}

fn overlay_opt<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(v) = src {
        *dst = Some(v.clone());
    }
}

fn merge_map(dst: &mut BTreeMap<String, String>, src: &BTreeMap<String, String>) {
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends.
fn check_dns_label(s: &str, what: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err(format!("{} must not be empty", what));
    }
    if s.len() > MAX_NAME_LEN {
        return Err(format!("{} {:?} is longer than {} characters", what, s, MAX_NAME_LEN));
    }
    let ok_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    let edge_ok = |c: Option<char>| c.map(|c| c.is_ascii_lowercase() || c.is_ascii_digit()).unwrap_or(false);
    if !s.chars().all(ok_char) || !edge_ok(s.chars().next()) || !edge_ok(s.chars().last()) {
        return Err(format!("{} {:?} must be a lowercase RFC 1123 label", what, s));
    }
    Ok(())
}

/// RFC 1123 subdomain, capped at the label length since the name is also
/// stamped into the `job-name` label on pods.
fn check_dns_subdomain(s: &str, what: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err(format!("{} must not be empty", what));
    }
    if s.len() > MAX_NAME_LEN {
        return Err(format!("{} {:?} is longer than {} characters", what, s, MAX_NAME_LEN));
    }
    let segment_ok = |seg: &str| {
        let edge_ok = |c: Option<char>| c.map(|c| c.is_ascii_lowercase() || c.is_ascii_digit()).unwrap_or(false);
        seg.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && edge_ok(seg.chars().next())
            && edge_ok(seg.chars().last())
    };
    if !s.split('.').all(segment_ok) {
        return Err(format!("{} {:?} must be a lowercase RFC 1123 subdomain", what, s));
    }
    Ok(())
}

/// Typed construction of documents, mostly for tests and embedding callers.
#[derive(Debug, Clone)]
pub struct JobDocumentBuilder {
    doc: JobDocument,
}

impl JobDocumentBuilder {
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.doc.metadata.namespace = Some(ns.into());
        self
    }

    pub fn label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.doc.metadata.labels.insert(k.into(), v.into());
        self
    }

    pub fn annotation(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.doc.metadata.annotations.insert(k.into(), v.into());
        self
    }

    pub fn parallelism(mut self, n: i32) -> Self {
        self.doc.spec.parallelism = Some(n);
        self
    }

    pub fn completions(mut self, n: i32) -> Self {
        self.doc.spec.completions = Some(n);
        self
    }

    pub fn backoff_limit(mut self, n: i32) -> Self {
        self.doc.spec.backoff_limit = Some(n);
        self
    }

    pub fn active_deadline_seconds(mut self, secs: i64) -> Self {
        self.doc.spec.active_deadline_seconds = Some(secs);
        self
    }

    pub fn ttl_seconds_after_finished(mut self, secs: i32) -> Self {
        self.doc.spec.ttl_seconds_after_finished = Some(secs);
        self
    }

    pub fn template_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.doc.spec.template.metadata.labels.insert(k.into(), v.into());
        self
    }

    pub fn template_annotation(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.doc.spec.template.metadata.annotations.insert(k.into(), v.into());
        self
    }

    pub fn restart_policy(mut self, policy: impl Into<String>) -> Self {
        self.doc.spec.template.spec.restart_policy = Some(policy.into());
        self
    }

    pub fn service_account_name(mut self, sa: impl Into<String>) -> Self {
        self.doc.spec.template.spec.service_account_name = Some(sa.into());
        self
    }

    pub fn node_selector(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.doc.spec.template.spec.node_selector.insert(k.into(), v.into());
        self
    }

    pub fn container(mut self, c: ContainerDoc) -> Self {
        self.doc.spec.template.spec.containers.push(c);
        self
    }

    pub fn build(self) -> JobDocument {
        self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(name: &str) -> JobDocument {
        JobDocument::builder(name)
            .parallelism(2)
            .template_label("job", "one")
            .container(ContainerDoc::new("hello", "alpine").command(["echo", "'hello'"]))
            .build()
    }

    #[test]
    fn yaml_document_parses_nested_fields() {
        let y = r#"
metadata:
  name: tf-acc-test-x
spec:
  parallelism: 2
  template:
    metadata:
      labels:
        job: one
    spec:
      containers:
        - name: hello
          image: alpine
          command: ["echo", "'hello'"]
"#;
        let doc: JobDocument = serde_yaml::from_str(y).unwrap();
        assert_eq!(doc, hello("tf-acc-test-x"));
        assert_eq!(doc.namespace(), "default");
        doc.validate_for_create().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let y = "metadata:\n  name: x\n  nmae: typo\n";
        assert!(serde_yaml::from_str::<JobDocument>(y).is_err());
    }

    #[test]
    fn create_validation_requires_a_container_with_image() {
        let empty = JobDocument::builder("job-a").parallelism(1).build();
        let e = empty.validate_for_create().unwrap_err();
        assert!(matches!(e, SyncError::InvalidSpec { .. }));
        assert!(e.to_string().contains("at least one container"), "e={}", e);

        let no_image = JobDocument::builder("job-a").container(ContainerDoc::named("c")).build();
        assert!(no_image.validate_for_create().unwrap_err().to_string().contains("no image"));
        // The same document is a valid partial update.
        no_image.validate_for_update().unwrap();
    }

    #[test]
    fn validation_rejects_bad_names_negatives_and_duplicates() {
        assert!(JobDocument::builder("").container(ContainerDoc::new("c", "i")).build().validate_for_create().is_err());
        assert!(JobDocument::builder("Upper").container(ContainerDoc::new("c", "i")).build().validate_for_create().is_err());
        assert!(JobDocument::builder("-lead").container(ContainerDoc::new("c", "i")).build().validate_for_create().is_err());
        let neg = JobDocument::builder("ok").parallelism(-1).container(ContainerDoc::new("c", "i")).build();
        assert!(neg.validate_for_create().unwrap_err().to_string().contains("spec.parallelism"));
        let dup = JobDocument::builder("ok")
            .container(ContainerDoc::new("c", "i"))
            .container(ContainerDoc::new("c", "j"))
            .build();
        assert!(dup.validate_for_create().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn job_names_may_contain_dots() {
        let dotted = JobDocument::builder("job.with.dots").container(ContainerDoc::new("c", "i")).build();
        dotted.validate_for_create().unwrap();
        dotted.resource_id().unwrap();

        for bad in [".lead", "trail.", "a..b", "a.-b", "Job.x"] {
            let doc = JobDocument::builder(bad).container(ContainerDoc::new("c", "i")).build();
            let e = doc.validate_for_create().unwrap_err();
            assert!(e.to_string().contains("subdomain"), "{}: {}", bad, e);
        }
        let long = format!("{}.{}", "a".repeat(40), "b".repeat(30));
        assert!(JobDocument::builder(long).container(ContainerDoc::new("c", "i")).build().validate_for_create().is_err());

        // containers and namespaces stay plain labels
        assert!(JobDocument::builder("ok").container(ContainerDoc::new("c.d", "i")).build().validate_for_create().is_err());
        assert!(JobDocument::builder("ok").namespace("ns.x").container(ContainerDoc::new("c", "i")).build().validate_for_create().is_err());
    }

    #[test]
    fn overlay_keeps_unset_fields_and_other_containers() {
        let current = JobDocument::builder("job-a")
            .parallelism(2)
            .label("team", "a")
            .container(ContainerDoc::new("hello", "alpine").command(["echo", "'hello'"]))
            .container(ContainerDoc::new("sidecar", "busybox").args(["sleep", "5"]))
            .build();
        let patch = JobDocument::builder("job-a")
            .label("tier", "batch")
            .container(ContainerDoc::named("hello").command(["echo", "'world'"]))
            .build();
        let merged = current.overlay(&patch);
        assert_eq!(merged.spec.parallelism, Some(2));
        assert_eq!(merged.metadata.labels.len(), 2);
        assert_eq!(merged.containers().len(), 2);
        let h = merged.container("hello").unwrap();
        assert_eq!(h.command.as_deref(), Some(&["echo".to_string(), "'world'".to_string()][..]));
        assert_eq!(h.image.as_deref(), Some("alpine"));
        assert_eq!(merged.container("sidecar"), current.container("sidecar"));
    }

    #[test]
    fn equality_is_order_sensitive_for_command_only() {
        let a = ContainerDoc::new("c", "i").command(["a", "b"]);
        let b = ContainerDoc::new("c", "i").command(["b", "a"]);
        assert_ne!(a, b);
        let x = JobDocument::builder("j").label("k1", "v1").label("k2", "v2").build();
        let y = JobDocument::builder("j").label("k2", "v2").label("k1", "v1").build();
        assert_eq!(x, y);
    }
}
