//! In-memory stand-in for the batch/v1 Jobs API.
//!
//! Models the parts of the real server the reconciler has to cope with:
//! server-assigned metadata and defaults, resourceVersion preconditions,
//! strategic-merge patches keyed by container name, stale reads after writes,
//! and finalizers that keep a deleted object visible for a while.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use jobsync_core::{ContainerDoc, JobDocument};
use jobsync_kubehub::{JobApi, RemoteError};
use jobsync_reconciler::{ReconcilerConfig, RetryPolicy};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Get,
    Update,
    Delete,
}

/// How long a deleted object stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    Immediate,
    /// Visible (with deletionTimestamp) for this many further reads.
    AfterReads(u32),
    Never,
}

struct Entry {
    job: Job,
    /// Value served instead of `job` for the next `n` reads.
    stale: Option<(Option<Job>, u32)>,
    /// Remaining reads before a deleting object disappears; `None` = not deleting.
    removal_in: Option<u32>,
}

struct Fault {
    op: FakeOp,
    error: RemoteError,
    remaining: u32,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, String), Entry>,
    next_rv: u64,
    read_lag: u32,
    finalize: Option<Finalize>,
    faults: Vec<Fault>,
    delays: HashMap<FakeOp, Duration>,
    bump_before_update: bool,
    calls: HashMap<FakeOp, u32>,
}

pub struct FakeCluster {
    inner: Mutex<Inner>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { next_rv: 100, finalize: Some(Finalize::Immediate), ..Default::default() }) }
    }

    /// Every write is followed by `n` reads that still return the previous state.
    pub fn with_read_lag(self, n: u32) -> Self {
        self.inner.lock().unwrap().read_lag = n;
        self
    }

    pub fn with_finalize(self, f: Finalize) -> Self {
        self.inner.lock().unwrap().finalize = Some(f);
        self
    }

    pub fn fail_next(&self, op: FakeOp, error: RemoteError, times: u32) {
        self.inner.lock().unwrap().faults.push(Fault { op, error, remaining: times });
    }

    /// Delay the next call of `op` by `d` before it is served.
    pub fn delay_next(&self, op: FakeOp, d: Duration) {
        self.inner.lock().unwrap().delays.insert(op, d);
    }

    /// Simulate a concurrent writer landing between our read and our patch.
    pub fn bump_before_next_update(&self) {
        self.inner.lock().unwrap().bump_before_update = true;
    }

    pub fn calls(&self, op: FakeOp) -> u32 {
        self.inner.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    /// Raw stored object, bypassing read lag.
    pub fn stored(&self, ns: &str, name: &str) -> Option<Job> {
        self.inner.lock().unwrap().objects.get(&key(ns, name)).map(|e| e.job.clone())
    }

    pub fn delete_out_of_band(&self, ns: &str, name: &str) {
        self.inner.lock().unwrap().objects.remove(&key(ns, name));
    }

    /// Someone deleted the object and created a new one under the same name.
    pub fn replace_out_of_band(&self, ns: &str, name: &str) {
        let mut g = self.inner.lock().unwrap();
        let rv = g.bump();
        if let Some(e) = g.objects.get_mut(&key(ns, name)) {
            e.job.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            e.job.metadata.resource_version = Some(rv);
            e.job.metadata.generation = Some(1);
            e.stale = None;
            e.removal_in = None;
        }
    }

    /// Change something the caller did not author (e.g. another controller's label).
    pub fn label_out_of_band(&self, ns: &str, name: &str, k: &str, v: &str) {
        let mut g = self.inner.lock().unwrap();
        let rv = g.bump();
        if let Some(e) = g.objects.get_mut(&key(ns, name)) {
            e.job.metadata.labels.get_or_insert_with(Default::default).insert(k.into(), v.into());
            e.job.metadata.resource_version = Some(rv);
        }
    }

    fn enter(&self, op: FakeOp) -> (Result<(), RemoteError>, Option<Duration>) {
        let mut g = self.inner.lock().unwrap();
        *g.calls.entry(op).or_insert(0) += 1;
        let delay = g.delays.remove(&op);
        let mut res = Ok(());
        if let Some(pos) = g.faults.iter().position(|f| f.op == op && f.remaining > 0) {
            let f = &mut g.faults[pos];
            f.remaining -= 1;
            res = Err(f.error.clone());
            if f.remaining == 0 {
                g.faults.remove(pos);
            }
        }
        (res, delay)
    }

    async fn gate(&self, op: FakeOp) -> Result<(), RemoteError> {
        let (res, delay) = self.enter(op);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        res
    }
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

fn key(ns: &str, name: &str) -> (String, String) {
    (ns.to_string(), name.to_string())
}

/// Strategic-merge subset: objects merge recursively, `null` deletes, lists
/// of named objects merge by `name`, any other list is replaced.
fn merge(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    b.remove(k);
                } else if let Some(existing) = b.get_mut(k) {
                    merge(existing, v);
                } else {
                    b.insert(k.clone(), v.clone());
                }
            }
        }
        (Json::Array(b), Json::Array(p)) if is_named_list(b) && is_named_list(p) => {
            for item in p {
                let name = item.get("name").cloned();
                match b.iter_mut().find(|x| x.get("name") == name.as_ref()) {
                    Some(existing) => merge(existing, item),
                    None => b.push(item.clone()),
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}

fn is_named_list(items: &[Json]) -> bool {
    items.iter().all(|x| x.get("name").map(Json::is_string).unwrap_or(false))
}

#[async_trait::async_trait]
impl JobApi for FakeCluster {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job, RemoteError> {
        self.gate(FakeOp::Create).await?;
        let mut g = self.inner.lock().unwrap();
        let name = job.metadata.name.clone().ok_or_else(|| RemoteError::Invalid("metadata.name: Required value".into()))?;
        let k = key(namespace, &name);
        if g.objects.contains_key(&k) {
            return Err(RemoteError::AlreadyExists(format!("jobs.batch \"{}\" already exists", name)));
        }
        let rv = g.bump();
        let uid = uuid::Uuid::new_v4().to_string();
        let mut stored = job.clone();
        let m = &mut stored.metadata;
        m.namespace = Some(namespace.to_string());
        m.uid = Some(uid.clone());
        m.resource_version = Some(rv);
        m.generation = Some(1);
        m.self_link = Some(format!("/apis/batch/v1/namespaces/{}/jobs/{}", namespace, name));
        m.creation_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        let spec = stored.spec.get_or_insert_with(Default::default);
        spec.backoff_limit.get_or_insert(6);
        let labels = spec.template.metadata.get_or_insert_with(Default::default).labels.get_or_insert_with(Default::default);
        labels.insert("controller-uid".into(), uid.clone());
        labels.insert("job-name".into(), name.clone());
        // Job labels default to the template's when none were given
        if stored.metadata.labels.as_ref().map_or(true, |l| l.is_empty()) {
            stored.metadata.labels = Some(labels.clone());
        }
        let spec = stored.spec.get_or_insert_with(Default::default);
        if let Some(pod) = spec.template.spec.as_mut() {
            for c in pod.containers.iter_mut() {
                c.image_pull_policy.get_or_insert_with(|| "IfNotPresent".to_string());
            }
        }
        let parallelism = spec.parallelism.unwrap_or(1);
        stored.status = Some(JobStatus { active: Some(parallelism), ..Default::default() });

        let stale = if g.read_lag > 0 { Some((None, g.read_lag)) } else { None };
        g.objects.insert(k, Entry { job: stored.clone(), stale, removal_in: None });
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Job, RemoteError> {
        self.gate(FakeOp::Get).await?;
        let mut g = self.inner.lock().unwrap();
        let k = key(namespace, name);
        let entry = g.objects.get_mut(&k).ok_or(RemoteError::NotFound)?;
        if let Some((stale, left)) = entry.stale.as_mut() {
            if *left > 0 {
                *left -= 1;
                return stale.clone().ok_or(RemoteError::NotFound);
            }
            entry.stale = None;
        }
        let removal = entry.removal_in;
        match removal {
            Some(0) => {
                g.objects.remove(&k);
                Err(RemoteError::NotFound)
            }
            Some(left) => {
                if left != u32::MAX {
                    entry.removal_in = Some(left - 1);
                }
                Ok(entry.job.clone())
            }
            None => Ok(entry.job.clone()),
        }
    }

    async fn update(&self, namespace: &str, name: &str, patch: &Job) -> Result<Job, RemoteError> {
        self.gate(FakeOp::Update).await?;
        let mut g = self.inner.lock().unwrap();
        let k = key(namespace, name);
        if g.bump_before_update && g.objects.contains_key(&k) {
            g.bump_before_update = false;
            let rv = g.bump();
            if let Some(e) = g.objects.get_mut(&k) {
                e.job.metadata.resource_version = Some(rv);
            }
        }
        let read_lag = g.read_lag;
        let rv = g.bump();
        let entry = g.objects.get_mut(&k).ok_or(RemoteError::NotFound)?;
        if let Some(want) = patch.metadata.resource_version.as_deref() {
            if entry.job.metadata.resource_version.as_deref() != Some(want) {
                return Err(RemoteError::Conflict(format!(
                    "Operation cannot be fulfilled on jobs.batch \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                    name
                )));
            }
        }
        let mut base = serde_json::to_value(&entry.job).map_err(|e| RemoteError::Invalid(e.to_string()))?;
        let mut p = serde_json::to_value(patch).map_err(|e| RemoteError::Invalid(e.to_string()))?;
        if let Some(meta) = p.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("resourceVersion");
        }
        merge(&mut base, &p);
        let mut next: Job = serde_json::from_value(base).map_err(|e| RemoteError::Invalid(e.to_string()))?;
        let spec_changed = next.spec != entry.job.spec;
        next.metadata.resource_version = Some(rv);
        if spec_changed {
            next.metadata.generation = Some(entry.job.metadata.generation.unwrap_or(1) + 1);
        }
        let previous = std::mem::replace(&mut entry.job, next.clone());
        entry.stale = if read_lag > 0 { Some((Some(previous), read_lag)) } else { None };
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RemoteError> {
        self.gate(FakeOp::Delete).await?;
        let mut g = self.inner.lock().unwrap();
        let k = key(namespace, name);
        let finalize = g.finalize.unwrap_or(Finalize::Immediate);
        let rv = g.bump();
        let entry = g.objects.get_mut(&k).ok_or(RemoteError::NotFound)?;
        if entry.removal_in.is_some() {
            return Ok(());
        }
        match finalize {
            Finalize::Immediate => {
                g.objects.remove(&k);
            }
            Finalize::AfterReads(n) => {
                entry.job.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
                entry.job.metadata.resource_version = Some(rv);
                entry.stale = None;
                entry.removal_in = Some(n);
            }
            Finalize::Never => {
                entry.job.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
                entry.job.metadata.resource_version = Some(rv);
                entry.stale = None;
                entry.removal_in = Some(u32::MAX);
            }
        }
        Ok(())
    }
}

pub fn random_name() -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    format!("tf-acc-test-{}", &s[..10])
}

/// The basic acceptance document: parallelism 2, one `hello` container.
pub fn hello_job(name: &str) -> JobDocument {
    JobDocument::builder(name)
        .parallelism(2)
        .template_label("job", "one")
        .container(ContainerDoc::new("hello", "alpine").command(["echo", "'hello'"]))
        .build()
}

/// Same record with only the command changed and parallelism left unspecified.
pub fn hello_job_modified(name: &str) -> JobDocument {
    JobDocument::builder(name)
        .container(ContainerDoc::new("hello", "alpine").command(["echo", "'world'"]))
        .build()
}

pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        retry: RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        },
        call_timeout: Duration::from_secs(2),
        delete_poll_interval: Duration::from_millis(100),
        delete_timeout: Duration::from_secs(5),
    }
}

/// Poll `check` with backoff until it yields `Some`, for reads that may lag writes.
pub async fn eventually<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let mut delay = Duration::from_millis(10);
    for _ in 0..20 {
        if let Some(v) = check().await {
            return Some(v);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(500));
    }
    None
}
