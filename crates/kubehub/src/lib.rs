//! Jobsync kubehub: the thin remote client facade the reconciler talks to,
//! and its implementation over `kube::Api<Job>`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    Client, Config,
};
use metrics::{counter, histogram};
use tracing::debug;

pub const DEFAULT_FIELD_MANAGER: &str = "jobsync";

/// Failure categories the reconciler needs to tell apart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("not found")]
    NotFound,
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transient: {0}")]
    Transient(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RemoteError::NotFound => "not_found",
            RemoteError::AlreadyExists(_) => "already_exists",
            RemoteError::Conflict(_) => "conflict",
            RemoteError::Invalid(_) => "invalid",
            RemoteError::Forbidden(_) => "forbidden",
            RemoteError::Transient(_) => "transient",
        }
    }
}

/// Classify an API status response.
pub fn classify(code: u16, reason: &str, message: String) -> RemoteError {
    match code {
        404 | 410 => RemoteError::NotFound,
        409 if reason == "AlreadyExists" => RemoteError::AlreadyExists(message),
        409 => RemoteError::Conflict(message),
        401 | 403 => RemoteError::Forbidden(message),
        408 | 429 | 500..=599 => RemoteError::Transient(message),
        _ => RemoteError::Invalid(message),
    }
}

impl From<kube::Error> for RemoteError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => classify(ae.code, &ae.reason, ae.message),
            // transport, TLS, timeouts: the request may never have reached the server
            other => RemoteError::Transient(other.to_string()),
        }
    }
}

/// Create/Get/Update/Delete against namespaced batch/v1 Jobs.
///
/// `update` receives a partial Job carrying only changed fields plus
/// `metadata.resourceVersion` as the concurrency precondition.
#[async_trait::async_trait]
pub trait JobApi: Send + Sync {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job, RemoteError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Job, RemoteError>;
    async fn update(&self, namespace: &str, name: &str, patch: &Job) -> Result<Job, RemoteError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RemoteError>;
}

#[async_trait::async_trait]
impl<T: JobApi + ?Sized> JobApi for Arc<T> {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job, RemoteError> {
        (**self).create(namespace, job).await
    }
    async fn get(&self, namespace: &str, name: &str) -> Result<Job, RemoteError> {
        (**self).get(namespace, name).await
    }
    async fn update(&self, namespace: &str, name: &str, patch: &Job) -> Result<Job, RemoteError> {
        (**self).update(namespace, name, patch).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RemoteError> {
        (**self).delete(namespace, name).await
    }
}

/// Build a client from the ambient kubeconfig, optionally pinning a context.
pub async fn get_kube_client(context: Option<&str>) -> Result<Client> {
    match context {
        None => Client::try_default().await.context("creating default kube client"),
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let config = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?;
            Client::try_from(config).context("creating kube client")
        }
    }
}

/// `JobApi` over a live cluster connection.
#[derive(Clone)]
pub struct KubeJobApi {
    client: Client,
    field_manager: String,
}

impl KubeJobApi {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: DEFAULT_FIELD_MANAGER.to_string() }
    }

    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    fn api(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn observe<T>(op: &'static str, t0: Instant, res: Result<T, kube::Error>) -> Result<T, RemoteError> {
    histogram!("remote_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Ok(v) => {
            counter!("remote_call_total", 1u64, "op" => op, "outcome" => "ok");
            Ok(v)
        }
        Err(e) => {
            let err = RemoteError::from(e);
            counter!("remote_call_total", 1u64, "op" => op, "outcome" => err.label());
            debug!(op, error = %err, "remote call failed");
            Err(err)
        }
    }
}

#[async_trait::async_trait]
impl JobApi for KubeJobApi {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job, RemoteError> {
        let t0 = Instant::now();
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        observe("create", t0, self.api(namespace).create(&pp, job).await)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Job, RemoteError> {
        let t0 = Instant::now();
        observe("get", t0, self.api(namespace).get(name).await)
    }

    async fn update(&self, namespace: &str, name: &str, patch: &Job) -> Result<Job, RemoteError> {
        let t0 = Instant::now();
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        // strategic merge keys containers by name; ones absent from the patch are kept
        observe("update", t0, self.api(namespace).patch(name, &pp, &Patch::Strategic(patch)).await)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RemoteError> {
        let t0 = Instant::now();
        // background propagation: the Job goes first, its pods are collected after
        let res = self.api(namespace).delete(name, &DeleteParams::background()).await;
        observe("delete", t0, res).map(|_| ())
    }
}
