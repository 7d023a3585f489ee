//! Jobsync reconciler: drives one managed batch Job through
//! create/read/update/delete against a [`JobApi`] facade.
//!
//! The reconciler owns its facade and holds no per-record state, so one
//! instance can serve distinct records from many tasks at once. Every read
//! goes to the API server; nothing is cached between calls.

#![forbid(unsafe_code)]

pub mod config;
pub mod lifecycle;
mod retry;

use std::time::Instant;

use jobsync_core::{drift, FieldChange, JobDocument, JobSnapshot, Operation, ResourceId, SyncError, SyncResult};
use jobsync_kubehub::{JobApi, RemoteError};
use jobsync_mapper::{snapshot_from_remote, to_remote_shape, update_patch};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use config::{ReconcilerConfig, RetryPolicy, MAX_DELETE_TIMEOUT};
pub use lifecycle::{ManagedRecord, RecordState};

use retry::{bounded, with_retry, Exhausted};

/// What `apply` did to bring a record in line with its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created(JobSnapshot),
    Updated { snapshot: JobSnapshot, changes: Vec<FieldChange> },
    Unchanged(JobSnapshot),
}

impl ApplyOutcome {
    pub fn snapshot(&self) -> &JobSnapshot {
        match self {
            ApplyOutcome::Created(s) | ApplyOutcome::Unchanged(s) => s,
            ApplyOutcome::Updated { snapshot, .. } => snapshot,
        }
    }
}

pub struct Reconciler<C> {
    client: C,
    config: ReconcilerConfig,
}

impl<C: JobApi> Reconciler<C> {
    pub fn new(client: C, config: ReconcilerConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C { &self.client }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    /// Create the Job described by `doc` and return its durable identifier.
    pub async fn create(&self, doc: &JobDocument) -> SyncResult<(ResourceId, JobSnapshot)> {
        let t0 = Instant::now();
        let res = self.create_inner(doc).await.map_err(|e| e.during(Operation::Create));
        observe(Operation::Create, t0, &res);
        res
    }

    /// Current snapshot, or `None` when the object no longer exists.
    pub async fn read(&self, id: &ResourceId) -> SyncResult<Option<JobSnapshot>> {
        let t0 = Instant::now();
        let res = self.fetch(Operation::Read, id).await;
        observe(Operation::Read, t0, &res);
        res
    }

    /// Apply `new_doc` as a partial update: fields it leaves unset keep their
    /// live value. Fails with `Conflict` if the object moved since it was read.
    pub async fn update(&self, id: &ResourceId, new_doc: &JobDocument) -> SyncResult<JobSnapshot> {
        let t0 = Instant::now();
        let res = self.update_inner(id, new_doc).await.map_err(|e| e.during(Operation::Update));
        observe(Operation::Update, t0, &res);
        res
    }

    /// Delete and wait until a read confirms the object is gone.
    pub async fn delete(&self, id: &ResourceId) -> SyncResult<()> {
        let t0 = Instant::now();
        let res = self.delete_inner(id, None).await;
        observe(Operation::Delete, t0, &res);
        res
    }

    /// Whether `id` still names the object the caller manages. A same-named
    /// object with a different uid does not count.
    pub async fn exists(&self, id: &ResourceId, expected_uid: Option<&str>) -> SyncResult<bool> {
        let t0 = Instant::now();
        let res = self.fetch(Operation::Exists, id).await.map(|found| match found {
            None => false,
            Some(snap) => {
                let same = snap.is_same_object(id.name(), expected_uid);
                if !same {
                    info!(id = %id, expected_uid = ?expected_uid, found_uid = ?snap.uid, "name is held by a different object");
                }
                same
            }
        });
        observe(Operation::Exists, t0, &res);
        res
    }

    /// Drive `record` to `desired`: create when absent (or removed out of
    /// band), update when drifted, otherwise leave it alone.
    pub async fn apply(&self, record: &mut ManagedRecord, desired: &JobDocument) -> SyncResult<ApplyOutcome> {
        if let Some(id) = record.id.clone() {
            match self.fetch(Operation::Read, &id).await? {
                Some(live) if live.is_same_object(id.name(), record.uid.as_deref()) && !live.deleting => {
                    let changes = drift(desired, &live.document);
                    if changes.is_empty() {
                        debug!(id = %id, "up to date");
                        record.settle(live.clone());
                        return Ok(ApplyOutcome::Unchanged(live));
                    }
                    record.enter(RecordState::Updating);
                    return match self.update(&id, desired).await {
                        Ok(snapshot) => {
                            record.settle(snapshot.clone());
                            Ok(ApplyOutcome::Updated { snapshot, changes })
                        }
                        Err(e) => {
                            record.enter(if is_unrecoverable(&e) { RecordState::Failed } else { RecordState::Present });
                            Err(e)
                        }
                    };
                }
                found => {
                    warn!(id = %id, found_uid = ?found.as_ref().and_then(|s| s.uid.clone()), "managed job gone or replaced out of band; recreating");
                    record.clear();
                }
            }
        }
        record.enter(RecordState::Creating);
        match self.create(desired).await {
            Ok((_, snapshot)) => {
                record.settle(snapshot.clone());
                Ok(ApplyOutcome::Created(snapshot))
            }
            Err(e) => {
                record.enter(if is_unrecoverable(&e) { RecordState::Failed } else { RecordState::Absent });
                Err(e)
            }
        }
    }

    /// Delete the record's object. Only the object the record knows (by uid)
    /// is deleted; a stranger reusing the name is left alone.
    pub async fn destroy(&self, record: &mut ManagedRecord) -> SyncResult<()> {
        let Some(id) = record.id.clone() else {
            return Ok(());
        };
        record.enter(RecordState::Deleting);
        let t0 = Instant::now();
        let res = self.delete_inner(&id, record.uid.as_deref()).await;
        observe(Operation::Delete, t0, &res);
        match res {
            Ok(()) => {
                record.clear();
                Ok(())
            }
            // still Deleting: the outcome is unknown until re-checked
            Err(e @ SyncError::DeleteTimeout { .. }) => Err(e),
            Err(e) => {
                record.enter(if is_unrecoverable(&e) { RecordState::Failed } else { RecordState::Present });
                Err(e)
            }
        }
    }

    async fn create_inner(&self, doc: &JobDocument) -> SyncResult<(ResourceId, JobSnapshot)> {
        let job = to_remote_shape(doc)?;
        let requested = doc.resource_id()?;
        info!(id = %requested, "creating job");
        let (created, attempts) = with_retry(&self.config.retry, self.config.call_timeout, Operation::Create, &requested, || {
            self.client.create(requested.namespace(), &job)
        })
        .await
        .map_err(|ex| match ex {
            // an earlier attempt may have landed before its response was lost
            Exhausted { error: RemoteError::AlreadyExists(msg), attempts } if attempts > 1 => SyncError::RemoteRejected {
                op: Operation::Create,
                id: requested.clone(),
                message: format!("already exists after {} attempts; an earlier attempt may have succeeded: {}", attempts, msg),
            },
            other => remote_failure(Operation::Create, &requested, other),
        })?;
        let snapshot = snapshot_from_remote(&requested, &created);
        info!(id = %snapshot.id, uid = ?snapshot.uid, rv = ?snapshot.resource_version, attempts, "job created");
        Ok((snapshot.id.clone(), snapshot))
    }

    async fn fetch(&self, op: Operation, id: &ResourceId) -> SyncResult<Option<JobSnapshot>> {
        let res = with_retry(&self.config.retry, self.config.call_timeout, op, id, || {
            self.client.get(id.namespace(), id.name())
        })
        .await;
        match res {
            Ok((job, _)) => Ok(Some(snapshot_from_remote(id, &job))),
            Err(Exhausted { error: RemoteError::NotFound, .. }) => {
                debug!(op = %op, id = %id, "not found");
                Ok(None)
            }
            Err(Exhausted { error, attempts }) => Err(SyncError::RemoteUnavailable {
                op,
                id: id.clone(),
                attempts,
                message: error.to_string(),
            }),
        }
    }

    async fn update_inner(&self, id: &ResourceId, new_doc: &JobDocument) -> SyncResult<JobSnapshot> {
        new_doc.validate_for_update()?;
        if new_doc.name() != id.name() || new_doc.metadata.namespace.as_deref().is_some_and(|ns| ns != id.namespace()) {
            return Err(SyncError::invalid_spec(
                id.to_string(),
                format!("document targets {}/{}; namespace and name cannot change in place", new_doc.namespace(), new_doc.name()),
            ));
        }
        let current = self
            .fetch(Operation::Update, id)
            .await?
            .ok_or_else(|| SyncError::NotFound { op: Operation::Update, id: id.clone() })?;
        if current.deleting {
            return Err(SyncError::RemoteRejected {
                op: Operation::Update,
                id: id.clone(),
                message: "object is being deleted".into(),
            });
        }

        let desired = current.document.overlay(new_doc);
        let changes = drift(&desired, &current.document);
        let rv = current.resource_version.clone().unwrap_or_default();
        let patch = match update_patch(&current.document, &desired, &rv) {
            Some(p) if !changes.is_empty() => p,
            _ => {
                debug!(id = %id, "no changes to apply");
                return Ok(current);
            }
        };
        for c in &changes {
            debug!(id = %id, path = %c.path, desired = %c.desired, live = %c.live, "field change");
        }
        info!(id = %id, rv = %rv, changes = changes.len(), "updating job");

        let res = with_retry(&self.config.retry, self.config.call_timeout, Operation::Update, id, || {
            self.client.update(id.namespace(), id.name(), &patch)
        })
        .await;
        match res {
            Ok((job, _)) => {
                let snapshot = snapshot_from_remote(id, &job);
                info!(id = %id, rv = ?snapshot.resource_version, "job updated");
                Ok(snapshot)
            }
            Err(Exhausted { error: RemoteError::Conflict(message), .. }) => {
                counter!("reconcile_conflict_total", 1u64);
                warn!(id = %id, rv = %rv, "object changed since it was read");
                Err(SyncError::Conflict {
                    op: Operation::Update,
                    id: id.clone(),
                    expected_version: rv,
                    message,
                    last_observed: Some(Box::new(current)),
                })
            }
            Err(ex) => Err(remote_failure(Operation::Update, id, ex)),
        }
    }

    async fn delete_inner(&self, id: &ResourceId, expected_uid: Option<&str>) -> SyncResult<()> {
        let before = match self.fetch(Operation::Delete, id).await? {
            Some(s) if s.is_same_object(id.name(), expected_uid) => Some(s),
            Some(s) => {
                info!(id = %id, found_uid = ?s.uid, "name now held by a different object; nothing to delete");
                return Ok(());
            }
            // a fresh create may not be visible to reads yet
            None => None,
        };
        let uid = before.as_ref().and_then(|s| s.uid.clone()).or_else(|| expected_uid.map(str::to_string));
        info!(id = %id, uid = ?uid, "deleting job");
        match with_retry(&self.config.retry, self.config.call_timeout, Operation::Delete, id, || {
            self.client.delete(id.namespace(), id.name())
        })
        .await
        {
            Ok(_) => {}
            Err(Exhausted { error: RemoteError::NotFound, .. }) => {
                info!(id = %id, "already absent");
                return Ok(());
            }
            Err(ex) => return Err(remote_failure(Operation::Delete, id, ex)),
        }
        self.wait_for_absence(id, uid.as_deref(), before).await
    }

    /// Poll at a fixed interval until not-found (or the name is taken by a new
    /// uid), bounded by the overall delete deadline.
    async fn wait_for_absence(&self, id: &ResourceId, uid: Option<&str>, initial: Option<JobSnapshot>) -> SyncResult<()> {
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(self.config.delete_timeout).unwrap_or_else(|| started + MAX_DELETE_TIMEOUT);
        let mut last = initial;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let per_call = self.config.call_timeout.min(remaining).max(std::time::Duration::from_millis(1));
            match bounded(per_call, self.client.get(id.namespace(), id.name())).await {
                Err(RemoteError::NotFound) => {
                    info!(id = %id, waited_ms = started.elapsed().as_millis() as u64, "delete confirmed");
                    return Ok(());
                }
                Ok(job) => {
                    let snap = snapshot_from_remote(id, &job);
                    if !snap.is_same_object(id.name(), uid) {
                        info!(id = %id, new_uid = ?snap.uid, "original object gone; name reused");
                        return Ok(());
                    }
                    debug!(id = %id, deleting = snap.deleting, "still present");
                    last = Some(snap);
                }
                Err(e) => warn!(id = %id, error = %e, "delete poll failed; polling again"),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                counter!("reconcile_delete_timeout_total", 1u64);
                return Err(SyncError::DeleteTimeout {
                    id: id.clone(),
                    waited: now - started,
                    last_observed: last.map(Box::new),
                });
            }
            tokio::time::sleep(self.config.delete_poll_interval.min(deadline - now)).await;
        }
    }
}

fn is_unrecoverable(e: &SyncError) -> bool {
    matches!(e, SyncError::InvalidSpec { .. } | SyncError::RemoteRejected { .. } | SyncError::MalformedIdentifier { .. })
}

fn remote_failure(op: Operation, id: &ResourceId, ex: Exhausted) -> SyncError {
    let Exhausted { error, attempts } = ex;
    match error {
        RemoteError::NotFound => SyncError::NotFound { op, id: id.clone() },
        RemoteError::Conflict(message) => {
            SyncError::Conflict { op, id: id.clone(), expected_version: String::new(), message, last_observed: None }
        }
        RemoteError::Transient(message) => SyncError::RemoteUnavailable { op, id: id.clone(), attempts, message },
        rejected @ (RemoteError::AlreadyExists(_) | RemoteError::Invalid(_) | RemoteError::Forbidden(_)) => {
            SyncError::RemoteRejected { op, id: id.clone(), message: rejected.to_string() }
        }
    }
}

fn observe<T>(op: Operation, t0: Instant, res: &SyncResult<T>) {
    histogram!("reconcile_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.as_str());
    let outcome = match res {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    counter!("reconcile_total", 1u64, "op" => op.as_str(), "outcome" => outcome);
}
