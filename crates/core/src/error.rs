use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{JobSnapshot, ResourceId};

/// Caller-visible operation names, carried by every remote-facing error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Exists,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy of the synchronization engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{}malformed identifier {id:?}: {reason}", op_prefix(.op))]
    MalformedIdentifier { op: Option<Operation>, id: String, reason: String },

    /// Rejected locally, before any remote call.
    #[error("{}invalid spec for {target}: {reason}", op_prefix(.op))]
    InvalidSpec { op: Option<Operation>, target: String, reason: String },

    #[error("{op} {id}: rejected by remote: {message}")]
    RemoteRejected { op: Operation, id: ResourceId, message: String },

    #[error("{op} {id}: remote unavailable after {attempts} attempt(s): {message}")]
    RemoteUnavailable { op: Operation, id: ResourceId, attempts: u32, message: String },

    /// The object changed between read and write. Re-read and retry.
    #[error("{op} {id}: conflict on resourceVersion {expected_version}: {message}")]
    Conflict {
        op: Operation,
        id: ResourceId,
        expected_version: String,
        message: String,
        /// The snapshot the write was computed from.
        last_observed: Option<Box<JobSnapshot>>,
    },

    /// Delete was accepted but the object was still present at the deadline.
    #[error("delete {id}: still present after {waited:?}; re-check before assuming it is gone")]
    DeleteTimeout { id: ResourceId, waited: Duration, last_observed: Option<Box<JobSnapshot>> },

    #[error("{op} {id}: not found")]
    NotFound { op: Operation, id: ResourceId },
}

impl SyncError {
    pub fn invalid_spec(target: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidSpec { op: None, target: target.into(), reason: reason.into() }
    }

    /// Name the operation on a locally raised error, unless it already has one.
    pub fn during(mut self, operation: Operation) -> Self {
        if let SyncError::InvalidSpec { op, .. } | SyncError::MalformedIdentifier { op, .. } = &mut self {
            op.get_or_insert(operation);
        }
        self
    }

    /// Only transient remote failures are worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable { .. })
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            SyncError::RemoteRejected { op, .. }
            | SyncError::RemoteUnavailable { op, .. }
            | SyncError::Conflict { op, .. }
            | SyncError::NotFound { op, .. } => Some(*op),
            SyncError::DeleteTimeout { .. } => Some(Operation::Delete),
            SyncError::MalformedIdentifier { op, .. } | SyncError::InvalidSpec { op, .. } => *op,
        }
    }

    pub fn id(&self) -> Option<&ResourceId> {
        match self {
            SyncError::RemoteRejected { id, .. }
            | SyncError::RemoteUnavailable { id, .. }
            | SyncError::Conflict { id, .. }
            | SyncError::DeleteTimeout { id, .. }
            | SyncError::NotFound { id, .. } => Some(id),
            SyncError::MalformedIdentifier { .. } | SyncError::InvalidSpec { .. } => None,
        }
    }

    /// Stable short label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::MalformedIdentifier { .. } => "malformed_identifier",
            SyncError::InvalidSpec { .. } => "invalid_spec",
            SyncError::RemoteRejected { .. } => "remote_rejected",
            SyncError::RemoteUnavailable { .. } => "remote_unavailable",
            SyncError::Conflict { .. } => "conflict",
            SyncError::DeleteTimeout { .. } => "delete_timeout",
            SyncError::NotFound { .. } => "not_found",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

fn op_prefix(op: &Option<Operation>) -> String {
    op.map(|o| format!("{}: ", o)).unwrap_or_default()
}
