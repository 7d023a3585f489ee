//! Jobsync core types: identifiers, desired-state documents, snapshots, drift and errors.

#![forbid(unsafe_code)]

pub mod document;
pub mod drift;
pub mod error;
pub mod id;
pub mod snapshot;

pub use document::{ContainerDoc, EnvVarDoc, JobDocument, JobDocumentBuilder, DEFAULT_NAMESPACE};
pub use drift::{drift, DiffSummary, FieldChange};
pub use error::{Operation, SyncError, SyncResult};
pub use id::ResourceId;
pub use snapshot::{JobSnapshot, JobStatusSummary};

pub mod prelude {
    pub use super::{ContainerDoc, JobDocument, JobSnapshot, Operation, ResourceId, SyncError, SyncResult};
}
