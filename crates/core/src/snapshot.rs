use serde::{Deserialize, Serialize};

use crate::document::JobDocument;
use crate::id::ResourceId;

/// Point-in-time view of a live Job, free of API wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: ResourceId,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub self_link: Option<String>,
    pub creation_timestamp: Option<String>,
    /// `metadata.deletionTimestamp` is set: finalizers are still running.
    pub deleting: bool,
    pub status: JobStatusSummary,
    /// Caller-authorable fields only.
    pub document: JobDocument,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusSummary {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

impl JobSnapshot {
    /// Same logical object: name matches and, when both sides know it, the uid too.
    pub fn is_same_object(&self, name: &str, uid: Option<&str>) -> bool {
        if self.id.name() != name {
            return false;
        }
        match (uid, self.uid.as_deref()) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}
