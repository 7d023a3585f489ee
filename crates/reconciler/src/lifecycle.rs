//! Lifecycle of one managed record.
//!
//! ```text
//! Absent -> Creating -> Present -> Updating -> Present -> Deleting -> Absent
//! Creating | Updating | Deleting -> Failed
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use jobsync_core::{JobSnapshot, ResourceId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordState {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
    Failed,
}

impl RecordState {
    pub fn can_transition(self, to: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, to),
            (Absent, Creating)
                | (Creating, Present)
                | (Creating, Failed)
                | (Creating, Absent)
                | (Present, Present)
                | (Present, Updating)
                | (Present, Deleting)
                // remote object vanished out of band
                | (Present, Absent)
                | (Updating, Present)
                | (Updating, Failed)
                | (Deleting, Absent)
                | (Deleting, Deleting)
                | (Deleting, Failed)
                | (Deleting, Present)
                | (Failed, Creating)
                | (Failed, Updating)
                | (Failed, Deleting)
                | (Failed, Absent)
                | (Failed, Present)
        )
    }

    /// An operation is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, RecordState::Creating | RecordState::Updating | RecordState::Deleting)
    }
}

/// Caller-owned handle on one remote Job. The reconciler reads and advances
/// it but keeps no copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedRecord {
    pub id: Option<ResourceId>,
    pub uid: Option<String>,
    pub state: RecordState,
    pub last: Option<JobSnapshot>,
}

impl Default for ManagedRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedRecord {
    pub fn new() -> Self {
        Self { id: None, uid: None, state: RecordState::Absent, last: None }
    }

    /// Resume a record from persisted state.
    pub fn existing(id: ResourceId, uid: Option<String>) -> Self {
        Self { id: Some(id), uid, state: RecordState::Present, last: None }
    }

    pub(crate) fn enter(&mut self, next: RecordState) {
        if !self.state.can_transition(next) {
            warn!(from = ?self.state, to = ?next, id = ?self.id, "unexpected record transition");
        }
        self.state = next;
    }

    pub(crate) fn settle(&mut self, snapshot: JobSnapshot) {
        self.id = Some(snapshot.id.clone());
        self.uid = snapshot.uid.clone();
        self.last = Some(snapshot);
        self.enter(RecordState::Present);
    }

    pub(crate) fn clear(&mut self) {
        self.id = None;
        self.uid = None;
        self.last = None;
        self.enter(RecordState::Absent);
    }
}
