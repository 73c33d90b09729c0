use std::collections::BTreeMap;

use crate::firestore::core::TargetId;
use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKeySet, MutableDocumentMap, SnapshotVersion};

/// Aggregated result of the watch changes received up to one consistent
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results must be discarded, with the reason.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Documents that now only belong to limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event used to tear down a limbo resolution that the backend
    /// rejected: it carries a deleted document at the minimum version.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
