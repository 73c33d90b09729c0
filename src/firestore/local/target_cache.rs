use std::collections::BTreeMap;

use crate::firestore::core::{
    ListenSequenceNumber, Target, TargetId, TargetIdGenerator,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};
use crate::firestore::local::ReferenceSet;

/// Why a target is being listened to. Non-`Listen` purposes are sent to the
/// backend as a `goog-listen-tags` label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    ExistenceFilterMismatch,
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

impl TargetPurpose {
    pub fn listen_tag(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => {
                Some("existence-filter-mismatch-bloom")
            }
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// Cached state of one target: identity plus the resume bookkeeping needed
/// to restart the listen after a reconnect.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot at which the view had no limbo documents; results
    /// from the remote keys are only trusted up to this version.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Result count of the last snapshot, sent on resume so the backend can
    /// answer with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume point. Clears the expected count since it described the
    /// previous token.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

/// Targets known to the client and the document keys the backend said
/// match each of them.
#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: BTreeMap<String, TargetData>,
    references: ReferenceSet,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_id_generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            references: ReferenceSet::new(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
            target_id_generator: TargetIdGenerator::for_target_cache(0),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_target_id(&mut self) -> TargetId {
        self.highest_target_id = self.target_id_generator.next();
        self.highest_target_id
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_targets_metadata(
        &mut self,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        self.highest_sequence_number = self.highest_sequence_number.max(highest_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::for_target_cache(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets
            .insert(target_data.target.canonical_id(), target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.add_target_data(target_data);
    }

    /// Removes the target and every key reference it held.
    pub fn remove_target_data(&mut self, target_data: &TargetData) {
        self.targets.remove(&target_data.target.canonical_id());
        self.references
            .remove_references_for_id(target_data.target_id);
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.targets.get(&target.canonical_id())
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets
            .values()
            .find(|data| data.target_id == target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    /// Drops inactive targets with a sequence number at or below
    /// `upper_bound`. Returns each removed target with the keys it matched.
    pub fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &dyn Fn(TargetId) -> bool,
    ) -> Vec<(TargetData, DocumentKeySet)> {
        let doomed: Vec<String> = self
            .targets
            .iter()
            .filter(|(_, data)| {
                data.sequence_number <= upper_bound && !active_target_ids(data.target_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for canonical_id in doomed {
            if let Some(data) = self.targets.remove(&canonical_id) {
                let keys = self.references.remove_references_for_id(data.target_id);
                removed.push((data, keys));
            }
        }
        removed
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.references.remove_references(keys, target_id);
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}
