use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, SnapshotVersion};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the backend has confirmed for `target_id` in earlier remote
    /// events.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// `None` once the target is no longer listened to.
    fn target_data_for_id(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// Outcome of checking an existence filter's bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding watch/unwatch requests. Changes for a target are ignored
    /// until every request has been acknowledged.
    pending_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Vec::new(),
            // A fresh target always raises its first (possibly empty) change.
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: Vec<u8>) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token;
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::synthesized_for_current_change(
            self.current,
            self.resume_token.clone(),
        );
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        self.has_pending_changes = true;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }
}

/// Folds watch changes into per-target state until the stream reaches a
/// consistent point, then emits them as one [`RemoteEvent`].
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Every target each pending document was seen for.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    /// Called for every watch or unwatch request sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    /// Drops all state for a target the remote store stopped listening to.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(change.resume_token.clone());
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // Changes collected before the re-add are stale.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(change.resume_token.clone());
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(change.resume_token.clone());
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        // Start from scratch: every key the target had is
                        // removed until the backend sends it again.
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(change.resume_token.clone());
                    }
                }
            }
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: &DocumentWatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata)
                }
                other => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    other.clone(),
                    metadata,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &change.key,
                change.new_document.clone(),
                metadata,
            );
        }
    }

    /// Compares the backend's count with what the client tracks and resets
    /// the target when they disagree.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document is gone. Synthesize a delete so the cache
                // forgets it.
                if let Ok(key) = document_key_for_target(&target_data) {
                    self.remove_document_from_target(
                        target_id,
                        &key,
                        Some(MutableDocument::new_no_document(
                            key.clone(),
                            SnapshotVersion::min(),
                        )),
                        metadata,
                    );
                }
            } else if expected_count != 1 {
                log::error!(
                    "WatchChangeAggregator: single document existence filter with count {expected_count}"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == expected_count as usize {
            return;
        }

        let application = self.apply_bloom_filter(change, current_count, metadata);
        let purpose = if application == BloomFilterApplication::Success {
            TargetPurpose::ExistenceFilterMismatchBloom
        } else {
            TargetPurpose::ExistenceFilterMismatch
        };
        log::debug!(
            "WatchChangeAggregator: existence filter mismatch for target {target_id} (expected {expected_count}, have {current_count}, bloom {application:?})"
        );
        self.reset_target(target_id, metadata);
        self.pending_target_resets.insert(target_id, purpose);
    }

    /// Removes keys the bloom filter proves absent and reports whether the
    /// resulting count matches the backend's.
    fn apply_bloom_filter(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: usize,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let Some(payload) = &change.existence_filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let filter = match payload.to_filter() {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("WatchChangeAggregator: applying bloom filter failed: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let target_id = change.target_id;
        let existing_keys = metadata.remote_keys_for_target(target_id);
        let mut removed = 0usize;
        for key in &existing_keys {
            let name = self.serializer.document_name(key);
            if !filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None, metadata);
                removed += 1;
            }
        }

        if current_count.saturating_sub(removed) == change.existence_filter.count as usize {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Builds the remote event for everything aggregated so far and resets
    /// the pending state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in &target_ids {
            let Some(target_data) = self.target_data_for_active_target(*target_id, metadata) else {
                continue;
            };
            let is_current = self
                .target_states
                .get(target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if !is_current || !target_data.target.is_document_target() {
                continue;
            }
            // A current document target whose document never arrived means
            // the document does not exist.
            let Ok(key) = document_key_for_target(&target_data) else {
                continue;
            };
            if !self.pending_document_updates.contains_key(&key)
                && !self.target_contains_document(*target_id, &key, metadata)
            {
                self.remove_document_from_target(
                    *target_id,
                    &key,
                    Some(MutableDocument::new_no_document(key.clone(), snapshot_version)),
                    metadata,
                );
            }
        }

        let mut target_changes = BTreeMap::new();
        for (target_id, state) in self.target_states.iter_mut() {
            if state.has_pending_changes {
                target_changes.insert(*target_id, state.to_target_change());
                state.clear_pending_changes();
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id, metadata) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, metadata) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated_document` is the new state of the document, if known. It is
    /// `None` when the document merely stopped matching the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // Never synced to the client, so just forget the pending add.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Marks every key the target currently has as removed and restarts its
    /// state. Pending watch requests survive the reset.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        let pending_responses = self
            .target_states
            .get(&target_id)
            .map(|state| state.pending_responses)
            .unwrap_or(0);
        let mut fresh = TargetState::new();
        fresh.pending_responses = pending_responses;
        self.target_states.insert(target_id, fresh);

        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let existing = metadata.remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return existing;
        };
        let added = state
            .document_changes
            .values()
            .filter(|kind| **kind == DocumentChangeKind::Added)
            .count();
        let removed = state
            .document_changes
            .values()
            .filter(|kind| **kind == DocumentChangeKind::Removed)
            .count();
        (existing + added).saturating_sub(removed)
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    /// Target data if the target is listened to and has no outstanding
    /// requests.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        let pending = self
            .target_states
            .get(&target_id)
            .map(TargetState::is_pending)
            .unwrap_or(false);
        if pending {
            None
        } else {
            metadata.target_data_for_id(target_id)
        }
    }
}

fn document_key_for_target(target_data: &TargetData) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_path(target_data.target.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::remote::bloom_filter::BloomFilter;
    use crate::firestore::remote::watch_change::{BloomFilterPayload, ExistenceFilter};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct Metadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, DocumentKeySet>,
    }

    impl Metadata {
        fn with_query_target(mut self, target_id: TargetId) -> Self {
            let target = Query::collection("beverages").unwrap().to_target();
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::Listen, 1),
            );
            self
        }

        fn with_target(mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self
        }

        fn with_keys(mut self, target_id: TargetId, keys: &[&DocumentKey]) -> Self {
            self.remote_keys
                .insert(target_id, keys.iter().map(|key| (*key).clone()).collect());
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_id(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            key(path),
            SnapshotVersion::new(Timestamp::new(version, 0)),
            MapValue::default(),
        )
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn added(target_ids: Vec<TargetId>) -> WatchTargetChange {
        WatchTargetChange::new(WatchTargetChangeState::Added, target_ids)
    }

    fn document_change(updated: Vec<TargetId>, removed: Vec<TargetId>, document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    #[test]
    fn added_documents_are_reported_after_the_target_is_acknowledged() {
        let metadata = Metadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(2);

        // Ignored while the ADD is outstanding.
        aggregator.handle_document_change(&document_change(vec![2], vec![], doc("beverages/a", 1)), &metadata);
        aggregator.handle_target_change(&added(vec![2]), &metadata);
        aggregator.handle_document_change(&document_change(vec![2], vec![], doc("beverages/b", 1)), &metadata);
        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                .with_resume_token(b"t1".to_vec()),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(2), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1".to_vec());
        assert_eq!(change.added_documents, [key("beverages/b")].into_iter().collect());
        assert_eq!(event.document_updates.len(), 1);
        assert_eq!(event.document_updates[&key("beverages/b")].read_time(), version(2));
    }

    #[test]
    fn known_documents_are_modified_or_removed() {
        let a = key("beverages/a");
        let b = key("beverages/b");
        let metadata = Metadata::default().with_query_target(2).with_keys(2, &[&a, &b]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_document_change(&document_change(vec![2], vec![], doc("beverages/a", 3)), &metadata);
        aggregator.handle_document_change(
            &DocumentWatchChange {
                updated_target_ids: vec![],
                removed_target_ids: vec![2],
                key: b.clone(),
                new_document: None,
            },
            &metadata,
        );

        let event = aggregator.create_remote_event(version(3), &metadata);
        let change = &event.target_changes[&2];
        assert_eq!(change.modified_documents, [a].into_iter().collect());
        assert_eq!(change.removed_documents, [b.clone()].into_iter().collect());
        assert!(!event.document_updates.contains_key(&b));
    }

    #[test]
    fn reset_removes_every_known_key() {
        let a = key("beverages/a");
        let metadata = Metadata::default().with_query_target(2).with_keys(2, &[&a]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::Reset, vec![2]),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(4), &metadata);
        assert_eq!(event.target_changes[&2].removed_documents, [a].into_iter().collect());
        assert!(!event.target_changes[&2].current);
    }

    #[test]
    fn current_flag_follows_the_last_reset() {
        let metadata = Metadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        let current = WatchTargetChange::new(WatchTargetChangeState::Current, vec![2]);
        let reset = WatchTargetChange::new(WatchTargetChangeState::Reset, vec![2]);

        aggregator.handle_target_change(&current, &metadata);
        aggregator.handle_target_change(&reset, &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(!event.target_changes[&2].current);

        aggregator.handle_document_change(&document_change(vec![2], vec![], doc("beverages/a", 3)), &metadata);
        aggregator.handle_target_change(&current, &metadata);
        let event = aggregator.create_remote_event(version(3), &metadata);
        assert!(event.target_changes[&2].current);
    }

    #[test]
    fn count_mismatch_without_bloom_filter_resets_the_target() {
        let a = key("beverages/a");
        let b = key("beverages/b");
        let metadata = Metadata::default().with_query_target(2).with_keys(2, &[&a, &b]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                existence_filter: ExistenceFilter { count: 1, unchanged_names: None },
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_that_reconciles_the_count_is_reported() {
        let a = key("beverages/a");
        let b = key("beverages/b");
        let metadata = Metadata::default().with_query_target(2).with_keys(2, &[&a, &b]);
        let serializer = serializer();
        let mut bloom = BloomFilter::with_false_positive_rate(100, 0.0001).unwrap();
        bloom.insert(&serializer.document_name(&a));
        let mut aggregator = WatchChangeAggregator::new(serializer);

        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                existence_filter: ExistenceFilter {
                    count: 1,
                    unchanged_names: Some(BloomFilterPayload::from_filter(&bloom)),
                },
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn matching_count_leaves_the_target_alone() {
        let a = key("beverages/a");
        let metadata = Metadata::default().with_query_target(2).with_keys(2, &[&a]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                existence_filter: ExistenceFilter { count: 1, unchanged_names: None },
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(5), &metadata);
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn current_document_target_without_document_synthesizes_a_delete() {
        let a = key("beverages/a");
        let metadata = Metadata::default().with_target(4, Target::for_document(&a), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![4]),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(6), &metadata);
        let document = &event.document_updates[&a];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(6));
    }

    #[test]
    fn documents_seen_only_by_limbo_targets_are_resolved() {
        let a = key("beverages/a");
        let metadata = Metadata::default()
            .with_target(1, Target::for_document(&a), TargetPurpose::LimboResolution)
            .with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_document_change(&document_change(vec![1], vec![], doc("beverages/a", 1)), &metadata);
        aggregator.handle_document_change(&document_change(vec![2], vec![], doc("beverages/b", 1)), &metadata);
        let event = aggregator.create_remote_event(version(7), &metadata);
        assert_eq!(event.resolved_limbo_documents, [a].into_iter().collect());
    }
}
