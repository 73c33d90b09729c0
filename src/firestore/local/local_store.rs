use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::credentials::User;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::query_engine::{IndexAutoCreationSettings, QueryEngine};
use crate::firestore::local::{
    BundleMetadata, FieldIndex, IndexSegment, MemoryPersistence, NamedQuery, PersistenceState,
    PersistenceTransaction, TargetData, TargetPurpose, TransactionMode,
};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, MutableDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};

/// Resume tokens are persisted at least this often, in microseconds of
/// snapshot time, even when nothing else about the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Keys a view started or stopped showing, reported back so the local
/// store can pin them against garbage collection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Local half of the client: owns persistence and exposes the
/// transactional operations the sync engine performs on the cache.
pub struct LocalStore {
    persistence: MemoryPersistence,
    current_user: User,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_target: HashMap<String, TargetId>,
}

impl LocalStore {
    pub fn new(user: User, index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self {
            persistence: MemoryPersistence::new(),
            current_user: user,
            query_engine: QueryEngine::new(index_auto_creation),
            target_data_by_target: BTreeMap::new(),
            target_id_by_target: HashMap::new(),
        }
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn persistence(&self) -> &MemoryPersistence {
        &self.persistence
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query_engine
    }

    pub fn shutdown(&mut self) {
        self.persistence.shutdown();
    }

    /// Switches the active mutation queue to `user`'s and returns the
    /// documents whose local view may have changed.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_user = std::mem::replace(&mut self.current_user, user.clone());
        self.persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |state, _| {
                let old_batches: Vec<MutationBatch> = state
                    .user_components(&old_user)
                    .mutation_queue
                    .all_mutation_batches()
                    .to_vec();
                let new_batches: Vec<MutationBatch> = state
                    .user_components(&user)
                    .mutation_queue
                    .all_mutation_batches()
                    .to_vec();

                let changed_keys: DocumentKeySet = old_batches
                    .iter()
                    .chain(&new_batches)
                    .flat_map(MutationBatch::keys)
                    .collect();
                let affected_documents = state
                    .local_documents_view(&user)
                    .get_documents(changed_keys.iter());

                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids: old_batches.iter().map(MutationBatch::batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(MutationBatch::batch_id).collect(),
                })
            })
    }

    /// Queues `mutations` as one batch and returns the resulting local view
    /// of every touched document.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let user = self.current_user.clone();
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |state, _| {
                let remote_documents = state.remote_documents.get_entries(keys.iter());
                let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();

                let mut overlayed = state
                    .local_documents_view(&user)
                    .get_overlayed_documents(remote_documents);

                // Transforms that depend on the current value are pinned to
                // the value the user saw when writing.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        overlayed
                            .get(mutation.key())
                            .and_then(|entry| mutation.extract_base_value(&entry.document))
                    })
                    .collect();

                let components = state.user_components(&user);
                let batch = components.mutation_queue.add_mutation_batch(
                    local_write_time,
                    base_mutations,
                    mutations,
                )?;
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                components.overlays.save_overlays(batch.batch_id(), overlays);
                for key in &keys {
                    state
                        .index_manager
                        .add_to_collection_parent_index(&key.collection_path());
                }

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id(),
                    changes: overlayed
                        .into_iter()
                        .map(|(key, entry)| (key, entry.document))
                        .collect(),
                })
            })
    }

    /// Applies an acknowledged batch to the remote documents and drops it
    /// from the queue. `result.batch` must be the oldest pending batch.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let user = self.current_user.clone();
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWrite, |state, txn| {
                let batch = &result.batch;
                for key in batch.keys() {
                    let mut document = state.remote_documents.get_entry(&key);
                    let ack_version = result
                        .doc_versions
                        .get(&key)
                        .copied()
                        .ok_or_else(|| internal_error("doc_versions should be set for every key"))?;
                    if document.version() < ack_version {
                        batch.apply_to_remote_document(&mut document, result)?;
                        if document.is_valid_document() {
                            document.set_read_time(result.commit_version);
                            state.index_manager.update_index_entries([&document]);
                            state.remote_documents.add_entry(document);
                        }
                    }
                }

                let components = state.user_components(&user);
                components.mutation_queue.remove_mutation_batch(batch)?;
                components
                    .mutation_queue
                    .set_last_stream_token(result.stream_token.clone());

                let keys = batch.keys();
                finish_batch_removal(state, &user, txn, batch.batch_id(), &keys);

                let keys_with_transform_results: DocumentKeySet = batch
                    .mutations()
                    .iter()
                    .zip(&result.mutation_results)
                    .filter(|(_, mutation_result)| !mutation_result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key().clone())
                    .collect();
                let mut view = state.local_documents_view(&user);
                view.recalculate_and_save_overlays_for_document_keys(keys_with_transform_results.iter());
                Ok(view.get_documents(keys.iter()))
            })
    }

    /// Drops a batch the backend refused and returns the documents it
    /// touched, now without its effects.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let user = self.current_user.clone();
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWrite, |state, txn| {
                let components = state.user_components(&user);
                let batch = components
                    .mutation_queue
                    .lookup_mutation_batch(batch_id)
                    .cloned()
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                components.mutation_queue.remove_mutation_batch(&batch)?;

                let keys = batch.keys();
                finish_batch_removal(state, &user, txn, batch_id, &keys);

                let mut view = state.local_documents_view(&user);
                view.recalculate_and_save_overlays_for_document_keys(keys.iter());
                Ok(view.get_documents(keys.iter()))
            })
    }

    pub fn highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<BatchId> {
        let user = self.current_user.clone();
        self.persistence.run_transaction(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |state, _| Ok(state.user_components(&user).mutation_queue.highest_unacknowledged_batch_id()),
        )
    }

    /// First pending batch with an id greater than `after_batch_id`.
    pub fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let user = self.current_user.clone();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |state, _| {
                Ok(state
                    .user_components(&user)
                    .mutation_queue
                    .next_mutation_batch_after(after)
                    .cloned())
            })
    }

    pub fn last_stream_token(&mut self) -> FirestoreResult<Vec<u8>> {
        let user = self.current_user.clone();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |state, _| {
                Ok(state.user_components(&user).mutation_queue.last_stream_token().to_vec())
            })
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        let user = self.current_user.clone();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWrite, |state, _| {
                state
                    .user_components(&user)
                    .mutation_queue
                    .set_last_stream_token(token);
                Ok(())
            })
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence.state().target_cache.last_remote_snapshot_version()
    }

    /// Applies a consistent batch of watch changes to the cache and returns
    /// the local view of every document that changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let user = self.current_user.clone();
        let Self {
            persistence,
            target_data_by_target,
            ..
        } = self;

        let mut updated_targets = target_data_by_target.clone();
        let changes = persistence.run_transaction("Apply remote event", TransactionMode::ReadWrite, |state, txn| {
            for (target_id, change) in &event.target_changes {
                let Some(old_target_data) = updated_targets.get(target_id).cloned() else {
                    continue;
                };
                state.remove_matching_keys(change.removed_documents.iter(), *target_id, txn);
                state.add_matching_keys(change.added_documents.iter(), *target_id, txn);

                let mut new_target_data = old_target_data
                    .clone()
                    .with_sequence_number(txn.current_sequence_number());
                let mismatch = event.target_mismatches.contains_key(target_id);
                if mismatch {
                    new_target_data = new_target_data
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    new_target_data =
                        new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                }

                if mismatch || should_persist_target_data(&old_target_data, &new_target_data, change) {
                    state.target_cache.update_target_data(new_target_data.clone());
                }
                updated_targets.insert(*target_id, new_target_data);
            }

            for key in &event.resolved_limbo_documents {
                state
                    .reference_delegate
                    .update_limbo_document(key, txn.current_sequence_number());
            }

            let (changed_documents, existence_changed) =
                populate_document_changes(state, &event.document_updates, remote_version);

            if !remote_version.is_min() {
                let last = state.target_cache.last_remote_snapshot_version();
                if remote_version < last {
                    return Err(internal_error(format!(
                        "Watch stream reverted to previous snapshot ({remote_version:?} < {last:?})"
                    )));
                }
                state
                    .target_cache
                    .set_targets_metadata(txn.current_sequence_number(), Some(remote_version));
            }

            Ok(state
                .local_documents_view(&user)
                .get_local_view_of_documents(changed_documents, &existence_changed))
        })?;
        *target_data_by_target = updated_targets;
        Ok(changes)
    }

    /// Pins documents shown by views and advances the limbo-free version of
    /// targets whose views are in sync.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.persistence.run_transaction(
            "Notify local view changes",
            TransactionMode::ReadWrite,
            |state, txn| {
                for change in view_changes {
                    state
                        .reference_delegate
                        .add_in_memory_pins(change.added_keys.iter(), change.target_id);
                    state
                        .reference_delegate
                        .remove_in_memory_pins(change.removed_keys.iter(), change.target_id);
                    for key in &change.removed_keys {
                        state
                            .reference_delegate
                            .remove_reference(key, txn.current_sequence_number());
                    }
                }
                Ok(())
            },
        )?;

        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = self.target_data_by_target.get_mut(&change.target_id) {
                target_data.last_limbo_free_snapshot_version = target_data.snapshot_version;
            }
        }
        Ok(())
    }

    /// Returns the cached target data for `target`, allocating a new target
    /// id when the target was never listened to.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.persistence.run_transaction(
            "Allocate target",
            TransactionMode::ReadWrite,
            |state, txn| {
                if let Some(cached) = state.target_cache.get_target_data(&target) {
                    return Ok(cached.clone());
                }
                let target_id = state.target_cache.allocate_target_id();
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                state.target_cache.add_target_data(target_data.clone());
                Ok(target_data)
            },
        )?;

        let target_id = target_data.target_id;
        if let Some(active) = self.target_data_by_target.get(&target_id) {
            return Ok(active.clone());
        }
        self.target_data_by_target.insert(target_id, target_data.clone());
        self.target_id_by_target
            .insert(target_data.target.canonical_id(), target_id);
        Ok(target_data)
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        if let Some(target_id) = self.target_id_by_target.get(&target.canonical_id()) {
            return self.target_data_by_target.get(target_id).cloned();
        }
        self.persistence.state().target_cache.get_target_data(target).cloned()
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.target_data_by_target.keys().copied().collect()
    }

    /// Stops tracking `target_id` as active. The target stays cached until
    /// garbage collection removes it.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            log::debug!("LocalStore: ignoring release of inactive target {target_id}");
            return Ok(());
        };
        self.persistence
            .run_transaction("Release target", TransactionMode::ReadWrite, |state, txn| {
                if !keep_persisted_target_data {
                    let updated = target_data
                        .clone()
                        .with_sequence_number(txn.current_sequence_number());
                    state.target_cache.update_target_data(updated);
                }
                let unpinned = state
                    .reference_delegate
                    .remove_in_memory_pins_for_target(target_id);
                for key in &unpinned {
                    state
                        .reference_delegate
                        .remove_reference(key, txn.current_sequence_number());
                }
                Ok(())
            })?;
        self.target_data_by_target.remove(&target_id);
        self.target_id_by_target
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results`,
    /// the keys the server last reported for the query's target seed the
    /// result.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let user = self.current_user.clone();
        let target_data = self.get_target_data(&query.to_target());
        let Self {
            persistence,
            query_engine,
            ..
        } = self;
        persistence.run_transaction("Execute query", TransactionMode::ReadOnly, |state, _| {
            let remote_keys = target_data
                .as_ref()
                .map(|data| state.target_cache.get_matching_keys_for_target_id(data.target_id))
                .unwrap_or_default();
            let (last_limbo_free, previous_keys) = match (&target_data, use_previous_results) {
                (Some(data), true) => (data.last_limbo_free_snapshot_version, remote_keys.clone()),
                _ => (SnapshotVersion::min(), DocumentKeySet::new()),
            };
            let documents = query_engine.get_documents_matching_query(
                state,
                &user,
                query,
                last_limbo_free,
                &previous_keys,
            );
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    /// Local view of a single document, overlays included.
    pub fn read_document(&mut self, key: &DocumentKey) -> FirestoreResult<Document> {
        let user = self.current_user.clone();
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |state, _| {
                Ok(state.local_documents_view(&user).get_document(key))
            })
    }

    pub fn collect_garbage(&mut self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active = self.active_target_ids();
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWrite, |state, txn| {
                Ok(garbage_collector.collect(state, &active, txn.current_sequence_number()))
            })
    }

    /// True when a bundle with the same id and a create time at least as new
    /// was already loaded.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> bool {
        self.persistence
            .state()
            .bundle_cache
            .get_bundle_metadata(&metadata.id)
            .is_some_and(|cached| cached.create_time >= metadata.create_time)
    }

    pub fn save_bundle(&mut self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |state, _| {
                state.bundle_cache.save_bundle_metadata(metadata);
                Ok(())
            })
    }

    pub fn save_named_query(&mut self, query: NamedQuery) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |state, _| {
                state.bundle_cache.save_named_query(query);
                Ok(())
            })
    }

    pub fn get_named_query(&self, name: &str) -> Option<NamedQuery> {
        self.persistence.state().bundle_cache.get_named_query(name).cloned()
    }

    pub fn configure_field_index(
        &mut self,
        collection_group: &str,
        segments: Vec<IndexSegment>,
    ) -> FirestoreResult<FieldIndex> {
        self.persistence
            .run_transaction("Configure field index", TransactionMode::ReadWrite, |state, _| {
                let PersistenceState {
                    remote_documents,
                    index_manager,
                    ..
                } = state;
                Ok(index_manager.add_field_index(collection_group, segments, remote_documents.documents()))
            })
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }
}

/// Bookkeeping shared by acknowledged and rejected batches once the batch
/// left the queue.
fn finish_batch_removal(
    state: &mut PersistenceState,
    user: &User,
    txn: &PersistenceTransaction,
    batch_id: BatchId,
    keys: &DocumentKeySet,
) {
    for key in keys {
        state
            .reference_delegate
            .remove_mutation_reference(key, txn.current_sequence_number());
    }
    state
        .user_components(user)
        .overlays
        .remove_overlays_for_batch_id(keys.iter(), batch_id);
}

/// Writes the newer of the cached and incoming documents to the remote
/// document cache. Returns the documents that changed and the keys whose
/// existence flipped.
fn populate_document_changes(
    state: &mut PersistenceState,
    updates: &MutableDocumentMap,
    remote_version: SnapshotVersion,
) -> (MutableDocumentMap, DocumentKeySet) {
    let mut changed = MutableDocumentMap::new();
    let mut existence_changed = DocumentKeySet::new();
    for (key, document) in updates {
        let existing = state.remote_documents.get_entry(key);
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes from rejected limbo resolutions must never
            // land in the cache.
            state.remote_documents.remove_entry(key);
            state.index_manager.remove_index_entries(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            let mut document = document.clone();
            document.set_read_time(remote_version);
            state
                .index_manager
                .add_to_collection_parent_index(&key.collection_path());
            state.index_manager.update_index_entries([&document]);
            state.remote_documents.add_entry(document.clone());
            changed.insert(key.clone(), document);
        } else {
            log::debug!(
                "LocalStore: ignoring outdated watch update for {}. Current version: {:?}, watch version: {:?}",
                key.path().canonical_string(),
                existing.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.document_change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldMask, FieldPath, MutableDocument, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(name: &str) -> MapValue {
        let mut value = MapValue::empty();
        value.set(
            &FieldPath::from_dot_separated("name").unwrap(),
            FirestoreValue::from_string(name),
        );
        value
    }

    fn store() -> LocalStore {
        LocalStore::new(User::new("u1"), IndexAutoCreationSettings::default())
    }

    fn remote_event(
        target_id: TargetId,
        snapshot: SnapshotVersion,
        added: Vec<MutableDocument>,
    ) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version: snapshot,
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            resume_token: b"token".to_vec(),
            current: true,
            ..TargetChange::default()
        };
        for document in added {
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn remote_documents_read_back_unchanged_without_local_writes() {
        let mut store = store();
        let query = Query::collection("bases").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let document = MutableDocument::new_found_document(key("bases/coffee"), version(2), data("Coffee"));

        let changes = store
            .apply_remote_event(&remote_event(target.target_id, version(2), vec![document.clone()]))
            .unwrap();
        assert_eq!(changes[&key("bases/coffee")].data(), document.data());

        let read = store.read_document(&key("bases/coffee")).unwrap();
        assert_eq!(read.data(), document.data());
        assert_eq!(read.version(), version(2));
        assert!(!read.has_pending_writes());
        assert_eq!(store.last_remote_snapshot_version(), version(2));
    }

    #[test]
    fn outdated_watch_updates_are_ignored() {
        let mut store = store();
        let target = store
            .allocate_target(Query::collection("bases").unwrap().to_target())
            .unwrap();
        let newer = MutableDocument::new_found_document(key("bases/a"), version(5), data("New"));
        store
            .apply_remote_event(&remote_event(target.target_id, version(5), vec![newer]))
            .unwrap();
        let older = MutableDocument::new_found_document(key("bases/a"), version(3), data("Old"));
        let changes = store
            .apply_remote_event(&remote_event(target.target_id, version(6), vec![older]))
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.read_document(&key("bases/a")).unwrap().data(), &data("New"));
    }

    #[test]
    fn acknowledged_writes_land_in_the_remote_cache() {
        let mut store = store();
        let write = store
            .write_locally(vec![Mutation::set(key("beverages/b"), data("Morning Brew"))])
            .unwrap();
        assert!(write.changes[&key("beverages/b")].has_local_mutations());

        let batch = store.next_mutation_batch(None).unwrap().unwrap();
        let result = MutationBatchResult::new(
            batch,
            version(4),
            vec![MutationResult {
                version: version(4),
                transform_results: Vec::new(),
            }],
            b"stream".to_vec(),
        )
        .unwrap();
        let changes = store.acknowledge_batch(&result).unwrap();
        let document = &changes[&key("beverages/b")];
        assert!(document.has_committed_mutations());
        assert_eq!(store.last_stream_token().unwrap(), b"stream".to_vec());
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
    }

    #[test]
    fn rejected_writes_are_unwound() {
        let mut store = store();
        let write = store
            .write_locally(vec![Mutation::patch(
                key("beverages/b"),
                data("Renamed"),
                FieldMask::new([FieldPath::from_dot_separated("name").unwrap()]),
            )])
            .unwrap();
        let changes = store.reject_batch(write.batch_id).unwrap();
        assert!(!changes[&key("beverages/b")].is_found_document());
        assert!(store.next_mutation_batch(None).unwrap().is_none());
    }

    #[test]
    fn user_change_swaps_the_mutation_queue() {
        let mut store = store();
        store
            .write_locally(vec![Mutation::set(key("beverages/b"), data("Mine"))])
            .unwrap();
        let result = store.handle_user_change(User::new("u2")).unwrap();
        assert_eq!(result.removed_batch_ids.len(), 1);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("beverages/b")].is_found_document());

        let back = store.handle_user_change(User::new("u1")).unwrap();
        assert!(back.affected_documents[&key("beverages/b")].has_local_mutations());
    }

    #[test]
    fn resume_tokens_persist_on_first_change_and_clear_on_mismatch() {
        let mut store = store();
        let target = store
            .allocate_target(Query::collection("bases").unwrap().to_target())
            .unwrap();
        store
            .apply_remote_event(&remote_event(target.target_id, version(1), Vec::new()))
            .unwrap();
        let cached = store
            .persistence()
            .state()
            .target_cache
            .target_data_for_id(target.target_id)
            .cloned()
            .unwrap();
        assert_eq!(cached.resume_token, b"token".to_vec());

        let mut mismatch = remote_event(target.target_id, version(2), Vec::new());
        mismatch
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();
        let cached = store
            .persistence()
            .state()
            .target_cache
            .target_data_for_id(target.target_id)
            .cloned()
            .unwrap();
        assert!(cached.resume_token.is_empty());
        assert!(cached.last_limbo_free_snapshot_version.is_min());
    }

    #[test]
    fn execute_query_sees_pending_writes() {
        let mut store = store();
        store
            .write_locally(vec![Mutation::set(key("beverages/b"), data("Latte"))])
            .unwrap();
        let result = store
            .execute_query(&Query::collection("beverages").unwrap(), true)
            .unwrap();
        assert_eq!(result.documents.len(), 1);
        assert!(result.remote_keys.is_empty());
    }

    #[test]
    fn bundles_are_tracked_by_create_time() {
        let mut store = store();
        let bundle = BundleMetadata {
            id: "menu".to_string(),
            version: 1,
            create_time: version(5),
            total_documents: 3,
            total_bytes: 512,
        };
        assert!(!store.has_newer_bundle(&bundle));
        store.save_bundle(bundle.clone()).unwrap();
        assert!(store.has_newer_bundle(&bundle));
        assert!(!store.has_newer_bundle(&BundleMetadata {
            create_time: version(6),
            ..bundle
        }));

        store
            .save_named_query(NamedQuery {
                name: "all-bases".to_string(),
                query: Query::collection("bases").unwrap(),
                read_time: version(5),
            })
            .unwrap();
        let named = store.get_named_query("all-bases").unwrap();
        assert_eq!(named.read_time, version(5));
        assert!(store.get_named_query("missing").is_none());
    }
}
