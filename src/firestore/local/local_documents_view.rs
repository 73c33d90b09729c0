use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::{
    MemoryDocumentOverlayCache, MemoryIndexManager, MemoryMutationQueue, MemoryRemoteDocumentCache,
};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap,
    FieldMask, MutableDocument, MutableDocumentMap, MutationKind, Overlay, OverlayMap,
    OverlayedDocument, SnapshotVersion, Timestamp,
};

/// Reads documents as the user sees them: the remote document with the
/// user's overlay applied on top.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a MemoryRemoteDocumentCache,
    mutation_queue: &'a MemoryMutationQueue,
    overlays: &'a mut MemoryDocumentOverlayCache,
    index_manager: &'a MemoryIndexManager,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(
        remote_documents: &'a MemoryRemoteDocumentCache,
        mutation_queue: &'a MemoryMutationQueue,
        overlays: &'a mut MemoryDocumentOverlayCache,
        index_manager: &'a MemoryIndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MemoryMutationQueue {
        self.mutation_queue
    }

    pub fn overlays(&self) -> &MemoryDocumentOverlayCache {
        self.overlays
    }

    /// Local view of a single document. Unknown keys come back as invalid
    /// documents.
    pub fn get_document(&self, key: &DocumentKey) -> Document {
        let overlay = self.overlays.get_overlay(key);
        let mut document = self.base_document(key, overlay);
        if let Some(overlay) = overlay {
            overlay
                .mutation()
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents<'k>(&mut self, keys: impl IntoIterator<Item = &'k DocumentKey>) -> DocumentMap {
        let documents = self.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_changed` whose
    /// overlay is a patch (or missing) are recalculated from the mutation
    /// queue since their base document appeared or disappeared.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: MutableDocumentMap,
        existence_changed: &DocumentKeySet,
    ) -> DocumentMap {
        let overlays = self.overlays.get_overlays(documents.keys());
        self.compute_views(documents, overlays, existence_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Like `get_local_view_of_documents` but keeps the mutated field masks.
    pub fn get_overlayed_documents(
        &mut self,
        documents: MutableDocumentMap,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays = self.overlays.get_overlays(documents.keys());
        self.compute_views(documents, overlays, &DocumentKeySet::new())
    }

    fn compute_views(
        &mut self,
        documents: MutableDocumentMap,
        overlays: OverlayMap,
        existence_changed: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let now = Timestamp::now();
        let mut results = BTreeMap::new();
        let mut recalculate = MutableDocumentMap::new();

        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let is_patch = overlay
                .is_some_and(|overlay| matches!(overlay.mutation().kind(), MutationKind::Patch { .. }));
            if existence_changed.contains(&key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key, document);
            } else if let Some(overlay) = overlay {
                let mutated_fields = overlay.mutation().field_mask();
                overlay
                    .mutation()
                    .apply_to_local_view(&mut document, mutated_fields.clone(), now);
                results.insert(key, OverlayedDocument::new(document, mutated_fields));
            } else {
                results.insert(key, OverlayedDocument::new(document, Some(FieldMask::empty())));
            }
        }

        let masks = self.recalculate_and_save_overlays(&mut recalculate);
        for (key, document) in recalculate {
            let mutated_fields = masks.get(&key).cloned().unwrap_or(Some(FieldMask::empty()));
            results.insert(key, OverlayedDocument::new(document, mutated_fields));
        }
        results
    }

    /// Replays every pending batch touching `documents` onto them and saves
    /// the resulting overlays. Returns the mutated field mask per key.
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: &mut MutableDocumentMap,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();

        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(documents.keys());
        for batch in batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or(Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                documents_by_batch
                    .entry(batch.batch_id())
                    .or_default()
                    .insert(key);
            }
        }

        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in documents_by_batch.iter().rev() {
            let mut to_save = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(key) else {
                    continue;
                };
                let mask = masks.get(key).and_then(Option::as_ref);
                if let Some(mutation) = calculate_overlay_mutation(document, mask) {
                    to_save.insert(key.clone(), mutation);
                }
            }
            self.overlays.save_overlays(*batch_id, to_save);
        }
        masks
    }

    pub fn recalculate_and_save_overlays_for_document_keys<'k>(
        &mut self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) {
        let mut documents = self.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(&mut documents);
    }

    /// Local results for `query`, considering remote documents read after
    /// `since_read_time` plus every document with an overlay.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            return self.document_query_results(query);
        }
        if let Some(group) = query.collection_group_id() {
            let mut results = DocumentMap::new();
            for parent in self.index_manager.get_collection_parents(group) {
                let collection_query = query.as_collection_query_at_path(parent.child([group]));
                results.extend(self.collection_query_results(&collection_query, since_read_time));
            }
            return results;
        }
        self.collection_query_results(query, since_read_time)
    }

    fn document_query_results(&self, query: &Query) -> DocumentMap {
        let mut results = DocumentMap::new();
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return results;
        };
        let document = self.get_document(&key);
        if document.is_found_document() {
            results.insert(key, document);
        }
        results
    }

    fn collection_query_results(&self, query: &Query, since_read_time: SnapshotVersion) -> DocumentMap {
        let overlays = self
            .overlays
            .get_overlays_for_collection(query.path(), -1);
        let mutated_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut remote = self
            .remote_documents
            .get_documents_matching_query(query, since_read_time, &mutated_keys);
        for key in overlays.keys() {
            remote
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let now = Timestamp::now();
        let mut results = DocumentMap::new();
        for (key, mut document) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation()
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }

    /// Base document an overlay applies to: the remote document for
    /// patches, nothing for mutations that replace the whole document.
    fn base_document(&self, key: &DocumentKey, overlay: Option<&Overlay>) -> MutableDocument {
        match overlay {
            Some(overlay) if !matches!(overlay.mutation().kind(), MutationKind::Patch { .. }) => {
                MutableDocument::new_invalid_document(key.clone())
            }
            _ => self.remote_documents.get_entry(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, Mutation};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&FieldPath::from_dot_separated(field).unwrap(), entry.clone());
        }
        value
    }

    fn remote(path: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let mut document = MutableDocument::new_found_document(key(path), version, map(entries));
        document.set_read_time(version);
        document
    }

    struct Fixture {
        remote: MemoryRemoteDocumentCache,
        queue: MemoryMutationQueue,
        overlays: MemoryDocumentOverlayCache,
        indexes: MemoryIndexManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                remote: MemoryRemoteDocumentCache::new(),
                queue: MemoryMutationQueue::new(),
                overlays: MemoryDocumentOverlayCache::new(),
                indexes: MemoryIndexManager::new(),
            }
        }

        /// Queues `mutations` as one batch and refreshes overlays.
        fn write(&mut self, mutations: Vec<Mutation>) {
            let keys: Vec<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
            self.queue
                .add_mutation_batch(Timestamp::now(), Vec::new(), mutations)
                .unwrap();
            self.view().recalculate_and_save_overlays_for_document_keys(keys.iter());
        }

        fn view(&mut self) -> LocalDocumentsView<'_> {
            LocalDocumentsView::new(&self.remote, &self.queue, &mut self.overlays, &self.indexes)
        }
    }

    fn patch(path: &str, field: &str, value: FirestoreValue) -> Mutation {
        let field_path = FieldPath::from_dot_separated(field).unwrap();
        Mutation::patch(
            key(path),
            map(&[(field, value)]),
            FieldMask::new([field_path]),
        )
    }

    #[test]
    fn documents_without_writes_read_back_the_remote_state() {
        let mut fixture = Fixture::new();
        let document = remote("bases/coffee", &[("name", FirestoreValue::from_string("Coffee"))]);
        fixture.remote.add_entry(document.clone());
        let local = fixture.view().get_document(&key("bases/coffee"));
        assert_eq!(local.data(), document.data());
        assert!(!local.has_local_mutations());
    }

    #[test]
    fn overlays_match_in_order_replay_regardless_of_batching() {
        let base = remote("beverages/b", &[("name", FirestoreValue::from_string("Tea"))]);

        let mut split = Fixture::new();
        split.remote.add_entry(base.clone());
        split.write(vec![patch("beverages/b", "temperature", FirestoreValue::from_string("Hot"))]);
        split.write(vec![patch("beverages/b", "name", FirestoreValue::from_string("Chai"))]);

        let mut combined = Fixture::new();
        combined.remote.add_entry(base);
        combined.write(vec![
            patch("beverages/b", "temperature", FirestoreValue::from_string("Hot")),
            patch("beverages/b", "name", FirestoreValue::from_string("Chai")),
        ]);

        let split_doc = split.view().get_document(&key("beverages/b"));
        let combined_doc = combined.view().get_document(&key("beverages/b"));
        assert_eq!(split_doc.data(), combined_doc.data());
        assert_eq!(
            split_doc.data().get(&FieldPath::from_dot_separated("name").unwrap()),
            Some(&FirestoreValue::from_string("Chai"))
        );
        assert!(split_doc.has_local_mutations());
    }

    #[test]
    fn delete_overlays_hide_remote_documents_from_queries() {
        let mut fixture = Fixture::new();
        fixture
            .remote
            .add_entry(remote("bases/a", &[("name", FirestoreValue::from_string("Coffee"))]));
        fixture
            .remote
            .add_entry(remote("bases/b", &[("name", FirestoreValue::from_string("Tea"))]));
        fixture.write(vec![Mutation::delete(key("bases/a"))]);

        let query = Query::collection("bases").unwrap();
        let results = fixture
            .view()
            .get_documents_matching_query(&query, SnapshotVersion::min());
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&key("bases/b")));
    }

    #[test]
    fn set_overlays_surface_documents_missing_remotely() {
        let mut fixture = Fixture::new();
        fixture.write(vec![Mutation::set(
            key("bases/new"),
            map(&[("name", FirestoreValue::from_string("Matcha"))]),
        )]);
        let query = Query::collection("bases").unwrap();
        let results = fixture
            .view()
            .get_documents_matching_query(&query, SnapshotVersion::min());
        assert!(results[&key("bases/new")].has_local_mutations());
    }

    #[test]
    fn collection_group_queries_span_parents() {
        let mut fixture = Fixture::new();
        fixture.indexes.add_to_collection_parent_index(
            &crate::firestore::model::ResourcePath::from_string("users/u1/beverages").unwrap(),
        );
        fixture.indexes.add_to_collection_parent_index(
            &crate::firestore::model::ResourcePath::from_string("beverages").unwrap(),
        );
        fixture.remote.add_entry(remote("users/u1/beverages/x", &[]));
        fixture.remote.add_entry(remote("beverages/y", &[]));
        let results = fixture
            .view()
            .get_documents_matching_query(&Query::collection_group("beverages"), SnapshotVersion::min());
        assert_eq!(results.len(), 2);
    }
}
