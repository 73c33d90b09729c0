use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation,
    MutationResult, OverlayedDocument, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Batch id used before any batch has been written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Group of mutations written atomically by one user write. Batch ids are
/// strictly increasing per user.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the acknowledged batch to `document` using the server results.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        if result.mutation_results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                result.mutation_results.len()
            )));
        }
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result)?;
            }
        }
        Ok(())
    }

    /// Applies base mutations then user mutations for `document`'s key and
    /// returns the accumulated field mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and returns the new
    /// overlay mutation for each key.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let key = mutation.key();
            let Some(entry) = documents.get_mut(key) else {
                continue;
            };
            let mutated_fields =
                self.apply_to_local_view(&mut entry.document, entry.mutated_fields.take());
            let mutated_fields = if documents_without_remote_version.contains(key) {
                None
            } else {
                mutated_fields
            };
            if let Some(overlay) =
                calculate_overlay_mutation(&entry.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            entry.mutated_fields = mutated_fields;
            if !entry.document.is_valid_document() {
                entry.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Server acknowledgement for a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version the server assigned to each written document.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "MutationBatchResult expects {} results, got {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, MutationKind};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(name: &str) -> MapValue {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string(name));
        MapValue::new(fields)
    }

    #[test]
    fn local_view_applies_only_matching_mutations() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(10, 0),
            Vec::new(),
            vec![
                Mutation::set(key("coll/a"), data("a")),
                Mutation::set(key("coll/b"), data("b")),
            ],
        );
        let mut doc = MutableDocument::new_invalid_document(key("coll/a"));
        let mask = batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert!(mask.is_none());
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("name").unwrap()),
            Some(&FirestoreValue::from_string("a"))
        );
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn document_set_overlays_new_documents_as_sets() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(10, 0),
            Vec::new(),
            vec![Mutation::set(key("coll/a"), data("a"))],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("coll/a"),
            OverlayedDocument::new(
                MutableDocument::new_invalid_document(key("coll/a")),
                Some(FieldMask::empty()),
            ),
        );
        let without_remote: BTreeSet<_> = [key("coll/a")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_remote);
        let overlay = overlays.get(&key("coll/a")).unwrap();
        assert!(matches!(overlay.kind(), MutationKind::Set { .. }));
    }

    #[test]
    fn batch_result_requires_one_result_per_mutation() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(10, 0),
            Vec::new(),
            vec![Mutation::delete(key("coll/a"))],
        );
        let err = MutationBatchResult::new(batch.clone(), SnapshotVersion::min(), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Internal);

        let version = SnapshotVersion::new(Timestamp::new(20, 0));
        let result = MutationBatchResult::new(
            batch,
            version,
            vec![MutationResult {
                version,
                transform_results: Vec::new(),
            }],
            b"token".to_vec(),
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key("coll/a")), Some(&version));
    }
}
