use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, Overlay, OverlayMap, ResourcePath,
};

/// Saved overlays of one user, indexed by the batch that last touched each
/// document.
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays<'a>(&self, keys: impl IntoIterator<Item = &'a DocumentKey>) -> OverlayMap {
        keys.into_iter()
            .filter_map(|key| {
                self.overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    pub fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for (key, mutation) in overlays {
            self.save_overlay(largest_batch_id, key, mutation);
        }
    }

    /// Drops the overlays whose largest batch is `batch_id` for the given keys.
    pub fn remove_overlays_for_batch_id<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        batch_id: BatchId,
    ) {
        let Some(batch_keys) = self.keys_by_batch_id.get_mut(&batch_id) else {
            return;
        };
        for key in keys {
            if batch_keys.remove(key) {
                self.overlays.remove(key);
            }
        }
        if batch_keys.is_empty() {
            self.keys_by_batch_id.remove(&batch_id);
        }
    }

    /// Overlays for documents directly in `collection` whose batch id is
    /// greater than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id() > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, key: DocumentKey, mutation: Mutation) {
        if let Some(existing) = self.overlays.get(&key) {
            let previous_batch = existing.largest_batch_id();
            if let Some(keys) = self.keys_by_batch_id.get_mut(&previous_batch) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.keys_by_batch_id.remove(&previous_batch);
                }
            }
        }
        self.keys_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays
            .insert(key, Overlay::new(largest_batch_id, mutation));
    }
}
