use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::ReferenceSet;
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};

/// Pending writes of a single user, ordered by batch id.
#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    batches_by_key: ReferenceSet,
    last_stream_token: Vec<u8>,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            batches_by_key: ReferenceSet::new(),
            last_stream_token: Vec::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("mutation batches should not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        if let Some(previous) = self.queue.last() {
            if previous.batch_id() >= batch_id {
                return Err(internal_error("mutation batch ids must be monotonically increasing"));
            }
        }

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in batch.mutations() {
            self.batches_by_key
                .add_reference(mutation.key().clone(), batch_id);
        }
        self.queue.push(batch.clone());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        let index = self.index_of_batch_id(batch_id)?;
        self.queue.get(index)
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.queue.iter().find(|batch| batch.batch_id() > batch_id)
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> &[MutationBatch] {
        &self.queue
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<&MutationBatch> {
        self.batches_by_key
            .ids_for_key(key)
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Batches touching any of `keys`, in batch id order without duplicates.
    pub fn all_mutation_batches_affecting_document_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> Vec<&MutationBatch> {
        let ids: BTreeSet<BatchId> = keys
            .into_iter()
            .flat_map(|key| self.batches_by_key.ids_for_key(key))
            .collect();
        ids.into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        match self.queue.first() {
            Some(head) if head.batch_id() == batch.batch_id() => {}
            Some(head) => {
                return Err(internal_error(format!(
                    "can only remove the first batch of the mutation queue (head {}, got {})",
                    head.batch_id(),
                    batch.batch_id()
                )));
            }
            None => return Err(internal_error("cannot remove a batch from an empty queue")),
        }
        self.queue.remove(0);
        for mutation in batch.mutations() {
            self.batches_by_key
                .remove_reference(mutation.key(), batch.batch_id());
        }
        Ok(())
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key.contains_key(key)
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Option<usize> {
        self.queue
            .binary_search_by_key(&batch_id, MutationBatch::batch_id)
            .ok()
    }
}
