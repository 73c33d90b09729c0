use std::collections::BTreeMap;

use crate::firestore::core::{ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::firestore::credentials::User;
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::MemoryLruDelegate;
use crate::firestore::local::{
    LocalDocumentsView, MemoryBundleCache, MemoryDocumentOverlayCache, MemoryIndexManager, MemoryMutationQueue,
    MemoryRemoteDocumentCache, MemoryTargetCache,
};
use crate::firestore::model::DocumentKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Context handed to transaction bodies.
#[derive(Clone, Copy, Debug)]
pub struct PersistenceTransaction {
    current_sequence_number: ListenSequenceNumber,
}

impl PersistenceTransaction {
    /// Sequence number stamped on everything this transaction touches.
    /// Read-only transactions carry `INVALID_SEQUENCE_NUMBER`.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

/// Mutation queue and overlays of one user.
#[derive(Clone, Debug, Default)]
pub struct UserComponents {
    pub mutation_queue: MemoryMutationQueue,
    pub overlays: MemoryDocumentOverlayCache,
}

/// Everything the memory persistence stores.
#[derive(Clone, Debug, Default)]
pub struct PersistenceState {
    pub remote_documents: MemoryRemoteDocumentCache,
    pub target_cache: MemoryTargetCache,
    pub bundle_cache: MemoryBundleCache,
    pub index_manager: MemoryIndexManager,
    pub reference_delegate: MemoryLruDelegate,
    users: BTreeMap<String, UserComponents>,
}

impl PersistenceState {
    pub fn user_components(&mut self, user: &User) -> &mut UserComponents {
        self.users.entry(user.to_key()).or_default()
    }

    /// Local view of `user`'s documents: remote state plus their overlays.
    pub fn local_documents_view(&mut self, user: &User) -> LocalDocumentsView<'_> {
        let components = self.users.entry(user.to_key()).or_default();
        LocalDocumentsView::new(
            &self.remote_documents,
            &components.mutation_queue,
            &mut components.overlays,
            &self.index_manager,
        )
    }

    pub fn mutation_queues(&self) -> impl Iterator<Item = &MemoryMutationQueue> {
        self.users.values().map(|components| &components.mutation_queue)
    }

    /// Marks `keys` as matching `target_id` and stamps them for LRU.
    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
        txn: &PersistenceTransaction,
    ) {
        let keys: Vec<&DocumentKey> = keys.into_iter().collect();
        self.target_cache
            .add_matching_keys(keys.iter().copied(), target_id);
        for key in keys {
            self.reference_delegate
                .add_reference(key, txn.current_sequence_number());
        }
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
        txn: &PersistenceTransaction,
    ) {
        let keys: Vec<&DocumentKey> = keys.into_iter().collect();
        self.target_cache
            .remove_matching_keys(keys.iter().copied(), target_id);
        for key in keys {
            self.reference_delegate
                .remove_reference(key, txn.current_sequence_number());
        }
    }

    /// A document is pinned while any target, pending write, or local view
    /// refers to it.
    pub fn is_pinned(&self, key: &DocumentKey) -> bool {
        self.mutation_queues().any(|queue| queue.contains_key(key))
            || self.reference_delegate.has_in_memory_pin(key)
            || self.target_cache.contains_key(key)
    }
}

/// Monotonic sequence numbers for LRU bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }
}

/// Memory-only persistence. Read-write transactions are atomic: a body that
/// returns an error leaves the state exactly as it found it.
#[derive(Debug)]
pub struct MemoryPersistence {
    state: PersistenceState,
    listen_sequence: ListenSequence,
    started: bool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        let state = PersistenceState::default();
        let listen_sequence =
            ListenSequence::new(state.target_cache.highest_listen_sequence_number());
        Self {
            state,
            listen_sequence,
            started: true,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn shutdown(&mut self) {
        self.started = false;
    }

    pub fn state(&self) -> &PersistenceState {
        &self.state
    }

    pub fn run_transaction<T, F>(
        &mut self,
        action: &str,
        mode: TransactionMode,
        body: F,
    ) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceState, &PersistenceTransaction) -> FirestoreResult<T>,
    {
        if !self.started {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        log::debug!("Persistence: starting transaction '{action}'");
        match mode {
            TransactionMode::ReadOnly => {
                let txn = PersistenceTransaction {
                    current_sequence_number: INVALID_SEQUENCE_NUMBER,
                };
                body(&mut self.state, &txn)
            }
            TransactionMode::ReadWrite => {
                let txn = PersistenceTransaction {
                    current_sequence_number: self.listen_sequence.next(),
                };
                let snapshot = self.state.clone();
                match body(&mut self.state, &txn) {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        log::debug!("Persistence: transaction '{action}' rolled back: {err}");
                        self.state = snapshot;
                        Err(err)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::internal_error;
    use crate::firestore::model::{MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn document(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::empty(),
        )
    }

    #[test]
    fn failed_transactions_roll_back() {
        let mut persistence = MemoryPersistence::new();
        let result: FirestoreResult<()> = persistence.run_transaction(
            "write then fail",
            TransactionMode::ReadWrite,
            |state, _| {
                state.remote_documents.add_entry(document("bases/a"));
                Err(internal_error("boom"))
            },
        );
        assert!(result.is_err());
        assert!(persistence.state().remote_documents.is_empty());
    }

    #[test]
    fn read_write_transactions_advance_the_sequence_number() {
        let mut persistence = MemoryPersistence::new();
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |_, txn| {
                Ok(txn.current_sequence_number())
            })
            .unwrap();
        let second = persistence
            .run_transaction("b", TransactionMode::ReadWrite, |_, txn| {
                Ok(txn.current_sequence_number())
            })
            .unwrap();
        let read = persistence
            .run_transaction("c", TransactionMode::ReadOnly, |_, txn| {
                Ok(txn.current_sequence_number())
            })
            .unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(read, INVALID_SEQUENCE_NUMBER);
    }

    #[test]
    fn shut_down_persistence_rejects_transactions() {
        let mut persistence = MemoryPersistence::new();
        persistence.shutdown();
        let err = persistence
            .run_transaction("late", TransactionMode::ReadOnly, |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn mutation_queues_are_kept_per_user() {
        let mut state = PersistenceState::default();
        state
            .user_components(&User::new("u1"))
            .mutation_queue
            .add_mutation_batch(
                Timestamp::now(),
                Vec::new(),
                vec![crate::firestore::model::Mutation::delete(
                    DocumentKey::from_string("beverages/x").unwrap(),
                )],
            )
            .unwrap();
        assert!(state.user_components(&User::unauthenticated()).mutation_queue.is_empty());
        assert!(state.is_pinned(&DocumentKey::from_string("beverages/x").unwrap()));
    }
}
