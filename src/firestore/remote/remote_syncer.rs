use async_trait::async_trait;

use crate::firestore::core::{OnlineState, TargetId};
use crate::firestore::credentials::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::stream::{StreamEvent, StreamKind};

/// Callbacks from the remote store into the component that owns local
/// state.
///
/// The remote store never holds its own lock while calling into the syncer,
/// so implementations may call back into the remote store (for example to
/// listen to a limbo resolution target).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RemoteSyncer: Send + Sync {
    /// Applies one consistent snapshot of watch changes.
    async fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed `target_id` with an error.
    async fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected the batch.
    async fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Switches local state to `user`. Called while the network is paused.
    async fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()>;

    /// Keys the local views consider part of `target_id` as of the last
    /// applied remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    /// First queued batch with an id greater than `after_batch_id`.
    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    /// Stream token persisted by the last handshake or acknowledgement.
    fn last_stream_token(&mut self) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()>;

    fn handle_online_state_change(&mut self, online_state: OnlineState);
}

/// Stream callbacks and timers destined for the remote store.
pub enum RemoteStoreEvent {
    Stream {
        kind: StreamKind,
        /// Connection attempt the event belongs to. Events from superseded
        /// attempts are dropped.
        generation: u64,
        event: StreamEvent,
    },
    OnlineStateTimeout,
}

impl std::fmt::Debug for RemoteStoreEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStoreEvent::Stream {
                kind,
                generation,
                event,
            } => f
                .debug_struct("Stream")
                .field("kind", kind)
                .field("generation", generation)
                .field("event", &event.label())
                .finish(),
            RemoteStoreEvent::OnlineStateTimeout => f.write_str("OnlineStateTimeout"),
        }
    }
}

/// Routes [`RemoteStoreEvent`]s back to the remote store.
///
/// `deliver` always runs on the async queue. Implementations obtain the
/// syncer (usually by locking it) and hand both to
/// [`RemoteStore::handle_event`](crate::firestore::remote::RemoteStore::handle_event).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RemoteStoreEventSink: Send + Sync + 'static {
    async fn deliver(&self, event: RemoteStoreEvent);
}
