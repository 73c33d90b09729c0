use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{
    OnlineState, Query, TargetId, TargetIdGenerator, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::credentials::User;
use crate::firestore::error::{cancelled, internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::{LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation,
    MutationBatch, MutationBatchResult, SnapshotVersion, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::util::subscribe::Observer;

/// Resolves once the backend acknowledged or rejected a write.
pub type PendingWrite = oneshot::Receiver<FirestoreResult<()>>;

/// Default cap on limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A limbo document being resolved through its own document target.
struct LimboResolution {
    key: DocumentKey,
    /// Whether the resolution target has delivered the document, so its
    /// remote keys include it.
    received_document: bool,
}

/// Ties the local store, the remote store and the user's listeners
/// together.
///
/// The engine owns every [`View`]. Remote events and write results are
/// applied to the local store first and then folded into the views, whose
/// snapshots are handed to the [`EventManager`]. Documents a view shows
/// without the backend confirming them ("limbo" documents) get a dedicated
/// document listen, at most `max_concurrent_limbo_resolutions` at a time.
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    max_concurrent_limbo_resolutions: usize,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: HashMap<String, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    current_user: User,
    online_state: OnlineState,
}

impl SyncEngine {
    pub fn new(
        local_store: LocalStore,
        remote_store: RemoteStore,
        max_concurrent_limbo_resolutions: usize,
    ) -> Self {
        let current_user = local_store.current_user().clone();
        Self {
            local_store,
            remote_store,
            event_manager: EventManager::new(),
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            max_concurrent_limbo_resolutions,
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            current_user,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Limbo documents with an active resolution target.
    pub fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot.
    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Connects the remote store and sends writes queued by earlier sessions.
    pub async fn start(&mut self) -> FirestoreResult<()> {
        let remote = self.remote_store.clone();
        remote.start(self).await
    }

    /// Registers `observer` for `query`. The first listener of a query
    /// allocates its target and starts listening to it.
    pub async fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        observer: Observer<ViewSnapshot>,
    ) -> FirestoreResult<ListenerId> {
        let initial_snapshot = if self.event_manager.has_listeners(&query) {
            None
        } else {
            Some(self.listen_to_query(&query).await?)
        };
        let listener = QueryListener::new(query, options, observer);
        Ok(self.event_manager.add_listener(listener, initial_snapshot))
    }

    async fn listen_to_query(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        log::debug!("SyncEngine: listening to {} as target {target_id}", query.canonical_id());

        let snapshot = match self.query_views.get(&query.canonical_id()) {
            Some(query_view) => query_view.view.compute_initial_snapshot(),
            None => self.initialize_view_and_compute_snapshot(query, target_id)?,
        };

        let first_query_for_target = !self.queries_by_target.contains_key(&target_id);
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        if first_query_for_target {
            let remote = self.remote_store.clone();
            remote.listen(target_data, self).await;
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(false, Vec::new());
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Removes a listener. The last listener of a query releases its target.
    pub async fn unlisten(&mut self, listener_id: ListenerId) -> FirestoreResult<()> {
        let Some(query) = self.event_manager.remove_listener(listener_id) else {
            return Ok(());
        };
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views.remove(&canonical_id) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|candidate| candidate.canonical_id() != canonical_id);
            if !queries.is_empty() {
                return Ok(());
            }
        }

        log::debug!("SyncEngine: releasing target {target_id}");
        self.local_store.release_target(target_id, false)?;
        let remote = self.remote_store.clone();
        remote.unlisten(target_id, self).await;
        self.remove_and_cleanup_target(target_id, None).await;
        Ok(())
    }

    /// Applies `mutations` locally as one batch and queues it for the
    /// backend. The returned receiver resolves with the backend's verdict.
    pub async fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let result = self.local_store.write_locally(mutations)?;
        let (sender, receiver) = oneshot::channel();
        self.mutation_callbacks
            .entry(self.current_user.to_key())
            .or_default()
            .insert(result.batch_id, sender);

        self.emit_new_snapshots(&result.changes, None).await?;
        let remote = self.remote_store.clone();
        remote.fill_write_pipeline(self).await?;
        Ok(receiver)
    }

    /// Resolves once every batch queued so far has left the queue.
    pub fn wait_for_pending_writes(&mut self) -> FirestoreResult<PendingWrite> {
        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
            return Ok(receiver);
        }
        if self.online_state == OnlineState::Offline {
            log::debug!(
                "SyncEngine: the network is unavailable, pending writes will not complete until it is back"
            );
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    pub async fn enable_network(&mut self) -> FirestoreResult<()> {
        let remote = self.remote_store.clone();
        remote.enable_network(self).await
    }

    pub async fn disable_network(&mut self) -> FirestoreResult<()> {
        let remote = self.remote_store.clone();
        remote.disable_network(self).await
    }

    /// Switches to `user`: streams restart and views reflect the new user's
    /// pending writes.
    pub async fn switch_user(&mut self, user: User) -> FirestoreResult<()> {
        let remote = self.remote_store.clone();
        remote.handle_credential_change(user, self).await
    }

    pub async fn shutdown(&mut self) {
        let remote = self.remote_store.clone();
        remote.shutdown(self).await;
        self.local_store.shutdown();
    }

    /// Reads a document from the local cache, pending writes included.
    /// `None` means the cache knows the document does not exist.
    pub fn get_document_from_local_cache(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let document = self.local_store.read_document(key)?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. Run again without reading from the cache to retrieve the document from the server.)",
            ))
        }
    }

    /// Runs `query` against the local cache without listening to it.
    pub fn get_documents_from_local_cache(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let view_change = view.apply_changes(doc_changes, false, None, false);
        Ok(view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    pub fn collect_garbage(&mut self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        self.local_store.collect_garbage(garbage_collector)
    }

    /// Folds changed documents into every view, raises the resulting
    /// snapshots and reports view membership back to the local store.
    async fn emit_new_snapshots(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // The limit window shrank; fill it from the cache.
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);

            limbo_updates.push((target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(local_view_changes_for(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes).await;
        }
        self.event_manager.on_watch_change(&snapshots);
        self.local_store.notify_local_view_changes(&local_view_changes)
    }

    async fn update_tracked_limbos(&mut self, target_id: TargetId, limbo_changes: Vec<LimboDocumentChange>) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key).await;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("SyncEngine: document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key).await;
                    }
                }
            }
        }
    }

    async fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("SyncEngine: new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions().await;
    }

    /// Starts resolution targets for queued limbo documents while slots are
    /// free.
    async fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            let target_data = TargetData::new(
                Query::document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            let remote = self.remote_store.clone();
            remote.listen(target_data, self).await;
        }
    }

    async fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        let remote = self.remote_store.clone();
        remote.unlisten(limbo_target_id, self).await;
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions().await;
    }

    /// Drops the views of `target_id`, notifying their listeners of `error`
    /// when given, and releases the limbo documents only they referenced.
    async fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<&FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = error {
                self.event_manager.on_watch_error(&query, error);
            }
        }

        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key).await;
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = self
            .mutation_callbacks
            .get_mut(&self.current_user.to_key())
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn fail_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for (_, callbacks) in std::mem::take(&mut self.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled(message)));
            }
        }
    }
}

fn local_view_changes_for(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = DocumentKeySet::new();
    let mut removed_keys = DocumentKeySet::new();
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            if change.document_change_count() > 1 {
                return Err(internal_error(
                    "Limbo resolution for a single document can contain at most one document",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error(
                        "Received a change for a limbo target document without an add",
                    ));
                }
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event)).await
    }

    async fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.remove(&target_id) {
            // The document can't be read. Treat it as deleted so the views
            // stop waiting for it.
            let key = resolution.key;
            log::debug!("SyncEngine: limbo resolution for {key} failed: {error}");
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions().await;

            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event(event).await;
        }

        log::debug!("SyncEngine: listen for target {target_id} rejected: {error}");
        self.local_store.release_target(target_id, false)?;
        self.remove_and_cleanup_target(target_id, Some(&error)).await;
        Ok(())
    }

    async fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id();
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(&changes, None).await
    }

    async fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(&changes, None).await
    }

    async fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        if user == self.current_user {
            return Ok(());
        }
        log::debug!("SyncEngine: user changed to {user}");
        self.fail_outstanding_pending_writes_callbacks(
            "'wait_for_pending_writes' is rejected due to a user change.",
        );
        let result = self.local_store.handle_user_change(user.clone())?;
        self.current_user = user;
        self.emit_new_snapshots(&result.affected_documents, None).await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::from([resolution.key.clone()]);
            }
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }

    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn last_stream_token(&mut self) -> FirestoreResult<Vec<u8>> {
        self.local_store.last_stream_token()
    }

    fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(token)
    }

    fn handle_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.event_manager.on_online_state_change(online_state);
        self.event_manager.on_watch_change(&snapshots);
    }
}
