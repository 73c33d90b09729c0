use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;

use crate::firestore::core::{OnlineState, TargetId};
use crate::firestore::credentials::User;
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::TargetData;
use crate::firestore::model::{DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::{RemoteStoreEvent, RemoteStoreEventSink, RemoteSyncer};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{StreamEvent, StreamKind};
use crate::firestore::remote::streams::{WatchStream, WriteStream};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;

/// Batches sent to the backend before an acknowledgement is required.
/// One keeps acks in batch order and the stream token linear.
pub const MAX_PENDING_WRITES: usize = 1;

/// Reasons the remote store keeps the network disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

/// Lets the aggregator see the listen targets and the syncer's remote keys.
struct TargetMetadataView<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for TargetMetadataView<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn target_data_for_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

struct RemoteStoreState {
    /// Targets the client wants to listen to, whether or not the watch
    /// stream is currently connected.
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    online_state_tracker: OnlineStateTracker,
    /// Batches sent (or about to be sent) and not yet acknowledged.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    /// Last online state change, raised once the lock is released.
    online_state_change: Option<OnlineState>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn note_online_state(&mut self, change: Option<OnlineState>) {
        if change.is_some() {
            self.online_state_change = change;
        }
    }

    fn start_watch_stream(&mut self, serializer: &JsonProtoSerializer) {
        debug_assert!(self.should_start_watch_stream());
        self.watch_change_aggregator = Some(WatchChangeAggregator::new(serializer.clone()));
        self.watch_stream.start();
        let change = self.online_state_tracker.handle_watch_stream_start();
        self.note_online_state(change);
    }

    async fn send_watch_request(&mut self, target_data: &TargetData, syncer: &dyn RemoteSyncer) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        let mut request = target_data.clone();
        if !request.resume_token.is_empty() || !request.snapshot_version.is_min() {
            let expected_count = syncer.get_remote_keys_for_target(request.target_id).len();
            request = request.with_expected_count(expected_count as i32);
        }
        if let Err(err) = self.watch_stream.watch(&request).await {
            log::debug!("RemoteStore: failed to send watch for target {}: {err}", request.target_id);
        }
    }

    async fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = self.watch_stream.unwatch(target_id).await {
            log::debug!("RemoteStore: failed to send unwatch for target {target_id}: {err}");
        }
    }

    async fn disable_network_internal(&mut self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "RemoteStore: stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.watch_change_aggregator = None;
    }

    async fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        let send = self.write_stream.is_open() && self.write_stream.handshake_complete();
        if send {
            if let Err(err) = self.write_stream.write_mutations(batch.mutations()).await {
                log::debug!("RemoteStore: failed to send batch {}: {err}", batch.batch_id());
            }
        }
        self.write_pipeline.push_back(batch);
    }

    /// Pulls queued batches until the pipeline is full and makes sure the
    /// write stream runs when there is work.
    async fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(MutationBatch::batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id());
                    self.add_to_write_pipeline(batch).await;
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    /// Starts the watch stream if targets are waiting, otherwise reports
    /// the connection state as undetermined.
    async fn enable_network_internal(&mut self, serializer: &JsonProtoSerializer, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(serializer);
        } else {
            let change = self.online_state_tracker.set(OnlineState::Unknown);
            self.note_online_state(change);
        }
        self.fill_write_pipeline(syncer).await
    }
}

/// Connects the local views to the backend through a watch stream and a
/// write stream.
///
/// Every operation takes the [`RemoteSyncer`] it reports to. The store's
/// own lock is released before any asynchronous syncer callback runs, so
/// the syncer may call back into the store.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    serializer: JsonProtoSerializer,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        network: NetworkLayer,
        serializer: JsonProtoSerializer,
        queue: AsyncQueue,
        sink: Arc<dyn RemoteStoreEventSink>,
        backoff: BackoffSettings,
        online_state_timeout: Duration,
    ) -> Self {
        let state = RemoteStoreState {
            listen_targets: BTreeMap::new(),
            watch_stream: WatchStream::new(
                network.clone(),
                queue.clone(),
                Arc::clone(&sink),
                backoff.clone(),
                serializer.clone(),
            ),
            write_stream: WriteStream::new(
                network,
                queue.clone(),
                Arc::clone(&sink),
                backoff,
                serializer.clone(),
            ),
            watch_change_aggregator: None,
            online_state_tracker: OnlineStateTracker::new(queue, sink, online_state_timeout),
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
            online_state_change: None,
        };
        Self {
            inner: Arc::new(RemoteStoreInner {
                serializer,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.inner.serializer
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state_tracker.state()
    }

    /// Number of batches waiting for an acknowledgement.
    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }

    pub async fn start(&self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let stream_token = syncer.last_stream_token()?;
        let result = {
            let mut state = self.inner.state.lock().await;
            state.write_stream.set_last_stream_token(stream_token);
            state.enable_network_internal(&self.inner.serializer, syncer).await
        };
        self.raise_online_state(syncer).await;
        result
    }

    pub async fn enable_network(&self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let result = {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
            state.enable_network_internal(&self.inner.serializer, syncer).await
        };
        self.raise_online_state(syncer).await;
        result
    }

    /// Stops both streams until [`enable_network`](Self::enable_network).
    /// Listeners see `Offline`.
    pub async fn disable_network(&self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            state.disable_network_internal().await;
            let change = state.online_state_tracker.set(OnlineState::Offline);
            state.note_online_state(change);
        }
        self.raise_online_state(syncer).await;
        Ok(())
    }

    pub async fn shutdown(&self, syncer: &mut dyn RemoteSyncer) {
        log::debug!("RemoteStore: shutting down");
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            state.disable_network_internal().await;
            let change = state.online_state_tracker.set(OnlineState::Unknown);
            state.note_online_state(change);
        }
        self.raise_online_state(syncer).await;
    }

    /// Restarts both streams as `user`. Pending writes are re-read from the
    /// new user's queue.
    pub async fn handle_credential_change(
        &self,
        user: User,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        log::debug!("RemoteStore: switching to user {user}");
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::CredentialChange);
            state.disable_network_internal().await;
            let change = state.online_state_tracker.set(OnlineState::Unknown);
            state.note_online_state(change);
        }
        self.raise_online_state(syncer).await;

        let switched = syncer.handle_credential_change(user).await;

        let result = {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
            state.enable_network_internal(&self.inner.serializer, syncer).await
        };
        self.raise_online_state(syncer).await;
        switched.and(result)
    }

    /// Starts listening to a target. Listening to a target twice is a
    /// no-op.
    pub async fn listen(&self, target_data: TargetData, syncer: &mut dyn RemoteSyncer) {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.listen_targets.contains_key(&target_data.target_id) {
                return;
            }
            state
                .listen_targets
                .insert(target_data.target_id, target_data.clone());
            if state.should_start_watch_stream() {
                state.start_watch_stream(&self.inner.serializer);
            } else if state.watch_stream.is_open() {
                state.send_watch_request(&target_data, &*syncer).await;
            }
        }
        self.raise_online_state(syncer).await;
    }

    pub async fn unlisten(&self, target_id: TargetId, syncer: &mut dyn RemoteSyncer) {
        {
            let mut state = self.inner.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                log::debug!("RemoteStore: unlisten of unknown target {target_id}");
                return;
            }
            if state.watch_stream.is_open() {
                state.send_unwatch_request(target_id).await;
            }
            if state.listen_targets.is_empty() {
                if state.watch_stream.is_open() {
                    state.watch_stream.mark_idle();
                } else if state.can_use_network() {
                    // Nothing is listened to, so the connection state is
                    // no longer known.
                    let change = state.online_state_tracker.set(OnlineState::Unknown);
                    state.note_online_state(change);
                }
            }
        }
        self.raise_online_state(syncer).await;
    }

    /// Pulls newly queued batches into the write pipeline.
    pub async fn fill_write_pipeline(&self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.fill_write_pipeline(syncer).await
    }

    /// Entry point for stream and timer events routed through the
    /// [`RemoteStoreEventSink`].
    pub async fn handle_event(
        &self,
        event: RemoteStoreEvent,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let result = match event {
            RemoteStoreEvent::OnlineStateTimeout => {
                let mut state = self.inner.state.lock().await;
                let change = state.online_state_tracker.handle_timeout();
                state.note_online_state(change);
                Ok(())
            }
            RemoteStoreEvent::Stream {
                kind: StreamKind::Listen,
                generation,
                event,
            } => self.handle_watch_event(generation, event, syncer).await,
            RemoteStoreEvent::Stream {
                kind: StreamKind::Write,
                generation,
                event,
            } => self.handle_write_event(generation, event, syncer).await,
        };
        self.raise_online_state(syncer).await;
        result
    }

    async fn raise_online_state(&self, syncer: &mut dyn RemoteSyncer) {
        let change = self.inner.state.lock().await.online_state_change.take();
        if let Some(online_state) = change {
            log::debug!("RemoteStore: online state is now {online_state:?}");
            syncer.handle_online_state_change(online_state);
        }
    }

    async fn handle_watch_event(
        &self,
        generation: u64,
        event: StreamEvent,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.watch_stream.stream().generation() != generation {
            drop(guard);
            close_stale(event).await;
            return Ok(());
        }

        match event {
            StreamEvent::Opened(handle) => {
                state.watch_stream.stream_mut().handle_open(handle);
                let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
                for target_data in &targets {
                    state.send_watch_request(target_data, &*syncer).await;
                }
                Ok(())
            }
            StreamEvent::Message(payload) => {
                state.watch_stream.stream_mut().handle_message();
                let change = state.online_state_tracker.set(OnlineState::Online);
                state.note_online_state(change);
                let change = match state.watch_stream.decode_message(&payload) {
                    Ok(change) => change,
                    Err(err) => {
                        log::warn!("RemoteStore: dropping undecodable listen response: {err}");
                        return Ok(());
                    }
                };
                drop(guard);
                self.on_watch_change(change, syncer).await
            }
            StreamEvent::Closed(error) => {
                state.watch_stream.stream_mut().handle_close(error.as_ref()).await;
                state.watch_change_aggregator = None;
                if state.should_start_watch_stream() {
                    let change = state.online_state_tracker.handle_watch_stream_failure();
                    state.note_online_state(change);
                    state.start_watch_stream(&self.inner.serializer);
                } else {
                    let change = state.online_state_tracker.set(OnlineState::Unknown);
                    state.note_online_state(change);
                }
                Ok(())
            }
            StreamEvent::BackoffElapsed => {
                state.watch_stream.stream_mut().handle_backoff_elapsed();
                Ok(())
            }
            StreamEvent::IdleTimeout => {
                if state.watch_stream.stream_mut().handle_idle_timeout().await {
                    state.watch_change_aggregator = None;
                    let change = state.online_state_tracker.set(OnlineState::Unknown);
                    state.note_online_state(change);
                }
                Ok(())
            }
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    return self
                        .handle_target_error(&target_change.target_ids, cause.clone(), syncer)
                        .await;
                }
            }
        }

        let consistent_version = match &change {
            WatchChange::TargetChange(target_change) => target_change.consistent_snapshot_version(),
            _ => None,
        };

        let remote_event = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = TargetMetadataView {
                listen_targets: &state.listen_targets,
                syncer: &*syncer,
            };
            match &change {
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(target_change, &metadata)
                }
                WatchChange::Document(document_change) => {
                    aggregator.handle_document_change(document_change, &metadata)
                }
                WatchChange::ExistenceFilter(filter) => {
                    aggregator.handle_existence_filter(filter, &metadata)
                }
            }

            match consistent_version {
                Some(version) if version >= syncer.last_remote_snapshot_version() => {
                    Some(self.create_watch_snapshot(state, version, &*syncer).await)
                }
                _ => None,
            }
        };

        match remote_event {
            Some(event) => {
                self.raise_online_state(syncer).await;
                syncer.apply_remote_event(event).await
            }
            None => Ok(()),
        }
    }

    /// Drains the aggregator at a consistent point, records new resume
    /// tokens and re-listens to targets that failed an existence filter.
    async fn create_watch_snapshot(
        &self,
        state: &mut RemoteStoreState,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
    ) -> RemoteEvent {
        let remote_event = match state.watch_change_aggregator.as_mut() {
            Some(aggregator) => {
                let metadata = TargetMetadataView {
                    listen_targets: &state.listen_targets,
                    syncer,
                };
                aggregator.create_remote_event(snapshot_version, &metadata)
            }
            None => RemoteEvent {
                snapshot_version,
                ..RemoteEvent::default()
            },
        };

        for (target_id, change) in &remote_event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                *target_data = target_data
                    .clone()
                    .with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &remote_event.target_mismatches {
            let Some(target_data) = state.listen_targets.get_mut(target_id) else {
                continue;
            };
            // Drop the resume token so the re-listen gets a full result set.
            let snapshot = target_data.snapshot_version;
            *target_data = target_data.clone().with_resume_token(Vec::new(), snapshot);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            state.send_unwatch_request(*target_id).await;
            state.send_watch_request(&request, syncer).await;
        }

        remote_event
    }

    /// The backend removed targets with an error. They are dropped here and
    /// reported to the syncer.
    async fn handle_target_error(
        &self,
        target_ids: &[TargetId],
        cause: FirestoreError,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let rejected: Vec<TargetId> = {
            let mut state = self.inner.state.lock().await;
            let mut rejected = Vec::new();
            for target_id in target_ids {
                if state.listen_targets.remove(target_id).is_some() {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                    rejected.push(*target_id);
                }
            }
            rejected
        };
        self.raise_online_state(syncer).await;
        for target_id in rejected {
            log::debug!("RemoteStore: target {target_id} rejected: {cause}");
            syncer.reject_listen(target_id, cause.clone()).await?;
        }
        Ok(())
    }

    async fn handle_write_event(
        &self,
        generation: u64,
        event: StreamEvent,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.write_stream.stream().generation() != generation {
            drop(guard);
            close_stale(event).await;
            return Ok(());
        }

        match event {
            StreamEvent::Opened(handle) => {
                state.write_stream.stream_mut().handle_open(handle);
                state.write_stream.write_handshake().await
            }
            StreamEvent::Message(payload) => {
                let was_handshake = !state.write_stream.handshake_complete();
                let response = match state.write_stream.handle_response(&payload) {
                    Ok(response) => response,
                    Err(err) => {
                        log::warn!("RemoteStore: dropping undecodable write response: {err}");
                        return Ok(());
                    }
                };
                if was_handshake {
                    syncer.set_last_stream_token(response.stream_token)?;
                    let batches: Vec<MutationBatch> = state.write_pipeline.iter().cloned().collect();
                    for batch in &batches {
                        state.write_stream.write_mutations(batch.mutations()).await?;
                    }
                    return Ok(());
                }

                let batch = state
                    .write_pipeline
                    .pop_front()
                    .ok_or_else(|| internal_error("write response without a pending batch"))?;
                let result = MutationBatchResult::new(
                    batch,
                    response.commit_version,
                    response.mutation_results,
                    response.stream_token,
                )?;
                drop(guard);
                self.raise_online_state(syncer).await;
                syncer.apply_successful_write(result).await?;
                self.fill_write_pipeline(syncer).await
            }
            StreamEvent::Closed(error) => {
                let handshake_complete = state.write_stream.handle_close(error.as_ref()).await;
                if let Some(error) = error {
                    if handshake_complete {
                        if !state.write_pipeline.is_empty() && is_permanent_write_error(error.code) {
                            // This batch can never succeed. Drop it and move on
                            // without waiting out a backoff.
                            let batch = state.write_pipeline.pop_front();
                            state.write_stream.inhibit_backoff();
                            drop(guard);
                            if let Some(batch) = batch {
                                log::debug!(
                                    "RemoteStore: batch {} rejected: {error}",
                                    batch.batch_id()
                                );
                                syncer.reject_failed_write(batch.batch_id(), error).await?;
                            }
                            return self.fill_write_pipeline(syncer).await;
                        }
                    } else if !state.write_pipeline.is_empty() && is_permanent_error(error.code) {
                        log::debug!(
                            "RemoteStore: write stream handshake failed, resetting stream token: {error}"
                        );
                        state.write_stream.set_last_stream_token(Vec::new());
                        syncer.set_last_stream_token(Vec::new())?;
                    }
                }
                if state.should_start_write_stream() {
                    state.write_stream.start();
                }
                Ok(())
            }
            StreamEvent::BackoffElapsed => {
                state.write_stream.stream_mut().handle_backoff_elapsed();
                Ok(())
            }
            StreamEvent::IdleTimeout => {
                state.write_stream.stream_mut().handle_idle_timeout().await;
                Ok(())
            }
        }
    }
}

/// Closes a connection that was superseded while it was opening.
async fn close_stale(event: StreamEvent) {
    if let StreamEvent::Opened(handle) = event {
        if let Err(err) = handle.close().await {
            log::debug!("RemoteStore: closing stale stream failed: {err}");
        }
    }
}
