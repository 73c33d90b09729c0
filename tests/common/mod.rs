//! In-process backend speaking the Listen and Write protocols over an
//! [`InMemoryTransport`], plus helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value as JsonValue;

use firestore_offline_sync::firestore::client::{FirestoreClient, FirestoreSettings};
use firestore_offline_sync::firestore::core::{TargetId, Target, ViewSnapshot};
use firestore_offline_sync::firestore::credentials::{
    CredentialsProviderArc, EmptyCredentialsProvider, StaticCredentialsProvider, User,
};
use firestore_offline_sync::firestore::error::FirestoreError;
use firestore_offline_sync::firestore::model::{
    DatabaseId, DocumentKey, MutableDocument, MutationResult, SnapshotVersion, Timestamp,
};
use firestore_offline_sync::firestore::remote::streams::{
    decode_listen_request, decode_write_request, encode_write_response, ListenRequest, WriteResponse,
};
use firestore_offline_sync::firestore::remote::{
    encode_watch_change, DocumentWatchChange, InMemoryTransport, JsonProtoSerializer,
    MultiplexedConnection, MultiplexedStream, WatchChange, WatchTargetChange, WatchTargetChangeState,
    LISTEN_METHOD, WRITE_METHOD,
};
use firestore_offline_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_offline_sync::util::subscribe::Observer;

pub const PROJECT: &str = "coffee-shop";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn version(value: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(value, 0))
}

struct ListenStream {
    id: u64,
    stream: Arc<MultiplexedStream>,
    targets: BTreeMap<TargetId, Target>,
}

#[derive(Default)]
struct BackendState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    version: i64,
    listens: Vec<ListenStream>,
    next_listen_id: u64,
    write_rejections: Vec<FirestoreError>,
    commits: usize,
}

impl BackendState {
    fn next_version(&mut self) -> SnapshotVersion {
        self.version += 1;
        version(self.version)
    }
}

fn target_matches(target: &Target, document: &MutableDocument) -> bool {
    if !document.is_found_document() {
        return false;
    }
    if target.is_document_target() {
        return document.key().path() == &target.path;
    }
    let in_collection = match &target.collection_group {
        Some(group) => document.key().collection_path().last_segment() == Some(group.as_str()),
        None => document.key().collection_path() == target.path,
    };
    in_collection && target.filters.iter().all(|filter| filter.matches(document))
}

/// Document store answering listen and write streams of any number of
/// connected clients.
pub struct FakeBackend {
    serializer: JsonProtoSerializer,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            serializer: JsonProtoSerializer::new(DatabaseId::default(PROJECT)),
            state: Mutex::new(BackendState {
                version: 1,
                ..BackendState::default()
            }),
        })
    }

    /// Stores a document without notifying listeners.
    pub fn seed(&self, path: &str, data: MapValue) {
        let key = DocumentKey::from_string(path).unwrap();
        let mut state = lock(&self.state);
        let version = state.next_version();
        state
            .documents
            .insert(key.clone(), MutableDocument::new_found_document(key, version, data));
    }

    pub fn document(&self, path: &str) -> Option<MutableDocument> {
        let key = DocumentKey::from_string(path).unwrap();
        lock(&self.state).documents.get(&key).cloned()
    }

    pub fn documents_in(&self, collection: &str) -> Vec<MutableDocument> {
        lock(&self.state)
            .documents
            .values()
            .filter(|document| document.key().collection_path().canonical_string() == collection)
            .cloned()
            .collect()
    }

    /// The next write request fails its stream with `error`.
    pub fn reject_next_write(&self, error: FirestoreError) {
        lock(&self.state).write_rejections.push(error);
    }

    pub fn commit_count(&self) -> usize {
        lock(&self.state).commits
    }

    /// Opens a connection for a new client and serves its streams.
    pub fn transport(self: &Arc<Self>) -> Arc<InMemoryTransport> {
        let (client_end, server_end) = InMemoryTransport::pair();
        let connection = MultiplexedConnection::new(server_end);
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(stream) = connection.accept_stream().await {
                let backend = Arc::clone(&backend);
                if stream.method() == LISTEN_METHOD {
                    tokio::spawn(backend.serve_listen(Arc::new(stream)));
                } else if stream.method() == WRITE_METHOD {
                    tokio::spawn(backend.serve_write(stream));
                }
            }
        });
        client_end
    }

    async fn send(&self, stream: &MultiplexedStream, changes: Vec<WatchChange>) {
        for change in changes {
            let payload = encode_watch_change(&self.serializer, &change);
            if stream.send(payload.to_string().into_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn serve_listen(self: Arc<Self>, stream: Arc<MultiplexedStream>) {
        let listen_id = {
            let mut state = lock(&self.state);
            let id = state.next_listen_id;
            state.next_listen_id += 1;
            state.listens.push(ListenStream {
                id,
                stream: Arc::clone(&stream),
                targets: BTreeMap::new(),
            });
            id
        };

        while let Some(Ok(payload)) = stream.next().await {
            let Ok(value) = serde_json::from_slice::<JsonValue>(&payload) else {
                continue;
            };
            match decode_listen_request(&self.serializer, &value) {
                Ok(ListenRequest::AddTarget { target_id, target, .. }) => {
                    let (documents, read_time) = {
                        let mut state = lock(&self.state);
                        let documents: Vec<MutableDocument> = state
                            .documents
                            .values()
                            .filter(|document| target_matches(&target, document))
                            .cloned()
                            .collect();
                        if let Some(listen) = state.listens.iter_mut().find(|listen| listen.id == listen_id) {
                            listen.targets.insert(target_id, target);
                        }
                        (documents, version(state.version))
                    };
                    let mut changes = vec![WatchChange::TargetChange(WatchTargetChange::new(
                        WatchTargetChangeState::Added,
                        vec![target_id],
                    ))];
                    changes.extend(documents.into_iter().map(|document| {
                        WatchChange::Document(DocumentWatchChange {
                            updated_target_ids: vec![target_id],
                            removed_target_ids: Vec::new(),
                            key: document.key().clone(),
                            new_document: Some(document),
                        })
                    }));
                    changes.push(WatchChange::TargetChange(
                        WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                            .with_resume_token(format!("resume-{}", read_time.timestamp().seconds).into_bytes()),
                    ));
                    changes.push(global_snapshot(read_time));
                    self.send(&stream, changes).await;
                }
                Ok(ListenRequest::RemoveTarget(target_id)) => {
                    {
                        let mut state = lock(&self.state);
                        if let Some(listen) = state.listens.iter_mut().find(|listen| listen.id == listen_id) {
                            listen.targets.remove(&target_id);
                        }
                    }
                    let change = WatchChange::TargetChange(WatchTargetChange::new(
                        WatchTargetChangeState::Removed,
                        vec![target_id],
                    ));
                    self.send(&stream, vec![change]).await;
                }
                Err(_) => {}
            }
        }

        lock(&self.state).listens.retain(|listen| listen.id != listen_id);
    }

    async fn serve_write(self: Arc<Self>, stream: MultiplexedStream) {
        let mut token_counter = 0u32;
        while let Some(Ok(payload)) = stream.next().await {
            let Ok(value) = serde_json::from_slice::<JsonValue>(&payload) else {
                continue;
            };
            let Ok(request) = decode_write_request(&self.serializer, &value) else {
                continue;
            };
            token_counter += 1;
            let stream_token = format!("write-token-{token_counter}").into_bytes();

            if request.is_handshake() {
                let response = WriteResponse {
                    stream_token,
                    commit_version: SnapshotVersion::min(),
                    mutation_results: Vec::new(),
                };
                let payload = encode_write_response(&self.serializer, &response);
                let _ = stream.send(payload.to_string().into_bytes()).await;
                continue;
            }

            let rejection = {
                let mut state = lock(&self.state);
                (!state.write_rejections.is_empty()).then(|| state.write_rejections.remove(0))
            };
            if let Some(error) = rejection {
                let _ = stream.fail(error).await;
                return;
            }

            let (commit_version, updates, notifications) = self.commit(&request.writes);
            let response = WriteResponse {
                stream_token,
                commit_version,
                mutation_results: updates
                    .iter()
                    .map(|_| MutationResult {
                        version: commit_version,
                        transform_results: Vec::new(),
                    })
                    .collect(),
            };
            let payload = encode_write_response(&self.serializer, &response);
            let _ = stream.send(payload.to_string().into_bytes()).await;

            for (listen_stream, changes) in notifications {
                self.send(&listen_stream, changes).await;
            }
        }
    }

    /// Applies set and delete writes at a new version and computes the watch
    /// changes each listen stream must see.
    #[allow(clippy::type_complexity)]
    fn commit(
        &self,
        writes: &[JsonValue],
    ) -> (SnapshotVersion, Vec<DocumentKey>, Vec<(Arc<MultiplexedStream>, Vec<WatchChange>)>) {
        let mut state = lock(&self.state);
        let commit_version = state.next_version();
        state.commits += 1;

        let mut updated = Vec::new();
        let mut changed: Vec<(Option<MutableDocument>, MutableDocument)> = Vec::new();
        for write in writes {
            let after = if let Some(update) = write.get("update") {
                let mut update = update.clone();
                if let Some(object) = update.as_object_mut() {
                    object.insert("updateTime".into(), self.serializer.encode_version(commit_version));
                }
                match self.serializer.decode_document(&update) {
                    Ok(document) => document,
                    Err(_) => continue,
                }
            } else if let Some(name) = write.get("delete").and_then(JsonValue::as_str) {
                match self.serializer.document_key_from_name(name) {
                    Ok(key) => MutableDocument::new_no_document(key, commit_version),
                    Err(_) => continue,
                }
            } else {
                continue;
            };
            let key = after.key().clone();
            let before = if after.is_found_document() {
                state.documents.insert(key.clone(), after.clone())
            } else {
                state.documents.remove(&key)
            };
            updated.push(key);
            changed.push((before, after));
        }

        let mut notifications = Vec::new();
        for listen in &state.listens {
            let mut changes = Vec::new();
            for (before, after) in &changed {
                let updated_target_ids: Vec<TargetId> = listen
                    .targets
                    .iter()
                    .filter(|(_, target)| target_matches(target, after))
                    .map(|(target_id, _)| *target_id)
                    .collect();
                let removed_target_ids: Vec<TargetId> = listen
                    .targets
                    .iter()
                    .filter(|(target_id, target)| {
                        before.as_ref().is_some_and(|before| target_matches(target, before))
                            && !updated_target_ids.contains(target_id)
                    })
                    .map(|(target_id, _)| *target_id)
                    .collect();
                if updated_target_ids.is_empty() && removed_target_ids.is_empty() {
                    continue;
                }
                changes.push(WatchChange::Document(DocumentWatchChange {
                    updated_target_ids,
                    removed_target_ids,
                    key: after.key().clone(),
                    new_document: Some(after.clone()),
                }));
            }
            changes.push(global_snapshot(commit_version));
            notifications.push((Arc::clone(&listen.stream), changes));
        }
        (commit_version, updated, notifications)
    }
}

fn global_snapshot(read_time: SnapshotVersion) -> WatchChange {
    WatchChange::TargetChange(
        WatchTargetChange::new(WatchTargetChangeState::NoChange, Vec::new()).with_read_time(read_time),
    )
}

pub fn fields(entries: &[(&str, &str)]) -> MapValue {
    MapValue::new(
        entries
            .iter()
            .map(|(field, value)| (field.to_string(), FirestoreValue::from_string(*value)))
            .collect(),
    )
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn fast_settings() -> FirestoreSettings {
    let mut settings = FirestoreSettings::default();
    settings.backoff.initial_delay = Duration::from_millis(10);
    settings.backoff.max_delay = Duration::from_millis(50);
    settings
}

pub async fn client_for(backend: &Arc<FakeBackend>, user: Option<User>) -> FirestoreClient {
    let credentials: CredentialsProviderArc = match user {
        Some(user) => Arc::new(StaticCredentialsProvider::new(user, "test-token")),
        None => Arc::new(EmptyCredentialsProvider),
    };
    FirestoreClient::connect(
        DatabaseId::default(PROJECT),
        backend.transport(),
        credentials,
        fast_settings(),
    )
    .await
    .unwrap()
}

/// Collects every snapshot and error an observer receives.
#[derive(Clone, Default)]
pub struct Recorder {
    pub snapshots: Arc<Mutex<Vec<ViewSnapshot>>>,
    pub errors: Arc<Mutex<Vec<FirestoreError>>>,
}

impl Recorder {
    pub fn observer(&self) -> Observer<ViewSnapshot> {
        let snapshots = Arc::clone(&self.snapshots);
        let errors = Arc::clone(&self.errors);
        Observer::new(move |snapshot: &ViewSnapshot| lock(&snapshots).push(snapshot.clone()))
            .with_error(move |error| lock(&errors).push(error.clone()))
    }

    pub fn last(&self) -> Option<ViewSnapshot> {
        lock(&self.snapshots).last().cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn errors(&self) -> Vec<FirestoreError> {
        lock(&self.errors).clone()
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
