use std::sync::{Arc, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::{
    ListenOptions, ListenerId, Query, SyncEngine, ViewSnapshot, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
use crate::firestore::credentials::{CredentialsProviderArc, User};
use crate::firestore::error::{cancelled, invalid_argument, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::{
    CollectFn, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_GC_INITIAL_DELAY, DEFAULT_GC_REGULAR_DELAY,
    MINIMUM_CACHE_SIZE_BYTES,
};
use crate::firestore::local::{
    FieldIndex, IndexAutoCreationSettings, IndexSegment, LocalStore, LruGarbageCollector, LruParams,
    LruResults, LruScheduler, CACHE_SIZE_UNLIMITED,
};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, Mutation};
use crate::firestore::remote::online_state_tracker::ONLINE_STATE_TIMEOUT;
use crate::firestore::remote::{
    JsonProtoSerializer, MultiplexedConnection, NetworkLayer, RemoteStore, RemoteStoreEvent,
    RemoteStoreEventSink, StreamTransport, StreamingDatastore, StreamingDatastoreImpl,
};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;
use crate::util::subscribe::Observer;

/// Tunables for a [`FirestoreClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    /// Cache size that triggers garbage collection, or
    /// [`CACHE_SIZE_UNLIMITED`] to never collect.
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation: IndexAutoCreationSettings,
    /// Reconnect backoff shared by the watch and write streams.
    pub backoff: BackoffSettings,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
    /// How long the first connection may stay unresolved before listeners
    /// see offline snapshots.
    pub online_state_timeout: Duration,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation: IndexAutoCreationSettings::default(),
            backoff: BackoffSettings::default(),
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_regular_delay: DEFAULT_GC_REGULAR_DELAY,
            online_state_timeout: ONLINE_STATE_TIMEOUT,
        }
    }
}

impl FirestoreSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument("max_concurrent_limbo_resolutions must be positive"));
        }
        Ok(())
    }

    fn lru_params(&self) -> LruParams {
        if self.cache_size_bytes == CACHE_SIZE_UNLIMITED {
            LruParams::disabled()
        } else {
            LruParams::with_cache_size(self.cache_size_bytes)
        }
    }
}

/// Routes stream and timer events from the remote store back into the
/// engine that owns it.
struct EngineEventSink {
    engine: Weak<Mutex<SyncEngine>>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteStoreEventSink for EngineEventSink {
    async fn deliver(&self, event: RemoteStoreEvent) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let mut engine = engine.lock().await;
        let remote = engine.remote_store().clone();
        if let Err(err) = remote.handle_event(event, &mut *engine).await {
            log::error!("FirestoreClient: failed to handle remote event: {err}");
        }
    }
}

struct ClientInner {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    engine: Arc<Mutex<SyncEngine>>,
    gc_scheduler: Option<LruScheduler>,
}

/// Entry point of the offline-first client.
///
/// Every operation runs on one [`AsyncQueue`], so listens, writes and
/// remote events never interleave. Cloning the client is cheap; all clones
/// share the same cache and streams.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    /// Connects to the backend behind `transport`, multiplexing the listen
    /// and write streams over it.
    pub async fn connect(
        database_id: DatabaseId,
        transport: Arc<dyn StreamTransport>,
        credentials: CredentialsProviderArc,
        settings: FirestoreSettings,
    ) -> FirestoreResult<Self> {
        let connection = Arc::new(MultiplexedConnection::new(transport));
        let datastore = Arc::new(StreamingDatastoreImpl::new(connection));
        Self::new(database_id, datastore, credentials, settings).await
    }

    pub async fn new(
        database_id: DatabaseId,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: CredentialsProviderArc,
        settings: FirestoreSettings,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let initial_user = credentials
            .get_token()
            .await?
            .map(|token| token.user)
            .unwrap_or_else(User::unauthenticated);
        log::debug!(
            "FirestoreClient: starting for {} as {initial_user}",
            database_id.project_id()
        );

        let queue = AsyncQueue::new();
        let serializer = JsonProtoSerializer::new(database_id.clone());
        let network = NetworkLayer::new(datastore, credentials, serializer.database_name());
        let local_store = LocalStore::new(initial_user, settings.index_auto_creation);

        let engine = Arc::new_cyclic(|weak: &Weak<Mutex<SyncEngine>>| {
            let sink = Arc::new(EngineEventSink {
                engine: weak.clone(),
            });
            let remote_store = RemoteStore::new(
                network,
                serializer,
                queue.clone(),
                sink,
                settings.backoff,
                settings.online_state_timeout,
            );
            Mutex::new(SyncEngine::new(
                local_store,
                remote_store,
                settings.max_concurrent_limbo_resolutions,
            ))
        });

        let gc_scheduler = settings.lru_params().is_enabled().then(|| {
            LruScheduler::new(
                queue.clone(),
                settings.gc_initial_delay,
                settings.gc_regular_delay,
                collect_fn(Arc::downgrade(&engine), settings.lru_params()),
            )
        });

        let client = Self {
            inner: Arc::new(ClientInner {
                database_id,
                settings,
                queue,
                engine,
                gc_scheduler,
            }),
        };
        client
            .run(|engine| async move { engine.lock().await.start().await })
            .await?;
        if let Some(scheduler) = &client.inner.gc_scheduler {
            scheduler.start();
        }
        Ok(client)
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shutting_down()
    }

    /// The queue all client operations run on. Tests use it to fast-forward
    /// timers.
    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    async fn run<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce(Arc<Mutex<SyncEngine>>) -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.queue.enqueue(op(Arc::clone(&self.inner.engine))).await
    }

    /// Starts delivering snapshots of `query` to `observer`.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: Observer<ViewSnapshot>,
    ) -> FirestoreResult<ListenerId> {
        self.run(|engine| async move { engine.lock().await.listen(query, options, observer).await })
            .await
    }

    pub async fn unlisten(&self, listener_id: ListenerId) -> FirestoreResult<()> {
        self.run(|engine| async move { engine.lock().await.unlisten(listener_id).await })
            .await
    }

    /// Applies `mutations` locally as one batch and resolves once the
    /// backend acknowledged or rejected it. Listeners see the change right
    /// away.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let pending = self
            .run(|engine| async move { engine.lock().await.write(mutations).await })
            .await?;
        pending
            .await
            .map_err(|_| cancelled("The write was abandoned before the backend answered."))?
    }

    /// Resolves once every write issued so far was acknowledged or rejected.
    /// Writes issued later are not waited for.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let pending = self
            .run(|engine| async move { engine.lock().await.wait_for_pending_writes() })
            .await?;
        pending
            .await
            .map_err(|_| cancelled("'wait_for_pending_writes' was abandoned."))?
    }

    /// Reads a document from the local cache. `Ok(None)` means the cache
    /// knows the document does not exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        self.run(|engine| async move { engine.lock().await.get_document_from_local_cache(&key) })
            .await
    }

    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.run(|engine| async move { engine.lock().await.get_documents_from_local_cache(&query) })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.run(|engine| async move { engine.lock().await.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.run(|engine| async move { engine.lock().await.disable_network().await })
            .await
    }

    /// Switches the signed-in user. Streams restart with the new
    /// credentials and views show that user's pending writes.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.run(|engine| async move { engine.lock().await.switch_user(user).await })
            .await
    }

    pub async fn configure_field_index(
        &self,
        collection_group: String,
        segments: Vec<IndexSegment>,
    ) -> FirestoreResult<FieldIndex> {
        self.run(|engine| async move {
            engine
                .lock()
                .await
                .local_store_mut()
                .configure_field_index(&collection_group, segments)
        })
        .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.run(|engine| async move {
            engine
                .lock()
                .await
                .local_store_mut()
                .set_index_auto_creation_enabled(enabled);
            Ok(())
        })
        .await
    }

    /// Runs a garbage collection pass now, ignoring the schedule.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let garbage_collector = LruGarbageCollector::new(self.inner.settings.lru_params());
        self.run(|engine| async move { engine.lock().await.collect_garbage(&garbage_collector) })
            .await
    }

    /// Stops the streams and the garbage collector. Every later call fails
    /// with `FailedPrecondition`; terminating twice is a no-op.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        if let Some(scheduler) = &self.inner.gc_scheduler {
            scheduler.stop();
        }
        let engine = Arc::clone(&self.inner.engine);
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(async move {
                engine.lock().await.shutdown().await;
                log::debug!("FirestoreClient: terminated");
                Ok(())
            })
            .await
    }
}

fn collect_fn(engine: Weak<Mutex<SyncEngine>>, params: LruParams) -> CollectFn {
    let garbage_collector = Arc::new(LruGarbageCollector::new(params));
    Arc::new(move || {
        let engine = engine.clone();
        let garbage_collector = Arc::clone(&garbage_collector);
        Box::pin(async move {
            let Some(engine) = engine.upgrade() else {
                return Ok(LruResults::default());
            };
            let mut engine = engine.lock().await;
            engine.collect_garbage(&garbage_collector)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::{EmptyCredentialsProvider, StaticCredentialsProvider};
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::remote::InMemoryTransport;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    async fn offline_client(settings: FirestoreSettings) -> (FirestoreClient, Arc<InMemoryTransport>) {
        let (client_end, server_end) = InMemoryTransport::pair();
        let client = FirestoreClient::connect(
            DatabaseId::default("coffee-shop"),
            client_end,
            Arc::new(EmptyCredentialsProvider),
            settings,
        )
        .await
        .unwrap();
        client.disable_network().await.unwrap();
        (client, server_end)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn named(name: &str) -> MapValue {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string(name));
        MapValue::new(fields)
    }

    #[test]
    fn default_settings() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.cache_size_bytes, 40 * 1024 * 1024);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert!(!settings.index_auto_creation.enabled);
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.gc_initial_delay, Duration::from_secs(60));
        assert_eq!(settings.gc_regular_delay, Duration::from_secs(300));
        assert_eq!(settings.online_state_timeout, Duration::from_secs(10));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn tiny_caches_are_rejected() {
        let settings = FirestoreSettings {
            cache_size_bytes: 1024,
            ..FirestoreSettings::default()
        };
        assert_eq!(
            settings.validate().unwrap_err().code,
            FirestoreErrorCode::InvalidArgument
        );
        let unlimited = FirestoreSettings {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..FirestoreSettings::default()
        };
        assert!(unlimited.validate().is_ok());
        assert!(!unlimited.lru_params().is_enabled());
    }

    #[tokio::test]
    async fn offline_writes_are_readable_from_the_cache() {
        let (client, _server) = offline_client(FirestoreSettings::default()).await;
        let writer = client.clone();
        tokio::spawn(async move {
            let _ = writer
                .write(vec![Mutation::set(key("bases/coffee"), named("Coffee"))])
                .await;
        });
        client.queue().drain().await;
        tokio::task::yield_now().await;
        client.queue().drain().await;

        let document = client
            .get_document_from_local_cache(key("bases/coffee"))
            .await
            .unwrap()
            .unwrap();
        assert!(document.has_local_mutations());
        let snapshot = client
            .get_documents_from_local_cache(Query::collection("bases").unwrap())
            .await
            .unwrap();
        assert_eq!(snapshot.documents.len(), 1);
        assert!(snapshot.has_pending_writes());
    }

    #[tokio::test]
    async fn initial_user_comes_from_the_credentials() {
        let (client_end, _server_end) = InMemoryTransport::pair();
        let client = FirestoreClient::connect(
            DatabaseId::new("coffee-shop", "orders"),
            client_end,
            Arc::new(StaticCredentialsProvider::new(User::new("u1"), "token")),
            FirestoreSettings::default(),
        )
        .await
        .unwrap();
        let engine = Arc::clone(&client.inner.engine);
        assert_eq!(engine.lock().await.current_user(), &User::new("u1"));
        assert_eq!(client.database_id().database(), "orders");
    }

    #[tokio::test]
    async fn nothing_pending_resolves_immediately() {
        let (client, _server) = offline_client(FirestoreSettings::default()).await;
        client.wait_for_pending_writes().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_rejects_later_calls() {
        let (client, _server) = offline_client(FirestoreSettings::default()).await;
        client.terminate().await.unwrap();
        assert!(client.is_terminated());
        client.terminate().await.unwrap();

        let error = client
            .get_document_from_local_cache(key("bases/coffee"))
            .await
            .unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
        assert_eq!(error.message(), "The client has already been terminated.");
    }

    #[tokio::test]
    async fn garbage_collection_can_run_on_demand() {
        let (client, _server) = offline_client(FirestoreSettings::default()).await;
        let results = client.collect_garbage().await.unwrap();
        assert!(!results.did_run);
    }
}
