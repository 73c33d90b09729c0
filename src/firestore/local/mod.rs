mod bundle_cache;
mod document_overlay_cache;
mod index_manager;
mod local_documents_view;
mod local_store;
pub mod lru_garbage_collector;
mod mutation_queue;
mod persistence;
pub mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;

pub use bundle_cache::{BundleMetadata, MemoryBundleCache, NamedQuery};
pub use document_overlay_cache::MemoryDocumentOverlayCache;
pub use index_manager::{FieldIndex, IndexSegment, IndexType, MemoryIndexManager, SegmentKind};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use lru_garbage_collector::{
    LruGarbageCollector, LruParams, LruResults, LruScheduler, MemoryLruDelegate, CACHE_SIZE_UNLIMITED,
};
pub use mutation_queue::MemoryMutationQueue;
pub use persistence::{
    ListenSequence, MemoryPersistence, PersistenceState, PersistenceTransaction, TransactionMode,
    UserComponents,
};
pub use query_engine::{IndexAutoCreationSettings, QueryEngine, QueryStrategy};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::{MemoryTargetCache, TargetData, TargetPurpose};
