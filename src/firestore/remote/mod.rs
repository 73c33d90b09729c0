pub mod bloom_filter;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{StreamHandle, StreamingDatastore, StreamingDatastoreImpl, LISTEN_METHOD, WRITE_METHOD};
pub use network::NetworkLayer;
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, MAX_PENDING_WRITES};
pub use remote_syncer::{RemoteStoreEvent, RemoteStoreEventSink, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamEvent, StreamKind,
    StreamTransport,
};
pub use watch_change::{
    decode_watch_change, encode_watch_change, DocumentWatchChange, ExistenceFilter,
    ExistenceFilterChange, WatchChange, WatchTargetChange, WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
