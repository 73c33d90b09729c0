mod event_manager;
mod query;
mod sync_engine;
mod target;
mod target_id_generator;
mod types;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
pub use query::{LimitType, Query};
pub use sync_engine::{PendingWrite, SyncEngine, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
pub use target::{
    key_reference, Bound, CompositeOperator, Direction, FieldFilter, Filter, FilterOperator,
    OrderBy, Target,
};
pub use target_id_generator::TargetIdGenerator;
pub use types::{ListenSequenceNumber, OnlineState, SyncState, TargetId, INVALID_SEQUENCE_NUMBER};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
