mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

use std::collections::{BTreeMap, BTreeSet};

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::{calculate_overlay_mutation, Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type DocumentMap = BTreeMap<DocumentKey, Document>;
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;
