use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::model::SnapshotVersion;

#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// A query saved by name from a loaded bundle, along with the time its
/// results were read.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bundle_metadata(&self, bundle_id: &str) -> Option<&BundleMetadata> {
        self.bundles.get(bundle_id)
    }

    pub fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles.insert(metadata.id.clone(), metadata);
    }

    pub fn get_named_query(&self, name: &str) -> Option<&NamedQuery> {
        self.named_queries.get(name)
    }

    pub fn save_named_query(&mut self, query: NamedQuery) {
        self.named_queries.insert(query.name.clone(), query);
    }
}
