use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion,
};
use crate::firestore::value::value_util::estimate_map_byte_size;

#[derive(Clone, Debug)]
struct CacheEntry {
    document: MutableDocument,
    size: usize,
}

/// Last known server state of every cached document, keyed by path so
/// collection scans are range lookups.
#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: BTreeMap<DocumentKey, CacheEntry>,
    size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `document`. Callers decide whether the update is newer; the
    /// cache itself just overwrites.
    pub fn add_entry(&mut self, document: MutableDocument) {
        let size = document_size(&document);
        let key = document.key().clone();
        if let Some(previous) = self.documents.insert(key, CacheEntry { document, size }) {
            self.size -= previous.size;
        }
        self.size += size;
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let entry = self.documents.remove(key)?;
        self.size -= entry.size;
        Some(entry.document)
    }

    /// Cached document, or an invalid placeholder when the key is unknown.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> MutableDocumentMap {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    /// Documents under the query's collection that were read after
    /// `since_read_time` and either match the query or carry an overlay.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &DocumentKeySet,
    ) -> MutableDocumentMap {
        let collection = query.path();
        let mut results = MutableDocumentMap::new();
        for (key, entry) in self.documents.iter() {
            if !collection.is_prefix_of(key.path()) {
                continue;
            }
            if collection.len() + 1 != key.path().len() {
                // Documents in subcollections never match a collection query.
                continue;
            }
            let document = &entry.document;
            if document.read_time() <= since_read_time && !mutated_keys.contains(key) {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    pub fn documents(&self) -> impl Iterator<Item = &MutableDocument> {
        self.documents.values().map(|entry| &entry.document)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Estimated bytes held by cached documents.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn document_size(document: &MutableDocument) -> usize {
    document.key().path().canonical_string().len() + estimate_map_byte_size(document.data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn found(path: &str, seconds: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("Coffee"));
        let version = SnapshotVersion::new(Timestamp::new(seconds, 0));
        let mut document = MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version,
            MapValue::new(fields),
        );
        document.set_read_time(version);
        document
    }

    #[test]
    fn unknown_keys_read_as_invalid_documents() {
        let cache = MemoryRemoteDocumentCache::new();
        let document = cache.get_entry(&DocumentKey::from_string("bases/x").unwrap());
        assert!(!document.is_valid_document());
    }

    #[test]
    fn size_tracks_adds_and_removes() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(found("bases/a", 1));
        let one = cache.size();
        assert!(one > 0);
        cache.add_entry(found("bases/a", 2));
        assert_eq!(cache.size(), one);
        cache.remove_entry(&DocumentKey::from_string("bases/a").unwrap());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn collection_scan_skips_subcollections_and_old_reads() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(found("bases/a", 1));
        cache.add_entry(found("bases/b", 5));
        cache.add_entry(found("bases/a/notes/n", 5));
        cache.add_entry(found("syrups/s", 5));

        let query = Query::collection("bases").unwrap();
        let all = cache.get_documents_matching_query(&query, SnapshotVersion::min(), &DocumentKeySet::new());
        assert_eq!(all.len(), 2);

        let since = SnapshotVersion::new(Timestamp::new(3, 0));
        let recent = cache.get_documents_matching_query(&query, since, &DocumentKeySet::new());
        assert_eq!(recent.len(), 1);
    }
}
