use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

/// Total ordering over documents. Must break ties by key.
pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents kept sorted by a query comparator with O(log n) key lookup.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        } else {
            self.sorted.retain(|candidate| candidate.key() != key);
        }
        Some(existing)
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|candidate| (self.comparator)(candidate, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
