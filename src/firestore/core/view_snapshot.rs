use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Accumulates per-key view changes, folding successive changes to the
/// same document into the one that describes the net effect.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(DocumentViewChange {
                change_type: new_type,
                document: change.document,
            }),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                log::error!(
                    "DocumentChangeSet: unsupported combination {:?} followed by {:?} for {}",
                    old_type,
                    new_type,
                    key
                );
                Some(change)
            }
        };

        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Immutable result delivered to a query listener.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// First snapshot for a listener: every document shows up as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_documents = DocumentSet::new(documents.comparator().clone());
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn change(change_type: ChangeType, version: i64) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document: MutableDocument::new_found_document(
                DocumentKey::from_string("c/a").unwrap(),
                SnapshotVersion::new(Timestamp::new(version, 0)),
                MapValue::empty(),
            ),
        }
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, 1));
        set.track(change(ChangeType::Removed, 2));
        assert!(set.is_empty());
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, 1));
        set.track(change(ChangeType::Added, 2));
        let changes = set.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(
            changes[0].document.version(),
            SnapshotVersion::new(Timestamp::new(2, 0))
        );
    }

    #[test]
    fn metadata_after_added_keeps_added_with_new_document() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, 1));
        set.track(change(ChangeType::Metadata, 3));
        let changes = set.into_changes();
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(
            changes[0].document.version(),
            SnapshotVersion::new(Timestamp::new(3, 0))
        );
    }
}
