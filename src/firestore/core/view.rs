use std::cmp::Ordering;

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
use crate::firestore::core::{LimitType, OnlineState, Query, SyncState};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet,
};
use crate::firestore::remote::TargetChange;
use crate::firestore::value::value_util::maps_equal;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Intermediate result of folding document changes into a view, before
/// the view commits to them.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit window lost a document that the local cache may be able
    /// to replace; the caller should re-run the local query.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side materialization of one query's results.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn compute_doc_changes(
        &self,
        changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if !maps_equal(old_doc.data(), new_doc.data()) {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_in_limit.as_ref().is_some_and(|last| {
                                (self.comparator)(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_in_limit.as_ref().is_some_and(|first| {
                                (self.comparator)(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The modified document may now sort outside the limit.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `changes` to the view and produces the snapshot to raise,
    /// if anything user-visible changed.
    pub fn apply_changes(
        &mut self,
        changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, changes.document_set);
        self.mutated_keys = changes.mutated_keys;

        let mut document_changes = changes.change_set.into_changes();
        let comparator = self.comparator.clone();
        document_changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if document_changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change
                .is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops the `current` flag so listeners see cached
    /// results flagged as such.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let changes = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(changes, false, None, false);
        }
        ViewChange::default()
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("View: modified document {key} was not previously synced");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: DocumentKeySet = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo;
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    // Keep the local version until watch echoes the committed write.
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}
