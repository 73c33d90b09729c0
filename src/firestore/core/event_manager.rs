use std::collections::BTreeMap;

use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{OnlineState, Query};
use crate::firestore::error::FirestoreError;
use crate::util::subscribe::Observer;

pub type ListenerId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only changes are metadata (pending writes,
    /// from-cache) changes.
    pub include_metadata_changes: bool,
    /// Hold back the first from-cache snapshot while the client may still
    /// reach the backend.
    pub wait_for_sync_when_online: bool,
}

/// One user listener on a query. Decides which view snapshots are raised
/// to its observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: Observer<ViewSnapshot>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: Observer<ViewSnapshot>) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether a snapshot was raised.
    pub fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> bool {
        let mut snapshot = snapshot.clone();
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.observer.notify(&snapshot);
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: &FirestoreError) {
        self.observer.notify_error(error);
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        if self.raised_initial_event {
            return false;
        }
        match self.snapshot.clone() {
            Some(snapshot) if self.should_raise_initial_event(&snapshot, online_state) => {
                self.raise_initial_event(&snapshot);
                true
            }
            _ => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.observer.notify(&initial);
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: BTreeMap<ListenerId, QueryListener>,
}

/// Fans view snapshots out to every listener of the same query.
pub struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    listener_queries: BTreeMap<ListenerId, String>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            queries: BTreeMap::new(),
            listener_queries: BTreeMap::new(),
            next_listener_id: 1,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Whether some listener already drives a view for `query`.
    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    /// Registers `listener`. `initial_snapshot` must be given for the first
    /// listener of a query, and is the snapshot the new view produced.
    pub fn add_listener(
        &mut self,
        mut listener: QueryListener,
        initial_snapshot: Option<ViewSnapshot>,
    ) -> ListenerId {
        let canonical_id = listener.query().canonical_id();
        let info = self
            .queries
            .entry(canonical_id.clone())
            .or_insert_with(|| QueryListenersInfo {
                view_snapshot: None,
                listeners: BTreeMap::new(),
            });
        if initial_snapshot.is_some() {
            info.view_snapshot = initial_snapshot;
        }

        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &info.view_snapshot {
            listener.on_view_snapshot(snapshot);
        }

        let id = self.next_listener_id;
        self.next_listener_id += 1;
        info.listeners.insert(id, listener);
        self.listener_queries.insert(id, canonical_id);
        id
    }

    /// Removes a listener. Returns the query when it was the last listener,
    /// meaning the caller should stop listening to the target.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Query> {
        let canonical_id = self.listener_queries.remove(&id)?;
        let info = self.queries.get_mut(&canonical_id)?;
        let listener = info.listeners.remove(&id)?;
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return Some(listener.query);
        }
        None
    }

    pub fn on_watch_change(&mut self, snapshots: &[ViewSnapshot]) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in info.listeners.values_mut() {
                listener.on_view_snapshot(snapshot);
            }
            info.view_snapshot = Some(snapshot.clone());
        }
    }

    /// Target-level failure: notify and drop every listener of `query`.
    pub fn on_watch_error(&mut self, query: &Query, error: &FirestoreError) {
        let Some(info) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        for (id, listener) in info.listeners {
            self.listener_queries.remove(&id);
            listener.on_error(error);
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in info.listeners.values_mut() {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}
