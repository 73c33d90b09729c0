use crate::firestore::core::{LimitType, Query};
use crate::firestore::credentials::User;
use crate::firestore::local::{IndexType, PersistenceState};
use crate::firestore::model::{Document, DocumentKeySet, DocumentMap, SnapshotVersion};

pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

/// When the query engine may create indexes on its own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Collections smaller than this are always scanned.
    pub min_collection_size: usize,
    /// An index is created once a scan reads more than this many documents
    /// per returned result.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

/// Which strategy answered the last query. Exposed for tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    DocumentLookup,
    Index,
    PreviousResults,
    FullScan,
}

/// Runs queries against the local cache. Tries an index, then the keys the
/// server last reported for the target, then a full collection scan.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    settings: IndexAutoCreationSettings,
    last_strategy: Option<QueryStrategy>,
}

impl QueryEngine {
    pub fn new(settings: IndexAutoCreationSettings) -> Self {
        Self {
            settings,
            last_strategy: None,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    pub fn last_strategy(&self) -> Option<QueryStrategy> {
        self.last_strategy
    }

    /// Local documents matching `query`, unsorted and without the limit
    /// applied. `remote_keys` are the keys the server last reported for the
    /// query's target, valid as of `last_limbo_free_snapshot_version`.
    pub fn get_documents_matching_query(
        &mut self,
        state: &mut PersistenceState,
        user: &User,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> DocumentMap {
        if query.is_document_query() {
            self.last_strategy = Some(QueryStrategy::DocumentLookup);
            return state
                .local_documents_view(user)
                .get_documents_matching_query(query, SnapshotVersion::min());
        }

        if let Some(results) = self.perform_query_using_index(state, user, query) {
            self.last_strategy = Some(QueryStrategy::Index);
            return results;
        }

        if let Some(results) = self.perform_query_using_remote_keys(
            state,
            user,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        ) {
            self.last_strategy = Some(QueryStrategy::PreviousResults);
            return results;
        }

        self.last_strategy = Some(QueryStrategy::FullScan);
        let results = state
            .local_documents_view(user)
            .get_documents_matching_query(query, SnapshotVersion::min());
        if self.settings.enabled {
            self.create_cache_indexes(state, query, results.len());
        }
        results
    }

    fn perform_query_using_index(
        &self,
        state: &mut PersistenceState,
        user: &User,
        query: &Query,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        let mut target = query.to_target();
        let index_type = state.index_manager.get_index_type(&target);
        if index_type == IndexType::None {
            return None;
        }
        if index_type == IndexType::Partial && query.has_limit() {
            // A partial index can't honor the limit; read every candidate.
            target = query.without_limit().to_target();
        }
        let keys = state.index_manager.get_documents_matching_target(&target)?;
        let since = state.target_cache.last_remote_snapshot_version();

        let mut view = state.local_documents_view(user);
        let mut results: DocumentMap = view
            .get_documents(keys.iter())
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect();
        // Local writes and documents read after the last snapshot are not
        // guaranteed to be indexed yet.
        results.extend(view.get_documents_matching_query(query, since));
        log::debug!(
            "QueryEngine: index lookup for {} returned {} documents",
            query.canonical_id(),
            results.len()
        );
        Some(results)
    }

    fn perform_query_using_remote_keys(
        &self,
        state: &mut PersistenceState,
        user: &User,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let mut view = state.local_documents_view(user);
        let documents = view.get_documents(remote_keys.iter());
        let mut previous: Vec<Document> = documents
            .into_values()
            .filter(|document| query.matches(document))
            .collect();
        let comparator = query.comparator();
        previous.sort_by(|left, right| comparator(left, right));

        if query.has_limit()
            && needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        log::debug!(
            "QueryEngine: re-using previous result from {:?} to execute query {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let mut results: DocumentMap = previous
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        results.extend(view.get_documents_matching_query(query, last_limbo_free_snapshot_version));
        Some(results)
    }

    fn create_cache_indexes(&self, state: &mut PersistenceState, query: &Query, result_count: usize) {
        let documents_read = collection_size(state, query);
        if documents_read < self.settings.min_collection_size {
            log::debug!(
                "QueryEngine: not creating an index for {}; only {documents_read} documents scanned",
                query.canonical_id()
            );
            return;
        }
        let threshold = result_count as f64 * self.settings.relative_index_read_cost_per_document;
        if documents_read as f64 > threshold {
            let target = query.to_target();
            let PersistenceState {
                remote_documents,
                index_manager,
                ..
            } = state;
            index_manager.create_target_indexes(&target, remote_documents.documents());
            log::debug!(
                "QueryEngine: created index for {} after scanning {documents_read} documents for {result_count} results",
                query.canonical_id()
            );
        }
    }
}

/// A limit query has to rerun from scratch when a previous result dropped
/// out, or when the document at the limit boundary changed since the
/// results were last in sync: a document outside the old window might now
/// sort before it.
fn needs_refill(
    query: &Query,
    sorted_previous: &[Document],
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let boundary = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match boundary {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

fn collection_size(state: &PersistenceState, query: &Query) -> usize {
    state
        .remote_documents
        .keys()
        .filter(|key| match query.collection_group_id() {
            Some(group) => key.has_collection_id(group),
            None => query.path().is_immediate_parent_of(key.path()),
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::FilterOperator;
    use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn beverage(id: &str, temperature: &str, seconds: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("temperature").unwrap(),
            FirestoreValue::from_string(temperature),
        );
        let mut document = MutableDocument::new_found_document(
            DocumentKey::from_string(&format!("beverages/{id}")).unwrap(),
            version(seconds),
            data,
        );
        document.set_read_time(version(seconds));
        document
    }

    fn hot_query() -> Query {
        Query::collection("beverages")
            .unwrap()
            .where_field("temperature", FilterOperator::Equal, FirestoreValue::from_string("Hot"))
            .unwrap()
    }

    #[test]
    fn document_queries_read_the_single_document() {
        let mut state = PersistenceState::default();
        state.remote_documents.add_entry(beverage("a", "Hot", 1));
        let mut engine = QueryEngine::default();
        let key = DocumentKey::from_string("beverages/a").unwrap();
        let results = engine.get_documents_matching_query(
            &mut state,
            &User::unauthenticated(),
            &Query::document(&key),
            SnapshotVersion::min(),
            &DocumentKeySet::new(),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(engine.last_strategy(), Some(QueryStrategy::DocumentLookup));
    }

    #[test]
    fn previous_results_are_reused_and_extended_with_newer_documents() {
        let mut state = PersistenceState::default();
        state.remote_documents.add_entry(beverage("a", "Hot", 1));
        state.remote_documents.add_entry(beverage("b", "Hot", 5));
        state.remote_documents.add_entry(beverage("c", "Cold", 5));
        let remote_keys: DocumentKeySet =
            [DocumentKey::from_string("beverages/a").unwrap()].into_iter().collect();

        let mut engine = QueryEngine::default();
        let results = engine.get_documents_matching_query(
            &mut state,
            &User::unauthenticated(),
            &hot_query(),
            version(2),
            &remote_keys,
        );
        assert_eq!(engine.last_strategy(), Some(QueryStrategy::PreviousResults));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn limit_queries_fall_back_to_a_scan_when_a_result_dropped_out() {
        let mut state = PersistenceState::default();
        state.remote_documents.add_entry(beverage("a", "Cold", 3));
        state.remote_documents.add_entry(beverage("b", "Hot", 1));
        let remote_keys: DocumentKeySet = ["beverages/a", "beverages/b"]
            .into_iter()
            .map(|path| DocumentKey::from_string(path).unwrap())
            .collect();

        let mut engine = QueryEngine::default();
        let results = engine.get_documents_matching_query(
            &mut state,
            &User::unauthenticated(),
            &hot_query().limit_to_first(2).unwrap(),
            version(2),
            &remote_keys,
        );
        assert_eq!(engine.last_strategy(), Some(QueryStrategy::FullScan));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn inefficient_scans_create_an_index_used_by_later_queries() {
        let mut state = PersistenceState::default();
        for i in 0..120 {
            let temperature = if i == 0 { "Hot" } else { "Cold" };
            state
                .remote_documents
                .add_entry(beverage(&format!("b{i:03}"), temperature, 1));
        }
        let mut engine = QueryEngine::new(IndexAutoCreationSettings {
            enabled: true,
            ..IndexAutoCreationSettings::default()
        });
        let user = User::unauthenticated();

        let first = engine.get_documents_matching_query(
            &mut state,
            &user,
            &hot_query(),
            SnapshotVersion::min(),
            &DocumentKeySet::new(),
        );
        assert_eq!(engine.last_strategy(), Some(QueryStrategy::FullScan));
        assert_eq!(state.index_manager.get_index_type(&hot_query().to_target()), IndexType::Full);

        let second = engine.get_documents_matching_query(
            &mut state,
            &user,
            &hot_query(),
            SnapshotVersion::min(),
            &DocumentKeySet::new(),
        );
        assert_eq!(engine.last_strategy(), Some(QueryStrategy::Index));
        assert_eq!(first, second);
    }

    #[test]
    fn small_collections_never_get_indexes() {
        let mut state = PersistenceState::default();
        state.remote_documents.add_entry(beverage("a", "Cold", 1));
        let mut engine = QueryEngine::new(IndexAutoCreationSettings {
            enabled: true,
            ..IndexAutoCreationSettings::default()
        });
        engine.get_documents_matching_query(
            &mut state,
            &User::unauthenticated(),
            &hot_query(),
            SnapshotVersion::min(),
            &DocumentKeySet::new(),
        );
        assert_eq!(state.index_manager.get_index_type(&hot_query().to_target()), IndexType::None);
    }
}
