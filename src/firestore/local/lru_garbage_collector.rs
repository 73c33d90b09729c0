use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::firestore::core::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{PersistenceState, ReferenceSet};
use crate::firestore::model::DocumentKey;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, QueueFuture, TimerId};

pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_REGULAR_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection is skipped while the cache is smaller than this many bytes.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE_BYTES)
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != CACHE_SIZE_UNLIMITED
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Tracks the last sequence number at which each document lost or gained
/// a reference, plus in-memory pins held by local views.
#[derive(Clone, Debug, Default)]
pub struct MemoryLruDelegate {
    orphaned: BTreeMap<DocumentKey, ListenSequenceNumber>,
    in_memory_pins: ReferenceSet,
}

impl MemoryLruDelegate {
    pub fn add_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.orphaned.insert(key.clone(), sequence_number);
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.orphaned.insert(key.clone(), sequence_number);
    }

    pub fn remove_mutation_reference(
        &mut self,
        key: &DocumentKey,
        sequence_number: ListenSequenceNumber,
    ) {
        self.orphaned.insert(key.clone(), sequence_number);
    }

    pub fn update_limbo_document(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.orphaned.insert(key.clone(), sequence_number);
    }

    pub fn add_in_memory_pins<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.in_memory_pins.add_references(keys, target_id);
    }

    pub fn remove_in_memory_pins<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.in_memory_pins.remove_references(keys, target_id);
    }

    pub fn remove_in_memory_pins_for_target(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.in_memory_pins.remove_references_for_id(target_id)
    }

    pub fn has_in_memory_pin(&self, key: &DocumentKey) -> bool {
        self.in_memory_pins.contains_key(key)
    }

    pub fn orphaned_document_count(&self) -> usize {
        self.orphaned.len()
    }
}

/// Evicts targets and documents whose sequence numbers fall in the oldest
/// percentile once the cache outgrows its size threshold.
#[derive(Clone, Copy, Debug, Default)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// `current_sequence_number` stamps documents orphaned by removed
    /// targets, so they outlive this pass.
    pub fn collect(
        &self,
        state: &mut PersistenceState,
        active_target_ids: &BTreeSet<TargetId>,
        current_sequence_number: ListenSequenceNumber,
    ) -> LruResults {
        if !self.params.is_enabled() {
            log::debug!("LruGarbageCollector: collection skipped; disabled");
            return LruResults::default();
        }
        let cache_size = state.remote_documents.size() as i64;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "LruGarbageCollector: collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return LruResults::default();
        }
        self.run_garbage_collection(state, active_target_ids, current_sequence_number)
    }

    /// Collects unconditionally, ignoring the size threshold.
    pub fn run_garbage_collection(
        &self,
        state: &mut PersistenceState,
        active_target_ids: &BTreeSet<TargetId>,
        current_sequence_number: ListenSequenceNumber,
    ) -> LruResults {
        let start = Instant::now();
        let count = state.target_cache.target_count() + state.reference_delegate.orphaned_document_count();
        let to_collect = (count * self.params.percentile_to_collect as usize / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        if to_collect == 0 {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        }

        let Some(upper_bound) = nth_sequence_number(state, to_collect) else {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        };
        let removed_targets = state
            .target_cache
            .remove_targets(upper_bound, &|target_id| active_target_ids.contains(&target_id));
        let targets_removed = removed_targets.len();
        for key in removed_targets.iter().flat_map(|(_, keys)| keys) {
            state
                .reference_delegate
                .remove_reference(key, current_sequence_number);
        }
        let documents_removed = remove_orphaned_documents(state, upper_bound);

        log::debug!(
            "LruGarbageCollector: removed {targets_removed} targets and {documents_removed} documents below sequence number {upper_bound} in {} ms",
            start.elapsed().as_millis()
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        }
    }
}

/// The `n`th smallest sequence number across targets and orphaned
/// documents.
fn nth_sequence_number(state: &PersistenceState, n: usize) -> Option<ListenSequenceNumber> {
    let mut numbers: Vec<ListenSequenceNumber> = state
        .target_cache
        .targets()
        .map(|data| data.sequence_number)
        .chain(state.reference_delegate.orphaned.values().copied())
        .collect();
    numbers.sort_unstable();
    numbers.get(n.checked_sub(1)?).copied()
}

fn remove_orphaned_documents(state: &mut PersistenceState, upper_bound: ListenSequenceNumber) -> usize {
    let candidates: Vec<DocumentKey> = state
        .reference_delegate
        .orphaned
        .iter()
        .filter(|(_, sequence_number)| **sequence_number <= upper_bound)
        .map(|(key, _)| key.clone())
        .collect();
    let mut removed = 0;
    for key in candidates {
        if state.is_pinned(&key) {
            continue;
        }
        state.reference_delegate.orphaned.remove(&key);
        if state.remote_documents.remove_entry(&key).is_some() {
            state.index_manager.remove_index_entries(&key);
            removed += 1;
        }
    }
    removed
}

pub type CollectFn = Arc<dyn Fn() -> QueueFuture<FirestoreResult<LruResults>> + Send + Sync>;

struct SchedulerInner {
    queue: AsyncQueue,
    initial_delay: Duration,
    regular_delay: Duration,
    collect: CollectFn,
    task: Mutex<Option<DelayedOperation>>,
    started: AtomicBool,
}

/// Runs garbage collection on the async queue: once after the initial
/// delay, then after every regular delay.
#[derive(Clone)]
pub struct LruScheduler {
    inner: Arc<SchedulerInner>,
}

impl LruScheduler {
    /// `collect` runs on the queue, so it must not enqueue and await more
    /// queue work.
    pub fn new(
        queue: AsyncQueue,
        initial_delay: Duration,
        regular_delay: Duration,
        collect: CollectFn,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue,
                initial_delay,
                regular_delay,
                collect,
                task: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.schedule(self.inner.initial_delay);
    }

    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        if let Ok(mut task) = self.inner.task.lock() {
            if let Some(task) = task.take() {
                task.cancel();
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn schedule(&self, delay: Duration) {
        log::debug!("LruScheduler: garbage collection scheduled in {} ms", delay.as_millis());
        let scheduler = self.clone();
        let operation = self.inner.queue.enqueue_after_delay(
            TimerId::GarbageCollection,
            delay,
            move || async move {
                if let Ok(mut task) = scheduler.inner.task.lock() {
                    task.take();
                }
                match (scheduler.inner.collect)().await {
                    Ok(results) => log::debug!("LruScheduler: collection finished: {results:?}"),
                    Err(err) => log::debug!("LruScheduler: ignoring error during garbage collection: {err}"),
                }
                if scheduler.is_started() {
                    scheduler.schedule(scheduler.inner.regular_delay);
                }
            },
        );
        if let Ok(mut task) = self.inner.task.lock() {
            *task = Some(operation);
        }
    }
}
