use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

use crate::core::{ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::local::target_data::TargetData;

/// Tuning knobs for LRU garbage collection.
#[derive(Clone, Copy, Debug)]
pub struct LruParams {
    /// Collection runs only once the cache exceeds this size.
    pub cache_size_collection_threshold: i64,
    /// The percentage of sequence numbers to collect per pass.
    pub percentile_to_collect: i32,
    /// Upper limit of sequence numbers collected per pass.
    pub maximum_sequence_numbers_to_collect: usize,
}

pub const LRU_COLLECTION_DISABLED: i64 = -1;
pub const LRU_DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const LRU_DEFAULT_COLLECTION_PERCENTILE: i32 = 10;
pub const LRU_DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            percentile_to_collect: LRU_DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: LRU_DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(LRU_COLLECTION_DISABLED)
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self::with_cache_size(LRU_DEFAULT_CACHE_SIZE_BYTES)
    }
}

/// What a collection pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn did_not_run() -> Self {
        Self::default()
    }
}

/// The storage-side operations garbage collection needs: enumerating
/// sequence numbers and removing what fell below the cutoff.
pub trait LruDelegate {
    fn get_cache_size(&self, txn: &PersistenceTransaction) -> PersistencePromise<i64>;

    /// Total number of sequence-numbered entities: targets plus orphaned
    /// documents.
    fn get_sequence_number_count(&self, txn: &PersistenceTransaction)
        -> PersistencePromise<usize>;

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        f: &mut dyn FnMut(&TargetData),
    ) -> PersistencePromise<()>;

    fn for_each_orphaned_document_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        f: &mut dyn FnMut(ListenSequenceNumber),
    ) -> PersistencePromise<()>;

    fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> PersistencePromise<usize>;

    fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> PersistencePromise<usize>;
}

/// Keeps the `n` lowest sequence numbers seen. A max-heap of bounded size:
/// once full, any incoming value smaller than the largest retained value
/// evicts it. The heap top is then the nth lowest overall.
pub struct RollingSequenceNumberBuffer {
    capacity: usize,
    heap: BinaryHeap<ListenSequenceNumber>,
}

impl RollingSequenceNumberBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    pub fn add_element(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.capacity {
            self.heap.push(sequence_number);
        } else if self.heap.peek().is_some_and(|max| sequence_number < *max) {
            self.heap.pop();
            self.heap.push(sequence_number);
        }
    }

    pub fn max_value(&self) -> ListenSequenceNumber {
        self.heap.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

/// Removes the least recently used targets and the documents orphaned by
/// them once the cache grows past its threshold.
pub struct LruGarbageCollector<D: LruDelegate> {
    delegate: Rc<D>,
    params: LruParams,
}

impl<D: LruDelegate + 'static> LruGarbageCollector<D> {
    pub fn new(delegate: Rc<D>, params: LruParams) -> Self {
        Self { delegate, params }
    }

    /// How many sequence numbers make up `percentile` percent of all
    /// sequence-numbered entities.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction,
        percentile: i32,
    ) -> PersistencePromise<usize> {
        self.delegate
            .get_sequence_number_count(txn)
            .map(move |count| (percentile as usize * count) / 100)
    }

    /// The `n`th lowest sequence number across targets and orphaned
    /// documents; everything at or below it is eligible for removal.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        n: usize,
    ) -> PersistencePromise<ListenSequenceNumber> {
        if n == 0 {
            return PersistencePromise::resolve(INVALID_SEQUENCE_NUMBER);
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        let delegate = Rc::clone(&self.delegate);
        let txn_clone = txn.clone();
        let targets_visited = {
            let mut add = |target_data: &TargetData| buffer.add_element(target_data.sequence_number());
            self.delegate.for_each_target(txn, &mut add)
        };
        targets_visited.next(move |()| {
            let orphaned_visited = {
                let mut add = |sequence| buffer.add_element(sequence);
                delegate.for_each_orphaned_document_sequence_number(&txn_clone, &mut add)
            };
            orphaned_visited.map(move |()| buffer.max_value())
        })
    }

    /// Runs a collection pass. Skips when collection is disabled or the
    /// cache is still under its threshold; a transient storage error skips
    /// the pass rather than failing it.
    pub fn collect(
        &self,
        txn: &PersistenceTransaction,
        active_target_ids: &HashSet<TargetId>,
    ) -> PersistencePromise<LruResults> {
        if self.params.cache_size_collection_threshold == LRU_COLLECTION_DISABLED {
            log::debug!("Garbage collection skipped; disabled");
            return PersistencePromise::resolve(LruResults::did_not_run());
        }
        let threshold = self.params.cache_size_collection_threshold;
        let collector = Self::new(Rc::clone(&self.delegate), self.params);
        let active = active_target_ids.clone();
        let txn_run = txn.clone();
        self.delegate
            .get_cache_size(txn)
            .next(move |cache_size| {
                if cache_size < threshold {
                    log::debug!(
                        "Garbage collection skipped; cache size {cache_size} is lower than threshold {threshold}"
                    );
                    PersistencePromise::resolve(LruResults::did_not_run())
                } else {
                    collector.run_garbage_collection(&txn_run, &active)
                }
            })
            .recover(|error| {
                if error.is_transient() {
                    log::debug!("Garbage collection skipped on transient error: {error}");
                    PersistencePromise::resolve(LruResults::did_not_run())
                } else {
                    PersistencePromise::reject(error)
                }
            })
    }

    fn run_garbage_collection(
        &self,
        txn: &PersistenceTransaction,
        active_target_ids: &HashSet<TargetId>,
    ) -> PersistencePromise<LruResults> {
        let delegate = Rc::clone(&self.delegate);
        let maximum = self.params.maximum_sequence_numbers_to_collect;
        let percentile = self.params.percentile_to_collect;
        let active = active_target_ids.clone();
        let txn = txn.clone();

        let collector = Self::new(Rc::clone(&self.delegate), self.params);
        self.calculate_target_count(&txn, percentile)
            .next(move |sequence_numbers| {
                let capped = if sequence_numbers > maximum {
                    log::debug!(
                        "Capping sequence numbers to collect down to the maximum of {maximum} from {sequence_numbers}"
                    );
                    maximum
                } else {
                    sequence_numbers
                };
                collector
                    .nth_sequence_number(&txn, capped)
                    .next(move |upper_bound| {
                        let txn_docs = txn.clone();
                        let delegate_docs = Rc::clone(&delegate);
                        delegate
                            .remove_targets(&txn, upper_bound, &active)
                            .next(move |targets_removed| {
                                delegate_docs
                                    .remove_orphaned_documents(&txn_docs, upper_bound)
                                    .map(move |documents_removed| LruResults {
                                        did_run: true,
                                        sequence_numbers_collected: capped,
                                        targets_removed,
                                        documents_removed,
                                    })
                            })
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_keeps_lowest_values() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        for sequence in [9, 4, 7, 1, 8, 2] {
            buffer.add_element(sequence);
        }
        // The three lowest are {1, 2, 4}; the cutoff is the largest of them.
        assert_eq!(buffer.max_value(), 4);
    }

    #[test]
    fn buffer_with_fewer_elements_than_capacity() {
        let mut buffer = RollingSequenceNumberBuffer::new(10);
        buffer.add_element(3);
        buffer.add_element(1);
        assert_eq!(buffer.max_value(), 3);
    }

    #[test]
    fn empty_buffer_yields_invalid() {
        let buffer = RollingSequenceNumberBuffer::new(5);
        assert_eq!(buffer.max_value(), INVALID_SEQUENCE_NUMBER);
    }
}
