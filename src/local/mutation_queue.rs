use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use crate::core::BatchId;
use crate::core::Query;
use crate::local::index_manager::MemoryIndexManager;
use crate::local::persistence::{OrphanedDocuments, PersistenceTransaction};
use crate::local::persistence_promise::PersistencePromise;
use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::util::assert::hard_assert;

/// The queue of mutations one user has issued but the backend has not yet
/// acknowledged. Batch ids increase monotonically and batches leave the
/// queue strictly from the front.
pub struct MemoryMutationQueue {
    index_manager: Rc<MemoryIndexManager>,
    orphaned: Rc<OrphanedDocuments>,
    inner: RefCell<Inner>,
}

struct Inner {
    queue: VecDeque<MutationBatch>,
    next_batch_id: BatchId,
    highest_acknowledged_batch_id: BatchId,
    /// Ordered mapping from document key to the ids of the batches that
    /// mutate it.
    batches_by_document_key: BTreeSet<(DocumentKey, BatchId)>,
}

impl MemoryMutationQueue {
    pub fn new(index_manager: Rc<MemoryIndexManager>, orphaned: Rc<OrphanedDocuments>) -> Self {
        Self {
            index_manager,
            orphaned,
            inner: RefCell::new(Inner {
                queue: VecDeque::new(),
                next_batch_id: 1,
                highest_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                batches_by_document_key: BTreeSet::new(),
            }),
        }
    }

    pub fn check_empty(&self, _txn: &PersistenceTransaction) -> PersistencePromise<bool> {
        PersistencePromise::resolve(self.inner.borrow().queue.is_empty())
    }

    pub fn add_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> PersistencePromise<MutationBatch> {
        hard_assert(!mutations.is_empty(), "Mutation batches should not be empty");

        let mut inner = self.inner.borrow_mut();
        let batch_id = inner.next_batch_id;
        inner.next_batch_id += 1;

        if let Some(prior) = inner.queue.back() {
            hard_assert(
                prior.batch_id < batch_id,
                "Mutation batch ids must be monotonically increasing",
            );
        }

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        for mutation in &batch.mutations {
            inner
                .batches_by_document_key
                .insert((mutation.key().clone(), batch_id));
        }
        let parents: Vec<_> = batch
            .mutations
            .iter()
            .map(|m| m.key().collection_path())
            .collect();
        inner.queue.push_back(batch.clone());
        drop(inner);

        let index_manager = Rc::clone(&self.index_manager);
        PersistencePromise::for_each(parents, {
            let txn = txn.clone();
            move |parent| index_manager.add_to_collection_parent_index(&txn, &parent)
        })
        .map(move |()| batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> PersistencePromise<Option<MutationBatch>> {
        PersistencePromise::resolve(self.inner.borrow().find_batch(batch_id).cloned())
    }

    /// The first batch after `batch_id`, or the head of the queue when the
    /// id has already been removed.
    pub fn next_mutation_batch_after_batch_id(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> PersistencePromise<Option<MutationBatch>> {
        let inner = self.inner.borrow();
        let raw_index = inner.index_of(batch_id + 1);
        let index = raw_index.max(0) as usize;
        PersistencePromise::resolve(inner.queue.get(index).cloned())
    }

    pub fn highest_unacknowledged_batch_id(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<BatchId> {
        let inner = self.inner.borrow();
        PersistencePromise::resolve(if inner.queue.is_empty() {
            BATCH_ID_UNKNOWN
        } else {
            inner.next_batch_id - 1
        })
    }

    /// Marks a batch as acknowledged by the backend. Acknowledgements must
    /// arrive in batch id order.
    pub fn acknowledge_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        hard_assert(
            inner.find_batch(batch_id).is_some(),
            "Acknowledged batches must exist in the mutation queue",
        );
        hard_assert(
            batch_id > inner.highest_acknowledged_batch_id,
            "Mutation batches must be acknowledged in order",
        );
        inner.highest_acknowledged_batch_id = batch_id;
        PersistencePromise::resolve(())
    }

    pub fn get_all_mutation_batches(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<Vec<MutationBatch>> {
        PersistencePromise::resolve(self.inner.borrow().queue.iter().cloned().collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<Vec<MutationBatch>> {
        let inner = self.inner.borrow();
        let batches = inner
            .batch_ids_for_key(key)
            .into_iter()
            .filter_map(|id| inner.find_batch(id).cloned())
            .collect();
        PersistencePromise::resolve(batches)
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<Vec<MutationBatch>> {
        let inner = self.inner.borrow();
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            batch_ids.extend(inner.batch_ids_for_key(key));
        }
        PersistencePromise::resolve(inner.find_batches(&batch_ids))
    }

    /// All batches that could affect documents matching `query`. This scans
    /// documents directly inside the query path, which over-approximates:
    /// the batches returned may mutate documents the query filters out.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        _txn: &PersistenceTransaction,
        query: &Query,
    ) -> PersistencePromise<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "Collection group queries should be handled by the local documents view",
        );
        let inner = self.inner.borrow();
        let prefix = &query.path;
        let immediate_children_path_length = prefix.len() + 1;

        // The empty document id sorts before all real ids in the collection.
        let start = (
            DocumentKey::from_path(prefix.child([""])).unwrap_or_else(|_| DocumentKey::empty()),
            BatchId::MIN,
        );

        let mut batch_ids = BTreeSet::new();
        for (key, batch_id) in inner.batches_by_document_key.range(start..) {
            if !prefix.is_prefix_of(key.path()) {
                break;
            }
            // Keys nested deeper than one segment below the query path are
            // in subcollections, not the queried collection.
            if key.path().len() == immediate_children_path_length {
                batch_ids.insert(*batch_id);
            }
        }
        PersistencePromise::resolve(inner.find_batches(&batch_ids))
    }

    /// Removes an applied or rejected batch. Only the queue head may be
    /// removed; every document reference the batch registered must still be
    /// present, otherwise the queue has leaked references.
    pub fn remove_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch: &MutationBatch,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        let index = inner.index_of(batch.batch_id);
        hard_assert(
            index == 0 && !inner.queue.is_empty(),
            "Can only remove the first entry of the mutation queue",
        );
        inner.queue.pop_front();

        for mutation in &batch.mutations {
            let removed = inner
                .batches_by_document_key
                .remove(&(mutation.key().clone(), batch.batch_id));
            hard_assert(
                removed,
                "Dangling document reference found: batch is missing a reference it registered",
            );
            self.orphaned
                .mark(mutation.key(), txn.current_sequence_number());
        }
        PersistencePromise::resolve(())
    }

    pub fn contains_key(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<bool> {
        let inner = self.inner.borrow();
        PersistencePromise::resolve(!inner.batch_ids_for_key(key).is_empty())
    }

    pub fn perform_consistency_check(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<()> {
        let inner = self.inner.borrow();
        if inner.queue.is_empty() {
            hard_assert(
                inner.batches_by_document_key.is_empty(),
                "Document leak: dangling document references found on an empty mutation queue",
            );
        }
        PersistencePromise::resolve(())
    }
}

impl Inner {
    /// Position of `batch_id` in the queue. O(1) because batch ids are
    /// contiguous; negative when the batch was already removed.
    fn index_of(&self, batch_id: BatchId) -> i64 {
        match self.queue.front() {
            None => 0,
            Some(first) => i64::from(batch_id) - i64::from(first.batch_id),
        }
    }

    fn find_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        let index = self.index_of(batch_id);
        if index < 0 {
            return None;
        }
        self.queue.get(index as usize)
    }

    fn find_batches(&self, batch_ids: &BTreeSet<BatchId>) -> Vec<MutationBatch> {
        // Ascending batch id order so later mutations apply on top of
        // earlier ones.
        batch_ids
            .iter()
            .filter_map(|id| self.find_batch(*id).cloned())
            .collect()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<BatchId> {
        self.batches_by_document_key
            .range((key.clone(), BatchId::MIN)..=(key.clone(), BatchId::MAX))
            .map(|(_, id)| *id)
            .collect()
    }
}
