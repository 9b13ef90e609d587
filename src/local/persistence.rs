use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::core::{ListenSequence, ListenSequenceNumber, TargetId};
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::local::index_manager::MemoryIndexManager;
use crate::local::lru_garbage_collector::LruDelegate;
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::persistence_promise::PersistencePromise;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;
use crate::local::target_data::TargetData;
use crate::model::DocumentKey;

/// The user on whose behalf mutations are queued. Each user gets their own
/// mutation queue and overlay cache; the document caches are shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }
}

/// Context for one unit of storage work. Carries the sequence number that
/// stamps everything touched inside the transaction.
#[derive(Clone, Debug)]
pub struct PersistenceTransaction {
    current_sequence_number: ListenSequenceNumber,
}

impl PersistenceTransaction {
    pub(crate) fn new(current_sequence_number: ListenSequenceNumber) -> Self {
        Self {
            current_sequence_number,
        }
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

/// Documents that may no longer be referenced by any target or pending
/// mutation, with the sequence number at which they were last let go.
#[derive(Default)]
pub struct OrphanedDocuments {
    inner: RefCell<HashMap<DocumentKey, ListenSequenceNumber>>,
}

impl OrphanedDocuments {
    pub fn mark(&self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.inner
            .borrow_mut()
            .insert(key.clone(), sequence_number);
    }

    pub fn forget(&self, key: &DocumentKey) {
        self.inner.borrow_mut().remove(key);
    }

    pub fn sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.inner.borrow().get(key).copied()
    }

    fn entries(&self) -> Vec<(DocumentKey, ListenSequenceNumber)> {
        self.inner
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// The in-memory storage engine: owns every cache and hands out
/// transactions whose sequence numbers drive garbage collection.
pub struct MemoryPersistence {
    index_manager: Rc<MemoryIndexManager>,
    remote_documents: Rc<MemoryRemoteDocumentCache>,
    target_cache: Rc<MemoryTargetCache>,
    mutation_queues: RefCell<HashMap<User, Rc<MemoryMutationQueue>>>,
    overlays: RefCell<HashMap<User, Rc<MemoryDocumentOverlayCache>>>,
    orphaned: Rc<OrphanedDocuments>,
    listen_sequence: RefCell<ListenSequence>,
}

impl MemoryPersistence {
    pub fn new() -> Rc<Self> {
        let orphaned = Rc::new(OrphanedDocuments::default());
        let index_manager = Rc::new(MemoryIndexManager::new());
        let remote_documents = Rc::new(MemoryRemoteDocumentCache::new(Rc::clone(&index_manager)));
        let target_cache = Rc::new(MemoryTargetCache::new(Rc::clone(&orphaned)));
        Rc::new(Self {
            index_manager,
            remote_documents,
            target_cache,
            mutation_queues: RefCell::new(HashMap::new()),
            overlays: RefCell::new(HashMap::new()),
            orphaned,
            listen_sequence: RefCell::new(ListenSequence::new(0)),
        })
    }

    pub fn index_manager(&self) -> Rc<MemoryIndexManager> {
        Rc::clone(&self.index_manager)
    }

    pub fn remote_document_cache(&self) -> Rc<MemoryRemoteDocumentCache> {
        Rc::clone(&self.remote_documents)
    }

    pub fn target_cache(&self) -> Rc<MemoryTargetCache> {
        Rc::clone(&self.target_cache)
    }

    pub fn mutation_queue(&self, user: &User) -> Rc<MemoryMutationQueue> {
        Rc::clone(
            self.mutation_queues
                .borrow_mut()
                .entry(user.clone())
                .or_insert_with(|| {
                    Rc::new(MemoryMutationQueue::new(
                        Rc::clone(&self.index_manager),
                        Rc::clone(&self.orphaned),
                    ))
                }),
        )
    }

    pub fn document_overlay_cache(&self, user: &User) -> Rc<MemoryDocumentOverlayCache> {
        Rc::clone(
            self.overlays
                .borrow_mut()
                .entry(user.clone())
                .or_insert_with(|| Rc::new(MemoryDocumentOverlayCache::new())),
        )
    }

    pub(crate) fn orphaned_documents(&self) -> Rc<OrphanedDocuments> {
        Rc::clone(&self.orphaned)
    }

    /// Runs `f` inside a fresh transaction and unwraps its outcome. Every
    /// storage operation performed through the transaction settles before
    /// `f` returns.
    pub fn run_transaction<T: 'static>(
        &self,
        label: &str,
        f: impl FnOnce(&PersistenceTransaction) -> PersistencePromise<T>,
    ) -> FirestoreResult<T> {
        log::debug!("Starting transaction: {label}");
        let sequence_number = self.listen_sequence.borrow_mut().next();
        let txn = PersistenceTransaction::new(sequence_number);
        f(&txn).into_result()
    }

    /// Whether any target or pending mutation still references `key`.
    fn is_pinned(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        if self
            .target_cache
            .contains_key(txn, key)
            .into_result()
            .unwrap_or(false)
        {
            return true;
        }
        self.mutation_queues
            .borrow()
            .values()
            .any(|queue| queue.contains_key(txn, key).into_result().unwrap_or(false))
    }
}

impl LruDelegate for MemoryPersistence {
    fn get_cache_size(&self, _txn: &PersistenceTransaction) -> PersistencePromise<i64> {
        let overlays: u64 = self
            .overlays
            .borrow()
            .values()
            .map(|cache| cache.byte_size())
            .sum();
        PersistencePromise::resolve(
            (self.remote_documents.byte_size() + self.target_cache.byte_size() + overlays) as i64,
        )
    }

    fn get_sequence_number_count(
        &self,
        txn: &PersistenceTransaction,
    ) -> PersistencePromise<usize> {
        let targets = self.target_cache.get_target_count(txn);
        let orphaned = self
            .orphaned
            .entries()
            .into_iter()
            .filter(|(key, _)| !self.is_pinned(txn, key))
            .count();
        targets.map(move |target_count| target_count + orphaned)
    }

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        f: &mut dyn FnMut(&TargetData),
    ) -> PersistencePromise<()> {
        self.target_cache.for_each_target(txn, f)
    }

    fn for_each_orphaned_document_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        f: &mut dyn FnMut(ListenSequenceNumber),
    ) -> PersistencePromise<()> {
        for (key, sequence_number) in self.orphaned.entries() {
            if !self.is_pinned(txn, &key) {
                f(sequence_number);
            }
        }
        PersistencePromise::resolve(())
    }

    fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> PersistencePromise<usize> {
        self.target_cache
            .remove_targets(txn, upper_bound, active_target_ids)
    }

    fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> PersistencePromise<usize> {
        let mut removed = 0;
        for key in self.remote_documents.document_keys() {
            let eligible = !self.is_pinned(txn, &key)
                && self
                    .orphaned
                    .sequence_number(&key)
                    .is_some_and(|sequence| sequence <= upper_bound);
            if eligible {
                self.remote_documents.remove_entry(txn, &key);
                self.orphaned.forget(&key);
                removed += 1;
            }
        }
        PersistencePromise::resolve(removed)
    }
}
