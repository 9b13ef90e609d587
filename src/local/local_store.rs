use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use crate::core::{BatchId, Query, Target, TargetId};
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::local::index_backfiller::IndexBackfiller;
use crate::local::index_manager::MemoryIndexManager;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::persistence::{MemoryPersistence, PersistenceTransaction, User};
use crate::local::persistence_promise::PersistencePromise;
use crate::local::query_engine::QueryEngine;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;
use crate::local::target_data::TargetData;
use crate::model::{Document, DocumentKey, Mutation, SnapshotVersion, Timestamp};
use crate::util::assert::fail;

/// The outcome of a local write: the assigned batch id and the resulting
/// local view of every document the batch touches.
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, Document>,
}

/// The result of executing a query, along with the keys the backend last
/// reported for its target (empty for targets never listened to).
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// A view's report of how its document set changed, used to maintain target
/// bookkeeping.
pub struct LocalViewChanges {
    pub target_id: TargetId,
    /// Whether the view is still working from cached data only. Once the
    /// backend confirms the view, its snapshot version becomes limbo-free.
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Coordinates all local caches behind a single facade: the mutation queue,
/// the remote document cache, the target cache, field indexes, and the local
/// view they combine into.
///
/// Every public operation runs inside one persistence transaction and is
/// atomic with respect to every other operation.
pub struct LocalStore {
    persistence: Rc<MemoryPersistence>,
    mutation_queue: Rc<MemoryMutationQueue>,
    document_overlays: Rc<MemoryDocumentOverlayCache>,
    remote_documents: Rc<MemoryRemoteDocumentCache>,
    target_cache: Rc<MemoryTargetCache>,
    index_manager: Rc<MemoryIndexManager>,
    local_documents: Rc<LocalDocumentsView>,
    query_engine: QueryEngine,
    index_backfiller: IndexBackfiller,
    /// Targets currently allocated by the caller, by target id.
    target_data_by_id: RefCell<HashMap<TargetId, TargetData>>,
}

impl LocalStore {
    pub fn new(persistence: Rc<MemoryPersistence>, user: &User) -> Self {
        let mutation_queue = persistence.mutation_queue(user);
        let document_overlays = persistence.document_overlay_cache(user);
        let remote_documents = persistence.remote_document_cache();
        let target_cache = persistence.target_cache();
        let index_manager = persistence.index_manager();
        let local_documents = Rc::new(LocalDocumentsView::new(
            Rc::clone(&remote_documents),
            Rc::clone(&mutation_queue),
            Rc::clone(&document_overlays),
            Rc::clone(&index_manager),
        ));
        let query_engine = QueryEngine::new(Rc::clone(&local_documents), Rc::clone(&index_manager));
        let index_backfiller =
            IndexBackfiller::new(Rc::clone(&local_documents), Rc::clone(&index_manager));
        Self {
            persistence,
            mutation_queue,
            document_overlays,
            remote_documents,
            target_cache,
            index_manager,
            local_documents,
            query_engine,
            index_backfiller,
            target_data_by_id: RefCell::new(HashMap::new()),
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Queues `mutations` and updates the overlays so subsequent reads see
    /// the write immediately.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        self.persistence
            .run_transaction("Locally write mutations", |txn| {
                PersistencePromise::from_result(self.write_locally_sync(txn, mutations))
            })
    }

    fn write_locally_sync(
        &self,
        txn: &PersistenceTransaction,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<LocalWriteResult> {
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let batch = self
            .mutation_queue
            .add_mutation_batch(txn, Timestamp::now(), mutations)
            .into_result()?;
        self.local_documents
            .recalculate_and_save_overlays_for_document_keys(txn, &keys)
            .into_result()?;
        let changes = self.local_documents.get_documents(txn, &keys).into_result()?;
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Removes an acknowledged batch from the queue and rebuilds the
    /// overlays of the documents it touched from the remaining batches.
    /// Returns the resulting local views.
    pub fn acknowledge_batch(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        self.persistence
            .run_transaction("Acknowledge batch", |txn| {
                PersistencePromise::from_result((|| {
                    self.mutation_queue
                        .acknowledge_batch(txn, batch_id)
                        .into_result()?;
                    self.remove_batch_and_recalculate(txn, batch_id)
                })())
            })
    }

    /// Removes a batch the backend rejected; its writes stop being visible
    /// locally. Returns the resulting local views.
    pub fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        self.persistence.run_transaction("Reject batch", |txn| {
            PersistencePromise::from_result(self.remove_batch_and_recalculate(txn, batch_id))
        })
    }

    fn remove_batch_and_recalculate(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let Some(batch) = self
            .mutation_queue
            .lookup_mutation_batch(txn, batch_id)
            .into_result()?
        else {
            fail("Attempt to remove nonexistent batch");
        };
        self.mutation_queue
            .remove_mutation_batch(txn, &batch)
            .into_result()?;
        self.mutation_queue
            .perform_consistency_check(txn)
            .into_result()?;
        self.document_overlays
            .remove_overlays_for_batch_id(txn, batch_id)
            .into_result()?;
        let keys = batch.keys();
        self.local_documents
            .recalculate_and_save_overlays_for_document_keys(txn, &keys)
            .into_result()?;
        self.local_documents.get_documents(txn, &keys).into_result()
    }

    /// Applies documents received from the backend to the remote document
    /// cache, skipping entries older than what is already cached. Returns
    /// the new local view of every changed document.
    pub fn apply_remote_documents(
        &self,
        documents: BTreeMap<DocumentKey, Document>,
        remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        self.persistence
            .run_transaction("Apply remote event", |txn| {
                PersistencePromise::from_result(self.apply_remote_documents_sync(
                    txn,
                    documents,
                    remote_snapshot_version,
                ))
            })
    }

    fn apply_remote_documents_sync(
        &self,
        txn: &PersistenceTransaction,
        documents: BTreeMap<DocumentKey, Document>,
        remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut changed: BTreeMap<DocumentKey, Document> = BTreeMap::new();
        let mut existence_changed: BTreeSet<DocumentKey> = BTreeSet::new();

        for (key, document) in documents {
            let existing = self.remote_documents.get_entry(txn, &key).into_result()?;
            if existing.is_valid_document() && document.version() < existing.version() {
                log::debug!(
                    "Ignoring outdated document update for {key:?}; cached version is newer"
                );
                continue;
            }
            if existing.is_found_document() != document.is_found_document() {
                existence_changed.insert(key.clone());
            }
            if document.is_valid_document() {
                let read_time = remote_snapshot_version.unwrap_or_else(|| document.version());
                self.remote_documents
                    .add_entry(txn, document.clone().with_read_time(read_time))
                    .into_result()?;
            } else {
                self.remote_documents
                    .remove_entry(txn, &key)
                    .into_result()?;
            }
            changed.insert(key, document);
        }

        if let Some(version) = remote_snapshot_version {
            let highest = self
                .target_cache
                .get_highest_sequence_number(txn)
                .into_result()?;
            self.target_cache
                .set_targets_metadata(txn, highest, Some(version))
                .into_result()?;
        }

        self.local_documents
            .get_local_view_of_documents(txn, changed, &existence_changed)
            .into_result()
    }

    /// Allocates a target id for `target`, or returns the existing
    /// allocation. The target is pinned until released.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let data = self.persistence.run_transaction("Allocate target", |txn| {
            PersistencePromise::from_result((|| {
                if let Some(cached) = self
                    .target_cache
                    .get_target_data(txn, &target)
                    .into_result()?
                {
                    return Ok(cached);
                }
                let target_id = self.target_cache.allocate_target_id(txn).into_result()?;
                let data = TargetData::new(target.clone(), target_id, txn.current_sequence_number());
                self.target_cache
                    .add_target_data(txn, data.clone())
                    .into_result()?;
                Ok(data)
            })())
        })?;
        self.target_data_by_id
            .borrow_mut()
            .insert(data.target_id(), data.clone());
        Ok(data)
    }

    /// Releases a previously allocated target. The target data stays in the
    /// cache so the LRU collector can reclaim it and its documents later;
    /// only the sequence number is refreshed to mark the last use.
    pub fn release_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        let data = self.target_data_by_id.borrow_mut().remove(&target_id);
        let Some(data) = data else {
            fail("Tried to release a target that was not allocated");
        };
        self.persistence.run_transaction("Release target", |txn| {
            let updated = data
                .clone()
                .with_sequence_number(txn.current_sequence_number());
            self.target_cache.update_target_data(txn, updated)
        })
    }

    /// Records view changes: which keys entered and left each target's
    /// result set, and whether the view has caught up with the backend.
    pub fn notify_local_view_changes(
        &self,
        changes: Vec<LocalViewChanges>,
    ) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", |txn| {
                PersistencePromise::from_result((|| {
                    for change in &changes {
                        self.target_cache
                            .add_matching_keys(txn, &change.added_keys, change.target_id)
                            .into_result()?;
                        self.target_cache
                            .remove_matching_keys(txn, &change.removed_keys, change.target_id)
                            .into_result()?;
                        if !change.from_cache {
                            self.mark_limbo_free(txn, change.target_id)?;
                        }
                    }
                    Ok(())
                })())
            })
    }

    fn mark_limbo_free(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let mut by_id = self.target_data_by_id.borrow_mut();
        let Some(data) = by_id.get(&target_id) else {
            return Ok(());
        };
        let version = self
            .target_cache
            .get_last_remote_snapshot_version(txn)
            .into_result()?;
        let updated = data
            .clone()
            .with_sequence_number(txn.current_sequence_number())
            .with_last_limbo_free_snapshot_version(version);
        self.target_cache
            .update_target_data(txn, updated.clone())
            .into_result()?;
        by_id.insert(target_id, updated);
        Ok(())
    }

    /// Runs `query` against the local caches. With `use_previous_results`
    /// the engine may re-use the last synced result set of the query's
    /// target instead of scanning.
    pub fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        self.persistence.run_transaction("Execute query", |txn| {
            PersistencePromise::from_result((|| {
                let target = query.to_target();
                let target_data = self
                    .target_cache
                    .get_target_data(txn, &target)
                    .into_result()?;
                let (version, remote_keys) = match target_data {
                    Some(data) if use_previous_results => {
                        let keys = self
                            .target_cache
                            .get_matching_keys_for_target_id(txn, data.target_id())
                            .into_result()?;
                        (*data.last_limbo_free_snapshot_version(), keys)
                    }
                    _ => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let documents = self
                    .query_engine
                    .get_documents_matching_query(txn, query, version, &remote_keys)
                    .into_result()?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })())
        })
    }

    /// Runs one garbage collection pass with the currently allocated targets
    /// as the active set.
    pub fn collect_garbage(
        &self,
        collector: &LruGarbageCollector<MemoryPersistence>,
    ) -> FirestoreResult<LruResults> {
        let active: HashSet<TargetId> = self.target_data_by_id.borrow().keys().copied().collect();
        self.persistence
            .run_transaction("Collect garbage", |txn| collector.collect(txn, &active))
    }

    /// Runs one index backfill pass; returns the number of documents
    /// indexed.
    pub fn backfill_indexes(&self) -> FirestoreResult<usize> {
        self.persistence
            .run_transaction("Backfill indexes", |txn| self.index_backfiller.backfill(txn))
    }

    pub fn persistence(&self) -> Rc<MemoryPersistence> {
        Rc::clone(&self.persistence)
    }

    pub fn index_manager(&self) -> Rc<MemoryIndexManager> {
        Rc::clone(&self.index_manager)
    }

    pub fn local_documents(&self) -> Rc<LocalDocumentsView> {
        Rc::clone(&self.local_documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, ResourcePath};
    use crate::value::{FirestoreValue, MapValue};

    fn store() -> LocalStore {
        LocalStore::new(MemoryPersistence::new(), &User::unauthenticated())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut value = MapValue::empty();
        for (path, v) in entries {
            value.set(&field(path), FirestoreValue::from_integer(*v));
        }
        value
    }

    fn remote_doc(path: &str, seconds: i64, entries: &[(&str, i64)]) -> Document {
        Document::new_found_document(
            key(path),
            SnapshotVersion::new(Timestamp::new(seconds, 0)),
            map(entries),
        )
    }

    #[test]
    fn local_write_is_visible_until_rejected() {
        let store = store();
        let write = store
            .write_locally(vec![Mutation::set(key("coll/a"), map(&[("x", 1)]))])
            .unwrap();
        assert!(write.changes[&key("coll/a")].has_local_mutations());

        let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
        let results = store.execute_query(&query, false).unwrap();
        assert_eq!(results.documents.len(), 1);

        let views = store.reject_batch(write.batch_id).unwrap();
        assert!(!views[&key("coll/a")].is_found_document());
        let results = store.execute_query(&query, false).unwrap();
        assert!(results.documents.is_empty());
    }

    #[test]
    fn acknowledged_batch_keeps_remote_view() {
        let store = store();
        store
            .apply_remote_documents(
                [(key("coll/a"), remote_doc("coll/a", 1, &[("x", 1)]))].into(),
                None,
            )
            .unwrap();
        let write = store
            .write_locally(vec![Mutation::patch(
                key("coll/a"),
                map(&[("x", 2)]),
                crate::model::FieldMask::new([field("x")]),
            )])
            .unwrap();
        assert_eq!(
            write.changes[&key("coll/a")].field(&field("x")),
            Some(&FirestoreValue::from_integer(2))
        );

        let views = store.acknowledge_batch(write.batch_id).unwrap();
        // With the batch gone the view falls back to the cached remote state.
        let doc = &views[&key("coll/a")];
        assert!(!doc.has_local_mutations());
        assert_eq!(doc.field(&field("x")), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn remote_documents_do_not_regress() {
        let store = store();
        store
            .apply_remote_documents(
                [(key("coll/a"), remote_doc("coll/a", 5, &[("x", 5)]))].into(),
                None,
            )
            .unwrap();
        store
            .apply_remote_documents(
                [(key("coll/a"), remote_doc("coll/a", 3, &[("x", 3)]))].into(),
                None,
            )
            .unwrap();
        let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
        let results = store.execute_query(&query, false).unwrap();
        assert_eq!(
            results.documents[&key("coll/a")].field(&field("x")),
            Some(&FirestoreValue::from_integer(5))
        );
    }

    #[test]
    fn allocate_target_is_idempotent() {
        let store = store();
        let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
        let first = store.allocate_target(query.to_target()).unwrap();
        let second = store.allocate_target(query.to_target()).unwrap();
        assert_eq!(first.target_id(), second.target_id());
        store.release_target(first.target_id()).unwrap();
    }

    #[test]
    fn view_changes_enable_result_reuse() {
        let store = store();
        let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
        let target_data = store.allocate_target(query.to_target()).unwrap();

        let version = SnapshotVersion::new(Timestamp::new(10, 0));
        store
            .apply_remote_documents(
                [(key("coll/a"), remote_doc("coll/a", 1, &[("x", 1)]))].into(),
                Some(version),
            )
            .unwrap();
        store
            .notify_local_view_changes(vec![LocalViewChanges {
                target_id: target_data.target_id(),
                from_cache: false,
                added_keys: [key("coll/a")].into_iter().collect(),
                removed_keys: BTreeSet::new(),
            }])
            .unwrap();

        let results = store.execute_query(&query, true).unwrap();
        assert_eq!(results.remote_keys.len(), 1);
        assert_eq!(results.documents.len(), 1);
    }

    #[test]
    fn garbage_collection_drops_released_targets_and_documents() {
        let store = store();
        let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
        let target_data = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_documents(
                [(key("coll/a"), remote_doc("coll/a", 1, &[("x", 1)]))].into(),
                None,
            )
            .unwrap();
        store
            .notify_local_view_changes(vec![LocalViewChanges {
                target_id: target_data.target_id(),
                from_cache: true,
                added_keys: [key("coll/a")].into_iter().collect(),
                removed_keys: BTreeSet::new(),
            }])
            .unwrap();
        store.release_target(target_data.target_id()).unwrap();

        let collector = LruGarbageCollector::new(
            store.persistence(),
            crate::local::lru_garbage_collector::LruParams {
                cache_size_collection_threshold: 0,
                percentile_to_collect: 100,
                maximum_sequence_numbers_to_collect: 1000,
            },
        );
        // The first pass removes the target; its documents become orphaned
        // at the pass's own sequence number and fall in the next pass.
        let results = store.collect_garbage(&collector).unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 0);

        let results = store.collect_garbage(&collector).unwrap();
        assert_eq!(results.documents_removed, 1);

        let results = store.execute_query(&query, false).unwrap();
        assert!(results.documents.is_empty());
    }
}
