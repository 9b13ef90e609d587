use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::core::{BatchId, Query};
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::local::index_manager::MemoryIndexManager;
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::local::query_context::QueryContext;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::model::{
    calculate_overlay_mutation, Document, DocumentKey, FieldMask, IndexOffset, Mutation, Overlay,
    Timestamp, BATCH_ID_UNKNOWN,
};

/// A page of documents read for index backfill, together with the newest
/// mutation batch that contributed an overlay to it.
pub struct LocalDocumentsResult {
    pub batch_id: BatchId,
    pub documents: BTreeMap<DocumentKey, Document>,
}

/// Merges the remote document cache with pending mutations to produce the
/// documents as the user currently sees them.
///
/// Reads consult precomputed overlays instead of replaying the mutation
/// queue; the queue is only walked when an overlay has become unreliable
/// and must be recalculated.
pub struct LocalDocumentsView {
    remote_documents: Rc<MemoryRemoteDocumentCache>,
    mutation_queue: Rc<MemoryMutationQueue>,
    overlay_cache: Rc<MemoryDocumentOverlayCache>,
    index_manager: Rc<MemoryIndexManager>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Rc<MemoryRemoteDocumentCache>,
        mutation_queue: Rc<MemoryMutationQueue>,
        overlay_cache: Rc<MemoryDocumentOverlayCache>,
        index_manager: Rc<MemoryIndexManager>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlay_cache,
            index_manager,
        }
    }

    /// The local view of a single document: the cached remote version with
    /// its overlay applied, or an invalid document if neither exists.
    pub fn get_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<Document> {
        PersistencePromise::from_result(self.get_document_sync(txn, key))
    }

    /// The local view of each of `keys`. Keys with neither a cached document
    /// nor an overlay map to invalid documents.
    pub fn get_documents(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        PersistencePromise::from_result(self.get_documents_sync(txn, keys))
    }

    /// Applies overlays to the given base documents.
    ///
    /// `existence_changed_keys` are documents whose existence state in the
    /// remote cache just flipped. An overlay computed against the old state
    /// may now be wrong (a patch against a document that no longer exists,
    /// or a missing overlay for a document that reappeared), so those
    /// documents get their overlays recalculated from the mutation queue.
    pub fn get_local_view_of_documents(
        &self,
        txn: &PersistenceTransaction,
        docs: BTreeMap<DocumentKey, Document>,
        existence_changed_keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        PersistencePromise::from_result(self.get_local_view_sync(txn, docs, existence_changed_keys))
    }

    /// Rebuilds the overlays for `keys` from the mutation queue and saves
    /// them. Used after batches are acknowledged or rejected, when the
    /// contribution of the removed batch has to be subtracted.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<()> {
        let result = self
            .remote_documents
            .get_entries(txn, keys)
            .into_result()
            .and_then(|mut docs| self.recalculate_and_save_overlays(txn, &mut docs, keys));
        PersistencePromise::from_result(result)
    }

    /// All documents matching `query`, starting at `offset`. When a context
    /// is given, the number of cache entries scanned is recorded in it.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&QueryContext>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        let result = if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, offset, context)
        } else {
            self.get_documents_matching_collection_query(txn, query, offset, context)
        };
        PersistencePromise::from_result(result)
    }

    /// The next page of documents for `collection_group` after `offset`, as
    /// the index backfiller consumes them. Local-only documents past the
    /// remote page are pulled in through collection group overlays.
    pub fn get_next_documents(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> PersistencePromise<LocalDocumentsResult> {
        PersistencePromise::from_result(
            self.get_next_documents_sync(txn, collection_group, offset, count),
        )
    }

    fn get_document_sync(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Document> {
        let mut document = self.remote_documents.get_entry(txn, key).into_result()?;
        if let Some(overlay) = self.overlay_cache.get_overlay(txn, key).into_result()? {
            overlay
                .mutation
                .apply_to_local_view(&mut document, None, Timestamp::now());
        }
        Ok(document)
    }

    fn get_documents_sync(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let docs = self.remote_documents.get_entries(txn, keys).into_result()?;
        self.get_local_view_sync(txn, docs, &BTreeSet::new())
    }

    fn get_local_view_sync(
        &self,
        txn: &PersistenceTransaction,
        docs: BTreeMap<DocumentKey, Document>,
        existence_changed_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let keys = docs.keys().cloned().collect();
        let overlays = self.overlay_cache.get_overlays(txn, &keys).into_result()?;
        self.compute_views(txn, docs, &overlays, existence_changed_keys)
    }

    fn compute_views(
        &self,
        txn: &PersistenceTransaction,
        mut docs: BTreeMap<DocumentKey, Document>,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_changed_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut recalculate = BTreeSet::new();
        for (key, document) in docs.iter_mut() {
            let overlay = overlays.get(key);
            let overlay_is_reliable = match overlay {
                // A set or delete overlay stands on its own; a patch depends
                // on the base document it was computed against.
                Some(overlay) => !matches!(overlay.mutation, Mutation::Patch(_)),
                None => false,
            };
            if existence_changed_keys.contains(key) && !overlay_is_reliable {
                recalculate.insert(key.clone());
            } else if let Some(overlay) = overlay {
                overlay
                    .mutation
                    .apply_to_local_view(document, None, Timestamp::now());
            }
        }
        self.recalculate_and_save_overlays(txn, &mut docs, &recalculate)?;
        Ok(docs)
    }

    /// Replays the pending batches affecting `keys` over the base documents
    /// in `docs` and stores the resulting overlays, each under the newest
    /// batch that touched its document.
    fn recalculate_and_save_overlays(
        &self,
        txn: &PersistenceTransaction,
        docs: &mut BTreeMap<DocumentKey, Document>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut recalc_docs: BTreeMap<DocumentKey, Document> = keys
            .iter()
            .filter_map(|key| docs.get(key).map(|doc| (key.clone(), doc.clone())))
            .collect();
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = recalc_docs
            .keys()
            .map(|key| (key.clone(), Some(FieldMask::empty())))
            .collect();

        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, keys)
            .into_result()?;

        let mut documents_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                if recalc_docs.contains_key(&key) {
                    documents_by_batch_id
                        .entry(batch.batch_id)
                        .or_default()
                        .insert(key);
                }
            }
            batch.apply_to_local_document_set(&mut recalc_docs, &mut masks);
        }

        // Walk batches newest first so each document's overlay is stored
        // under the largest batch id that touched it.
        let mut processed: BTreeSet<DocumentKey> = BTreeSet::new();
        for (batch_id, batch_keys) in documents_by_batch_id.iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let document = &recalc_docs[key];
                let mask = masks.get(key).cloned().flatten();
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key.clone(), mutation);
                }
            }
            self.overlay_cache
                .save_overlays(txn, *batch_id, overlays)
                .into_result()?;
        }

        for (key, document) in recalc_docs {
            docs.insert(key, document);
        }
        Ok(())
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let key = DocumentKey::from_path(query.path.clone())?;
        let document = self.get_document_sync(txn, &key)?;
        let mut results = BTreeMap::new();
        if document.is_found_document() {
            results.insert(key, document);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&QueryContext>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let collection_id = query
            .collection_group
            .as_deref()
            .unwrap_or_default()
            .to_string();
        let parents = self
            .index_manager
            .get_collection_parents(txn, &collection_id)
            .into_result()?;

        let mut results = BTreeMap::new();
        for parent in parents {
            let collection_query =
                query.as_collection_query_at_path(parent.child([collection_id.as_str()]));
            results.extend(self.get_documents_matching_collection_query(
                txn,
                &collection_query,
                offset,
                context,
            )?);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&QueryContext>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut docs = self
            .remote_documents
            .get_all_from_collection(txn, &query.path, offset)
            .into_result()?;
        let overlays = self
            .overlay_cache
            .get_overlays_for_collection(txn, &query.path, offset.largest_batch_id)
            .into_result()?;
        if let Some(context) = context {
            context.increment_documents_read(docs.len());
        }

        // Documents that only exist locally have no cache entry; the overlay
        // itself establishes them.
        for key in overlays.keys() {
            docs.entry(key.clone())
                .or_insert_with(|| Document::invalid(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in docs {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, None, Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    fn get_next_documents_sync(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<LocalDocumentsResult> {
        let mut docs = self
            .remote_documents
            .get_all_from_collection_group(txn, collection_group, offset, count)
            .into_result()?;
        let overlays = if docs.len() < count {
            self.overlay_cache
                .get_overlays_for_collection_group(
                    txn,
                    collection_group,
                    offset.largest_batch_id,
                    count - docs.len(),
                )
                .into_result()?
        } else {
            BTreeMap::new()
        };

        let mut largest_batch_id = BATCH_ID_UNKNOWN;
        for (key, overlay) in &overlays {
            largest_batch_id = largest_batch_id.max(overlay.largest_batch_id);
            docs.entry(key.clone())
                .or_insert_with(|| Document::invalid(key.clone()));
        }

        let documents = self.get_local_view_sync(txn, docs, &BTreeSet::new())?;
        Ok(LocalDocumentsResult {
            batch_id: largest_batch_id,
            documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::{MemoryPersistence, User};
    use crate::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::value::{FirestoreValue, MapValue};

    struct Fixture {
        persistence: Rc<MemoryPersistence>,
        view: LocalDocumentsView,
    }

    fn fixture() -> Fixture {
        let persistence = MemoryPersistence::new();
        let user = User::authenticated("user");
        let view = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            persistence.mutation_queue(&user),
            persistence.document_overlay_cache(&user),
            persistence.index_manager(),
        );
        Fixture { persistence, view }
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

    fn found(path: &str, seconds: i64, entries: &[(&str, i64)]) -> Document {
        Document::new_found_document(
            key(path),
            SnapshotVersion::new(Timestamp::new(seconds, 0)),
            map(entries),
        )
    }

    fn write(fixture: &Fixture, txn: &PersistenceTransaction, mutations: Vec<Mutation>) {
        let queue = fixture.persistence.mutation_queue(&User::authenticated("user"));
        let batch = queue
            .add_mutation_batch(txn, Timestamp::new(1, 0), mutations)
            .into_result()
            .unwrap();
        let mut docs = fixture
            .view
            .remote_documents
            .get_entries(txn, &batch.keys())
            .into_result()
            .unwrap();
        fixture
            .view
            .recalculate_and_save_overlays(txn, &mut docs, &batch.keys())
            .unwrap();
    }

    #[test]
    fn local_view_applies_pending_set() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                f.view
                    .remote_documents
                    .add_entry(txn, found("coll/a", 1, &[("x", 1)]));
                write(
                    &f,
                    txn,
                    vec![Mutation::set(key("coll/a"), map(&[("x", 2)]))],
                );
                f.view.get_document(txn, &key("coll/a"))
            })
            .map(|doc| {
                assert!(doc.has_local_mutations());
                assert_eq!(doc.field(&field("x")), Some(&FirestoreValue::from_integer(2)));
            })
            .unwrap();
    }

    #[test]
    fn local_only_document_shows_up_in_collection_query() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                f.view
                    .remote_documents
                    .add_entry(txn, found("coll/remote", 1, &[("x", 1)]));
                write(
                    &f,
                    txn,
                    vec![Mutation::set(key("coll/local"), map(&[("x", 5)]))],
                );
                let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
                f.view
                    .get_documents_matching_query(txn, &query, &IndexOffset::min(), None)
            })
            .map(|results| {
                assert_eq!(results.len(), 2);
                assert!(results.contains_key(&key("coll/local")));
                assert!(results.contains_key(&key("coll/remote")));
            })
            .unwrap();
    }

    #[test]
    fn deletion_overlay_hides_document() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                f.view
                    .remote_documents
                    .add_entry(txn, found("coll/a", 1, &[("x", 1)]));
                write(&f, txn, vec![Mutation::delete(key("coll/a"))]);
                let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
                f.view
                    .get_documents_matching_query(txn, &query, &IndexOffset::min(), None)
            })
            .map(|results| assert!(results.is_empty()))
            .unwrap();
    }

    #[test]
    fn patch_on_missing_document_produces_invalid_view() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                write(
                    &f,
                    txn,
                    vec![Mutation::patch(
                        key("coll/missing"),
                        map(&[("x", 1)]),
                        FieldMask::new([field("x")]),
                    )],
                );
                f.view.get_document(txn, &key("coll/missing"))
            })
            .map(|doc| assert!(!doc.is_valid_document()))
            .unwrap();
    }

    #[test]
    fn existence_change_forces_overlay_recalculation() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                // A patch overlay computed while the document was absent.
                write(
                    &f,
                    txn,
                    vec![Mutation::patch(
                        key("coll/a"),
                        map(&[("x", 9)]),
                        FieldMask::new([field("x")]),
                    )],
                );
                // The document then arrives from the backend.
                let base = found("coll/a", 2, &[("y", 1)]);
                f.view.remote_documents.add_entry(txn, base.clone());
                let mut docs = BTreeMap::new();
                docs.insert(key("coll/a"), base);
                let changed = [key("coll/a")].into_iter().collect();
                f.view.get_local_view_of_documents(txn, docs, &changed)
            })
            .map(|results| {
                let doc = &results[&key("coll/a")];
                assert!(doc.is_found_document());
                assert_eq!(doc.field(&field("x")), Some(&FirestoreValue::from_integer(9)));
                assert_eq!(doc.field(&field("y")), Some(&FirestoreValue::from_integer(1)));
            })
            .unwrap();
    }

    #[test]
    fn overlays_store_under_newest_batch() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                write(
                    &f,
                    txn,
                    vec![Mutation::set(key("coll/a"), map(&[("x", 1)]))],
                );
                write(
                    &f,
                    txn,
                    vec![Mutation::patch(
                        key("coll/a"),
                        map(&[("y", 2)]),
                        FieldMask::new([field("y")]),
                    )],
                );
                f.view.overlay_cache.get_overlay(txn, &key("coll/a"))
            })
            .map(|overlay| {
                let overlay = overlay.expect("overlay saved");
                assert_eq!(overlay.largest_batch_id, 2);
                // Both batches collapse into a single set overlay.
                assert!(matches!(overlay.mutation, Mutation::Set(_)));
            })
            .unwrap();
    }

    #[test]
    fn collection_group_query_fans_out_over_parents() {
        let f = fixture();
        f.persistence
            .run_transaction("test", |txn| {
                f.view
                    .remote_documents
                    .add_entry(txn, found("cities/sf/areas/a", 1, &[("x", 1)]));
                f.view
                    .remote_documents
                    .add_entry(txn, found("regions/west/areas/b", 1, &[("x", 2)]));
                let query = Query::collection_group("areas");
                f.view
                    .get_documents_matching_query(txn, &query, &IndexOffset::min(), None)
            })
            .map(|results| {
                assert_eq!(results.len(), 2);
            })
            .unwrap();
    }

    #[test]
    fn query_context_counts_scanned_documents() {
        let f = fixture();
        let context = QueryContext::new();
        f.persistence
            .run_transaction("test", |txn| {
                f.view
                    .remote_documents
                    .add_entry(txn, found("coll/a", 1, &[("x", 1)]));
                f.view
                    .remote_documents
                    .add_entry(txn, found("coll/b", 1, &[("x", 2)]));
                let query = Query::at_path(ResourcePath::from_string("coll").unwrap());
                f.view
                    .get_documents_matching_query(txn, &query, &IndexOffset::min(), Some(&context))
            })
            .unwrap();
        assert_eq!(context.documents_read(), 2);
    }
}
