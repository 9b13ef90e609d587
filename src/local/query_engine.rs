use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::core::{LimitType, Query};
use crate::error::FirestoreResult;
use crate::local::index_manager::{IndexType, MemoryIndexManager};
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::local::query_context::QueryContext;
use crate::model::{
    Document, DocumentKey, IndexOffset, SnapshotVersion, INITIAL_LARGEST_BATCH_ID,
};
use crate::util::assert::hard_assert;

const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: usize = 4;

/// Executes queries against cached documents, picking the cheapest strategy
/// that is still correct:
///
/// 1. an index scan, when installed field indexes cover the target;
/// 2. replaying the previously synced result set, when the target has been
///    listened to before and the old results are still trustworthy;
/// 3. a full collection scan.
///
/// All three produce the same document set for the same inputs; the
/// fallbacks trade speed, never correctness.
pub struct QueryEngine {
    local_documents: Rc<LocalDocumentsView>,
    index_manager: Rc<MemoryIndexManager>,
    index_auto_creation_enabled: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: usize,
}

impl QueryEngine {
    pub fn new(
        local_documents: Rc<LocalDocumentsView>,
        index_manager: Rc<MemoryIndexManager>,
    ) -> Self {
        Self {
            local_documents,
            index_manager,
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size:
                DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation_enabled = enabled;
    }

    pub fn set_index_auto_creation_min_collection_size(&mut self, size: usize) {
        self.index_auto_creation_min_collection_size = size;
    }

    pub fn set_relative_index_read_cost_per_document(&mut self, cost: usize) {
        self.relative_index_read_cost_per_document = cost;
    }

    /// Returns the local view of all documents matching `query`.
    ///
    /// `last_limbo_free_snapshot_version` and `remote_keys` come from the
    /// target cache entry of a previously listened target, or the minimum
    /// version and an empty set for a fresh query.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        let result = (|| {
            if let Some(results) = self.perform_query_using_index(txn, query)? {
                return Ok(results);
            }
            if let Some(results) = self.perform_query_using_remote_keys(
                txn,
                query,
                remote_keys,
                last_limbo_free_snapshot_version,
            )? {
                return Ok(results);
            }
            self.execute_full_collection_scan(txn, query)
        })();
        PersistencePromise::from_result(result)
    }

    /// Strategy 1: answer from field indexes. `None` when no installed index
    /// covers the target, or when an unfiltered scan is cheaper anyway.
    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() {
            return Ok(None);
        }

        let target = query.to_target();
        let index_type = self.index_manager.get_index_type(txn, &target).into_result()?;
        if index_type == IndexType::None {
            return Ok(None);
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // A partial index may miss matches, so cutting off at the limit
            // could drop documents the full result would contain. Re-run
            // without the limit and let the caller's view re-apply it.
            let mut unlimited = query.clone();
            unlimited.limit = None;
            return self.perform_query_using_index(txn, &unlimited);
        }

        let keys = self
            .index_manager
            .get_documents_matching_target(txn, &target)
            .into_result()?;
        hard_assert(
            keys.is_some(),
            "index manager must return results for partial and full indexes.",
        );
        let keys: BTreeSet<DocumentKey> = keys.unwrap_or_default().into_iter().collect();
        let indexed_documents = self.local_documents.get_documents(txn, &keys).into_result()?;
        let offset = self.index_manager.get_min_offset(txn, &target).into_result()?;

        log::debug!("Using index scan to execute query: {}", query.canonical_id());
        let previous_results = apply_query(query, indexed_documents);
        self.append_remaining_results(txn, query, previous_results, &offset)
            .map(Some)
    }

    /// Strategy 2: re-use the key set the backend last confirmed for this
    /// target and merge in everything written since. `None` when the target
    /// was never synced or the old results can no longer be trusted.
    fn perform_query_using_remote_keys(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        if last_limbo_free_snapshot_version == SnapshotVersion::min() {
            return Ok(None);
        }

        let documents = self.local_documents.get_documents(txn, remote_keys).into_result()?;
        let previous_results = apply_query(query, documents);

        if query.has_limit()
            && needs_refill(
                query.limit_type,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return Ok(None);
        }

        log::debug!(
            "Re-using previous result from {:?} to execute query: {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        // Documents written after the last sync are picked up through the
        // read-time watermark.
        let offset =
            IndexOffset::successor_of(last_limbo_free_snapshot_version, INITIAL_LARGEST_BATCH_ID);
        self.append_remaining_results(txn, query, previous_results, &offset)
            .map(Some)
    }

    /// Strategy 3: scan everything. Counts the documents touched and, when
    /// auto-creation is on, installs indexes for queries where the scan was
    /// disproportionately expensive.
    fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        log::debug!(
            "Using full collection scan to execute query: {}",
            query.canonical_id()
        );
        let context = QueryContext::new();
        let results = self
            .local_documents
            .get_documents_matching_query(txn, query, &IndexOffset::min(), Some(&context))
            .into_result()?;
        if self.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, results.len())?;
        }
        Ok(results)
    }

    fn create_cache_indexes(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        if context.documents_read() < self.index_auto_creation_min_collection_size {
            log::debug!(
                "Skipping index creation for {}; the collection is below {} documents",
                query.canonical_id(),
                self.index_auto_creation_min_collection_size
            );
            return Ok(());
        }
        log::debug!(
            "Query {} scanned {} documents to return {} results",
            query.canonical_id(),
            context.documents_read(),
            result_size
        );
        if context.documents_read() > self.relative_index_read_cost_per_document * result_size {
            self.index_manager
                .create_target_indexes(txn, &query.to_target())
                .into_result()?;
            log::debug!("Creating cache indexes for query: {}", query.canonical_id());
        }
        Ok(())
    }

    /// Merges documents changed after `offset` into `indexed_results`;
    /// documents read from the cache win over the stale entries.
    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        indexed_results: Vec<Document>,
        offset: &IndexOffset,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut results: BTreeMap<DocumentKey, Document> = indexed_results
            .into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect();
        let newer = self
            .local_documents
            .get_documents_matching_query(txn, query, offset, None)
            .into_result()?;
        results.extend(newer);
        Ok(results)
    }
}

/// Filters, sorts, and limits `documents` according to `query`.
fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, Document>) -> Vec<Document> {
    let mut matched: Vec<Document> = documents
        .into_values()
        .filter(|doc| query.matches(doc))
        .collect();
    matched.sort_by(|a, b| query.compare_docs(a, b));
    if let Some(limit) = query.limit {
        let limit = limit.max(0) as usize;
        match query.limit_type {
            LimitType::First => matched.truncate(limit),
            LimitType::Last => {
                let skip = matched.len().saturating_sub(limit);
                matched.drain(..skip);
            }
        }
    }
    matched
}

/// Whether a limited query needs to fall back to a wider scan.
///
/// The previous results cannot be re-used when documents dropped out of the
/// set (something else may have moved into the limit window), or when the
/// boundary document has pending writes or was written after the last sync
/// (its sort position is unreliable).
fn needs_refill(
    limit_type: LimitType,
    sorted_previous_results: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let boundary = match limit_type {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match boundary {
        None => false,
        Some(doc) => {
            doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version
        }
    }
}
