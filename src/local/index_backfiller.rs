use std::collections::HashSet;
use std::rc::Rc;

use crate::error::FirestoreResult;
use crate::local::index_manager::MemoryIndexManager;
use crate::local::local_documents_view::{LocalDocumentsResult, LocalDocumentsView};
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::model::IndexOffset;

pub const DEFAULT_MAX_DOCUMENTS_TO_PROCESS: usize = 50;

/// Populates field indexes in the background, one collection group at a
/// time, resuming from each group's stored offset.
pub struct IndexBackfiller {
    local_documents: Rc<LocalDocumentsView>,
    index_manager: Rc<MemoryIndexManager>,
    max_documents_to_process: usize,
}

impl IndexBackfiller {
    pub fn new(
        local_documents: Rc<LocalDocumentsView>,
        index_manager: Rc<MemoryIndexManager>,
    ) -> Self {
        Self {
            local_documents,
            index_manager,
            max_documents_to_process: DEFAULT_MAX_DOCUMENTS_TO_PROCESS,
        }
    }

    pub fn set_max_documents_to_process(&mut self, max: usize) {
        self.max_documents_to_process = max;
    }

    /// Indexes up to `max_documents_to_process` documents, visiting the
    /// stalest collection groups first. Returns how many were indexed.
    pub fn backfill(&self, txn: &PersistenceTransaction) -> PersistencePromise<usize> {
        PersistencePromise::from_result(self.write_index_entries(txn))
    }

    fn write_index_entries(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize> {
        let mut processed_groups: HashSet<String> = HashSet::new();
        let mut documents_remaining = self.max_documents_to_process;
        while documents_remaining > 0 {
            let group = self
                .index_manager
                .get_next_collection_group_to_update(txn)
                .into_result()?;
            let Some(group) = group else { break };
            if !processed_groups.insert(group.clone()) {
                break;
            }
            let processed =
                self.write_entries_for_collection_group(txn, &group, documents_remaining)?;
            documents_remaining -= processed;
        }
        Ok(self.max_documents_to_process - documents_remaining)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        documents_remaining: usize,
    ) -> FirestoreResult<usize> {
        let existing_offset = self
            .index_manager
            .get_min_offset_for_collection_group(txn, collection_group)
            .into_result()?;
        let next_batch = self
            .local_documents
            .get_next_documents(txn, collection_group, &existing_offset, documents_remaining)
            .into_result()?;
        self.index_manager
            .update_index_entries(txn, &next_batch.documents)
            .into_result()?;

        let new_offset = new_offset_after(&existing_offset, &next_batch);
        log::debug!(
            "Updating offset for collection group {collection_group} to {new_offset:?}"
        );
        self.index_manager
            .update_collection_group(txn, collection_group, new_offset)
            .into_result()?;
        Ok(next_batch.documents.len())
    }
}

/// The offset to store after indexing `batch`: the largest read time and key
/// among the indexed documents, and the newest overlay batch id seen.
fn new_offset_after(existing_offset: &IndexOffset, batch: &LocalDocumentsResult) -> IndexOffset {
    let mut max_offset = existing_offset.clone();
    for document in batch.documents.values() {
        let document_offset = IndexOffset::from_document(document);
        if document_offset > max_offset {
            max_offset = document_offset;
        }
    }
    IndexOffset {
        read_time: max_offset.read_time,
        document_key: max_offset.document_key,
        largest_batch_id: batch.batch_id.max(existing_offset.largest_batch_id),
    }
}
