use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::local::index_manager::MemoryIndexManager;
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::model::{Document, DocumentKey, IndexOffset, ResourcePath};

/// In-memory copy of documents received from the backend, keyed by document
/// key and stamped with the read time they were received at.
pub struct MemoryRemoteDocumentCache {
    index_manager: Rc<MemoryIndexManager>,
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocumentKey, Document>,
    size: u64,
}

impl MemoryRemoteDocumentCache {
    pub fn new(index_manager: Rc<MemoryIndexManager>) -> Self {
        Self {
            index_manager,
            inner: RefCell::new(Inner::default()),
        }
    }

    /// Adds or replaces an entry. The document must carry the read time it
    /// was received at.
    pub fn add_entry(
        &self,
        txn: &PersistenceTransaction,
        document: Document,
    ) -> PersistencePromise<()> {
        let key = document.key().clone();
        let mut inner = self.inner.borrow_mut();
        if let Some(previous) = inner.docs.get(&key) {
            let previous_size = entry_size(previous);
            inner.size -= previous_size;
        }
        inner.size += entry_size(&document);
        inner.docs.insert(key.clone(), document);
        drop(inner);

        self.index_manager
            .add_to_collection_parent_index(txn, &key.collection_path())
    }

    pub fn remove_entry(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(previous) = inner.docs.remove(key) {
            let previous_size = entry_size(&previous);
            inner.size -= previous_size;
        }
        PersistencePromise::resolve(())
    }

    /// Looks up an entry, returning an invalid document when none is cached
    /// so callers can distinguish "unknown" from "known missing".
    pub fn get_entry(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<Document> {
        let inner = self.inner.borrow();
        let document = inner
            .docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::invalid(key.clone()));
        PersistencePromise::resolve(document)
    }

    pub fn get_entries(
        &self,
        _txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        let inner = self.inner.borrow();
        let results = keys
            .iter()
            .map(|key| {
                let document = inner
                    .docs
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| Document::invalid(key.clone()));
                (key.clone(), document)
            })
            .collect();
        PersistencePromise::resolve(results)
    }

    /// All documents directly inside `collection` changed after `offset`.
    pub fn get_all_from_collection(
        &self,
        _txn: &PersistenceTransaction,
        collection: &ResourcePath,
        offset: &IndexOffset,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        let inner = self.inner.borrow();
        // The empty segment sorts before all document ids in the collection.
        let start = DocumentKey::from_path(collection.child([""]))
            .unwrap_or_else(|_| DocumentKey::empty());
        let results = inner
            .docs
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| key.path().len() == collection.len() + 1)
            .filter(|(_, doc)| offset.sorts_before_document(doc))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();
        PersistencePromise::resolve(results)
    }

    /// Documents in any collection named `collection_group` changed after
    /// `offset`, up to `limit` entries in offset order.
    pub fn get_all_from_collection_group(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Document>> {
        let inner = self.inner.borrow();
        let mut matches: Vec<&Document> = inner
            .docs
            .values()
            .filter(|doc| doc.key().has_collection_id(collection_group))
            .filter(|doc| offset.sorts_before_document(doc))
            .collect();
        matches.sort_by(|a, b| IndexOffset::from_document(a).cmp(&IndexOffset::from_document(b)));
        let results = matches
            .into_iter()
            .take(limit)
            .map(|doc| (doc.key().clone(), doc.clone()))
            .collect();
        PersistencePromise::resolve(results)
    }

    pub fn byte_size(&self) -> u64 {
        self.inner.borrow().size
    }

    pub(crate) fn document_keys(&self) -> Vec<DocumentKey> {
        self.inner.borrow().docs.keys().cloned().collect()
    }
}

/// Approximate storage footprint of an entry, used for the garbage
/// collection threshold.
fn entry_size(document: &Document) -> u64 {
    let value_size = serde_json::to_vec(document).map(|v| v.len()).unwrap_or(0);
    (document.key().path().canonical_string().len() + value_size) as u64
}
