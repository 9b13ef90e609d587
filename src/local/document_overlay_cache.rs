use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::BatchId;
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::model::{DocumentKey, Mutation, Overlay, ResourcePath};

/// Caches one condensed mutation per locally changed document: the single
/// mutation whose local application reproduces the net effect of every
/// pending batch on that document. Kept per user.
#[derive(Default)]
pub struct MemoryDocumentOverlayCache {
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    overlays: BTreeMap<DocumentKey, Overlay>,
    by_batch_id: HashMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<Option<Overlay>> {
        PersistencePromise::resolve(self.inner.borrow().overlays.get(key).cloned())
    }

    pub fn get_overlays(
        &self,
        _txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Overlay>> {
        let inner = self.inner.borrow();
        let result = keys
            .iter()
            .filter_map(|key| inner.overlays.get(key).map(|o| (key.clone(), o.clone())))
            .collect();
        PersistencePromise::resolve(result)
    }

    /// Replaces the overlays for the given documents. `largest_batch_id` is
    /// the id of the newest batch contributing to any of them.
    pub fn save_overlays(
        &self,
        _txn: &PersistenceTransaction,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        for (key, mutation) in overlays {
            inner.remove_overlay(&key);
            inner
                .by_batch_id
                .entry(largest_batch_id)
                .or_default()
                .insert(key.clone());
            inner
                .overlays
                .insert(key, Overlay::new(largest_batch_id, mutation));
        }
        PersistencePromise::resolve(())
    }

    pub fn remove_overlays_for_batch_id(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(keys) = inner.by_batch_id.remove(&batch_id) {
            for key in keys {
                inner.overlays.remove(&key);
            }
        }
        PersistencePromise::resolve(())
    }

    /// Overlays for documents directly inside `collection` produced by a
    /// batch newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        _txn: &PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Overlay>> {
        let inner = self.inner.borrow();
        let start = DocumentKey::from_path(collection.child([""]))
            .unwrap_or_else(|_| DocumentKey::empty());
        let result = inner
            .overlays
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| key.path().len() == collection.len() + 1)
            .filter(|(_, overlay)| overlay.largest_batch_id > since_batch_id)
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect();
        PersistencePromise::resolve(result)
    }

    /// Overlays for a collection group, newest batches excluded once `count`
    /// is reached. Batches are never split: all overlays of the batch that
    /// crosses the threshold are included.
    pub fn get_overlays_for_collection_group(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> PersistencePromise<BTreeMap<DocumentKey, Overlay>> {
        let inner = self.inner.borrow();
        let mut candidates: Vec<(&DocumentKey, &Overlay)> = inner
            .overlays
            .iter()
            .filter(|(key, _)| key.has_collection_id(collection_group))
            .filter(|(_, overlay)| overlay.largest_batch_id > since_batch_id)
            .collect();
        candidates.sort_by_key(|(key, overlay)| (overlay.largest_batch_id, (*key).clone()));

        let mut result = BTreeMap::new();
        let mut current_batch_id = None;
        for (key, overlay) in candidates {
            if result.len() >= count && current_batch_id != Some(overlay.largest_batch_id) {
                break;
            }
            current_batch_id = Some(overlay.largest_batch_id);
            result.insert(key.clone(), overlay.clone());
        }
        PersistencePromise::resolve(result)
    }

    /// The serialized footprint of every overlay, counted against the garbage
    /// collector's size threshold.
    pub fn byte_size(&self) -> u64 {
        self.inner
            .borrow()
            .overlays
            .iter()
            .map(|(key, overlay)| entry_size(key, overlay))
            .sum()
    }
}

fn entry_size(key: &DocumentKey, overlay: &Overlay) -> u64 {
    let value_size = serde_json::to_vec(overlay).map(|v| v.len()).unwrap_or(0);
    (key.path().canonical_string().len() + value_size) as u64
}

impl Inner {
    fn remove_overlay(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.remove(key) {
            if let Some(keys) = self.by_batch_id.get_mut(&existing.largest_batch_id) {
                keys.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapValue;

    fn txn() -> PersistenceTransaction {
        PersistenceTransaction::new(1)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn save(cache: &MemoryDocumentOverlayCache, batch_id: BatchId, paths: &[&str]) {
        let overlays = paths
            .iter()
            .map(|p| (key(p), Mutation::set(key(p), MapValue::default())))
            .collect();
        cache
            .save_overlays(&txn(), batch_id, overlays)
            .into_result()
            .unwrap();
    }

    #[test]
    fn saving_replaces_older_overlays() {
        let cache = MemoryDocumentOverlayCache::new();
        save(&cache, 1, &["rooms/a"]);
        save(&cache, 2, &["rooms/a"]);

        let overlay = cache
            .get_overlay(&txn(), &key("rooms/a"))
            .into_result()
            .unwrap()
            .unwrap();
        assert_eq!(overlay.largest_batch_id, 2);

        // The key moved to batch 2, so removing batch 1 must not touch it.
        cache
            .remove_overlays_for_batch_id(&txn(), 1)
            .into_result()
            .unwrap();
        assert!(cache
            .get_overlay(&txn(), &key("rooms/a"))
            .into_result()
            .unwrap()
            .is_some());
    }

    #[test]
    fn remove_overlays_for_batch_clears_entries() {
        let cache = MemoryDocumentOverlayCache::new();
        save(&cache, 1, &["rooms/a", "rooms/b"]);
        cache
            .remove_overlays_for_batch_id(&txn(), 1)
            .into_result()
            .unwrap();
        assert!(cache
            .get_overlay(&txn(), &key("rooms/a"))
            .into_result()
            .unwrap()
            .is_none());
    }

    #[test]
    fn collection_lookup_filters_by_batch_and_depth() {
        let cache = MemoryDocumentOverlayCache::new();
        save(&cache, 1, &["rooms/a"]);
        save(&cache, 2, &["rooms/b", "rooms/a/messages/m"]);

        let collection = ResourcePath::from_string("rooms").unwrap();
        let overlays = cache
            .get_overlays_for_collection(&txn(), &collection, 1)
            .into_result()
            .unwrap();
        assert_eq!(overlays.len(), 1);
        assert!(overlays.contains_key(&key("rooms/b")));
    }

    #[test]
    fn byte_size_tracks_stored_overlays() {
        let cache = MemoryDocumentOverlayCache::new();
        assert_eq!(cache.byte_size(), 0);
        save(&cache, 1, &["rooms/a", "rooms/b"]);
        assert!(cache.byte_size() > 0);
        cache
            .remove_overlays_for_batch_id(&txn(), 1)
            .into_result()
            .unwrap();
        assert_eq!(cache.byte_size(), 0);
    }

    #[test]
    fn collection_group_lookup_keeps_batches_whole() {
        let cache = MemoryDocumentOverlayCache::new();
        save(&cache, 1, &["a/x/messages/1"]);
        save(&cache, 2, &["b/y/messages/2", "c/z/messages/3"]);
        save(&cache, 3, &["d/w/messages/4"]);

        let overlays = cache
            .get_overlays_for_collection_group(&txn(), "messages", -1, 2)
            .into_result()
            .unwrap();
        // Batch 2 crosses the threshold and is included whole; batch 3 is not.
        assert_eq!(overlays.len(), 3);
        assert!(!overlays.contains_key(&key("d/w/messages/4")));
    }
}
