use std::collections::BTreeSet;

use crate::core::TargetId;
use crate::model::DocumentKey;

/// A bidirectional mapping between document keys and numeric ids (target ids
/// or batch ids). Kept sorted both ways so that either side can be range
/// scanned.
#[derive(Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_id: BTreeSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_key.insert((key.clone(), id));
        self.by_id.insert((id, key));
    }

    pub fn add_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: TargetId,
    ) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: TargetId,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Removes all references for the given id and returns the keys that
    /// carried them.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self
            .by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect();
        for key in &keys {
            self.by_key.remove(&(key.clone(), id));
            self.by_id.remove(&(id, key.clone()));
        }
        keys
    }

    pub fn references_for_id(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .is_some_and(|(entry_key, _)| entry_key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn add_and_remove_references() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("rooms/a"), 1);
        set.add_reference(key("rooms/b"), 1);
        set.add_reference(key("rooms/a"), 2);

        assert!(set.contains_key(&key("rooms/a")));
        assert_eq!(set.references_for_id(1).len(), 2);

        set.remove_reference(&key("rooms/a"), 1);
        assert!(set.contains_key(&key("rooms/a")), "still referenced by 2");

        set.remove_reference(&key("rooms/a"), 2);
        assert!(!set.contains_key(&key("rooms/a")));
    }

    #[test]
    fn remove_references_for_id_returns_keys() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("rooms/a"), 1);
        set.add_reference(key("rooms/b"), 1);
        set.add_reference(key("rooms/c"), 2);

        let removed = set.remove_references_for_id(1);
        assert_eq!(removed, vec![key("rooms/a"), key("rooms/b")]);
        assert!(!set.contains_key(&key("rooms/a")));
        assert!(set.contains_key(&key("rooms/c")));
        assert!(!set.is_empty());
    }
}
