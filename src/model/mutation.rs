use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::value::{FirestoreValue, MapValue};

/// Batch id used for overlays computed from documents that carry no
/// pending mutation.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A sorted set of field paths. A mask over a document selects exactly the
/// listed fields; everything else is left untouched by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            fields: BTreeSet::new(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `path` or one of its ancestors is in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        Self {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }
}

/// Overwrites the whole document with the given value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetMutation {
    pub key: DocumentKey,
    pub value: MapValue,
}

/// Merges the masked fields of `data` into the existing document. Fields in
/// the mask but absent from `data` are deleted. A patch only applies to a
/// document that exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchMutation {
    pub key: DocumentKey,
    pub data: MapValue,
    pub field_mask: FieldMask,
}

/// Deletes the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteMutation {
    pub key: DocumentKey,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set(SetMutation),
    Patch(PatchMutation),
    Delete(DeleteMutation),
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set(SetMutation { key, value })
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch(PatchMutation {
            key,
            data,
            field_mask,
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete(DeleteMutation { key })
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set(m) => &m.key,
            Mutation::Patch(m) => &m.key,
            Mutation::Delete(m) => &m.key,
        }
    }

    /// Applies this mutation to `document` for the local view, before the
    /// server has acknowledged it.
    ///
    /// `previous_mask` tracks which fields have been modified by earlier
    /// mutations in the same chain: `None` means the whole document was
    /// replaced, `Some` lists the touched fields. Returns the updated mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        _local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        match self {
            Mutation::Set(set) => {
                document.convert_to_found_document(document.version(), set.value.clone());
                document.set_has_local_mutations();
                None
            }
            Mutation::Patch(patch) => {
                if !document.is_found_document() {
                    return previous_mask;
                }
                apply_patch(document.data_mut(), &patch.data, &patch.field_mask);
                document.set_has_local_mutations();
                previous_mask.map(|mask| mask.union(&patch.field_mask))
            }
            Mutation::Delete(_) => {
                document.convert_to_no_document(SnapshotVersion::min());
                document.set_has_local_mutations();
                None
            }
        }
    }
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match data.field(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

/// Computes the mutation that reproduces the local view of `document` when
/// applied to the remote base. `mask` is the accumulated result of
/// [`Mutation::apply_to_local_view`] over the pending batches.
///
/// Returns `None` when no overlay is needed (nothing pending, or an empty
/// mask).
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    if let Some(mask) = mask {
        if mask.is_empty() {
            return None;
        }
    }

    match mask {
        None => {
            if document.is_no_document() {
                Some(Mutation::delete(document.key().clone()))
            } else {
                Some(Mutation::set(document.key().clone(), document.data().clone()))
            }
        }
        Some(mask) => {
            let mut patch_value = MapValue::empty();
            let mut patch_fields = BTreeSet::new();
            for path in mask.fields() {
                if patch_fields.iter().any(|existing: &FieldPath| {
                    existing.is_prefix_of(path)
                }) {
                    continue;
                }
                match document.field(path) {
                    Some(value) => patch_value.set(path, value.clone()),
                    None => {
                        // A deleted nested field whose parent is also gone
                        // widens the mask to the parent.
                        if path.segments().len() > 1 {
                            let parent =
                                FieldPath::new(path.segments()[..path.segments().len() - 1].to_vec())
                                    .expect("non-empty parent path");
                            if document.field(&parent).is_none() {
                                patch_fields.insert(parent);
                                continue;
                            }
                        }
                    }
                }
                patch_fields.insert(path.clone());
            }
            Some(Mutation::patch(
                document.key().clone(),
                patch_value,
                FieldMask::new(patch_fields),
            ))
        }
    }
}

/// A set of mutations the user issued in one atomic write, tagged with the
/// id the queue assigned and the local wall-clock write time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: i32, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    /// Applies every mutation in this batch that targets `document`,
    /// threading the accumulated field mask through.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies this batch to every entry of `documents`, returning the
    /// per-document masks afterwards.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, Document>,
        masks: &mut BTreeMap<DocumentKey, Option<FieldMask>>,
    ) {
        for mutation in &self.mutations {
            if let Some(document) = documents.get_mut(mutation.key()) {
                let previous = masks
                    .get(mutation.key())
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                let updated =
                    mutation.apply_to_local_view(document, previous, self.local_write_time);
                masks.insert(mutation.key().clone(), updated);
            }
        }
    }
}

/// A mutation precomputed from the pending queue so reads do not have to
/// replay every batch. `largest_batch_id` is the newest batch that
/// contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (path, v) in entries {
            value.set(&field(path), v.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_document_and_clears_mask() {
        let mut doc = Document::new_found_document(
            key("coll/a"),
            version(1),
            map(&[("old", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::set(key("coll/a"), map(&[("new", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(
            &mut doc,
            Some(FieldMask::new([field("old")])),
            Timestamp::new(0, 0),
        );
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&field("old")), None);
        assert_eq!(
            doc.field(&field("new")),
            Some(&FirestoreValue::from_integer(2))
        );
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut doc = Document::new_found_document(
            key("coll/a"),
            version(1),
            map(&[
                ("keep", FirestoreValue::from_integer(1)),
                ("gone", FirestoreValue::from_integer(2)),
            ]),
        );
        let mutation = Mutation::patch(
            key("coll/a"),
            map(&[("added", FirestoreValue::from_integer(3))]),
            FieldMask::new([field("added"), field("gone")]),
        );
        let mask =
            mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(0, 0));
        assert_eq!(doc.field(&field("keep")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(doc.field(&field("gone")), None);
        assert_eq!(doc.field(&field("added")), Some(&FirestoreValue::from_integer(3)));
        let mask = mask.unwrap();
        assert!(mask.covers(&field("added")));
        assert!(mask.covers(&field("gone")));
        assert!(!mask.covers(&field("keep")));
    }

    #[test]
    fn patch_skips_missing_documents() {
        let mut doc = Document::invalid(key("coll/a"));
        let mutation = Mutation::patch(
            key("coll/a"),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::new([field("x")]),
        );
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(0, 0));
        assert!(!doc.is_valid_document());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn delete_produces_local_tombstone() {
        let mut doc = Document::new_found_document(key("coll/a"), version(3), MapValue::empty());
        Mutation::delete(key("coll/a")).apply_to_local_view(&mut doc, None, Timestamp::new(0, 0));
        assert!(doc.is_no_document());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn overlay_for_replaced_document_is_a_set() {
        let mut doc = Document::new_found_document(
            key("coll/a"),
            version(1),
            map(&[("x", FirestoreValue::from_integer(1))]),
        );
        doc.set_has_local_mutations();
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert!(matches!(overlay, Mutation::Set(_)));
    }

    #[test]
    fn overlay_for_patched_document_is_a_patch() {
        let mut doc = Document::new_found_document(
            key("coll/a"),
            version(1),
            map(&[
                ("x", FirestoreValue::from_integer(1)),
                ("y", FirestoreValue::from_integer(2)),
            ]),
        );
        doc.set_has_local_mutations();
        let mask = FieldMask::new([field("y")]);
        match calculate_overlay_mutation(&doc, Some(&mask)).unwrap() {
            Mutation::Patch(patch) => {
                assert_eq!(
                    patch.data.field(&field("y")),
                    Some(&FirestoreValue::from_integer(2))
                );
                assert_eq!(patch.data.field(&field("x")), None);
            }
            other => panic!("expected patch overlay, got {other:?}"),
        }
    }

    #[test]
    fn overlay_for_deleted_document_is_a_delete() {
        let mut doc = Document::new_no_document(key("coll/a"), version(0));
        doc.set_has_local_mutations();
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert!(matches!(overlay, Mutation::Delete(_)));
    }

    #[test]
    fn no_overlay_without_pending_writes() {
        let doc = Document::new_found_document(key("coll/a"), version(1), MapValue::empty());
        assert!(calculate_overlay_mutation(&doc, None).is_none());
    }

    #[test]
    fn batch_applies_mutations_in_order() {
        let mut doc = Document::invalid(key("coll/a"));
        let batch = MutationBatch::new(
            1,
            Timestamp::new(0, 0),
            vec![
                Mutation::set(key("coll/a"), map(&[("x", FirestoreValue::from_integer(1))])),
                Mutation::patch(
                    key("coll/a"),
                    map(&[("y", FirestoreValue::from_integer(2))]),
                    FieldMask::new([field("y")]),
                ),
            ],
        );
        let mask = batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert!(mask.is_none());
        assert_eq!(doc.field(&field("x")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(doc.field(&field("y")), Some(&FirestoreValue::from_integer(2)));
    }
}
