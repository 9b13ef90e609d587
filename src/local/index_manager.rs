use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::{Operator, Target};
use crate::local::index_byte_encoder::IndexByteEncoder;
use crate::local::index_entry::{byte_successor, IndexEntry};
use crate::local::index_value_writer::write_index_value;
use crate::local::persistence::PersistenceTransaction;
use crate::local::persistence_promise::PersistencePromise;
use crate::local::target_index_matcher::TargetIndexMatcher;
use crate::model::{
    Document, DocumentKey, FieldIndex, IndexOffset, IndexState, ResourcePath, UNKNOWN_INDEX_ID,
};
use crate::util::assert::hard_assert;
use crate::value::{FirestoreValue, ValueKind};

/// How completely the available indexes cover a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    /// No index covers the target.
    None,
    /// An index covers some of the target's constraints; its results are a
    /// superset that needs post-filtering.
    Partial,
    /// An index covers the target exactly.
    Full,
}

/// Maintains the queryable indexes: the collection parent index that backs
/// collection group queries, and client-defined field indexes with their
/// entries.
pub struct MemoryIndexManager {
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    collection_parents: HashMap<String, BTreeSet<ResourcePath>>,
    indexes: HashMap<String, Vec<FieldIndex>>,
    next_index_id: i32,
    update_sequence: i64,
    entries: BTreeSet<IndexEntry>,
    entries_by_document: HashMap<(i32, DocumentKey), BTreeSet<IndexEntry>>,
}

impl Default for MemoryIndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner::default()),
        }
    }

    /// Records that a collection with this path exists, so collection group
    /// queries can find it.
    pub fn add_to_collection_parent_index(
        &self,
        _txn: &PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> PersistencePromise<()> {
        if let Some(collection_id) = collection_path.last_segment() {
            self.inner
                .borrow_mut()
                .collection_parents
                .entry(collection_id.to_string())
                .or_default()
                .insert(collection_path.pop_last());
        }
        PersistencePromise::resolve(())
    }

    pub fn get_collection_parents(
        &self,
        _txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> PersistencePromise<Vec<ResourcePath>> {
        let inner = self.inner.borrow();
        let parents = inner
            .collection_parents
            .get(collection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        PersistencePromise::resolve(parents)
    }

    pub fn add_field_index(
        &self,
        _txn: &PersistenceTransaction,
        mut index: FieldIndex,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        if index.index_id == UNKNOWN_INDEX_ID {
            index.index_id = inner.next_index_id;
        }
        inner.next_index_id = inner.next_index_id.max(index.index_id + 1);
        log::debug!(
            "Adding field index {} on collection group {}",
            index.index_id,
            index.collection_group
        );
        inner
            .indexes
            .entry(index.collection_group.clone())
            .or_default()
            .push(index);
        PersistencePromise::resolve(())
    }

    pub fn delete_field_index(
        &self,
        _txn: &PersistenceTransaction,
        index: &FieldIndex,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(group) = inner.indexes.get_mut(&index.collection_group) {
            group.retain(|candidate| candidate.index_id != index.index_id);
        }
        inner.entries.retain(|entry| entry.index_id != index.index_id);
        inner
            .entries_by_document
            .retain(|(index_id, _), _| *index_id != index.index_id);
        PersistencePromise::resolve(())
    }

    pub fn get_field_indexes(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: &str,
    ) -> PersistencePromise<Vec<FieldIndex>> {
        let inner = self.inner.borrow();
        PersistencePromise::resolve(inner.indexes.get(collection_group).cloned().unwrap_or_default())
    }

    /// How well the installed indexes serve `target`, considering every
    /// disjunction term. A limit on a multi-term target downgrades a full
    /// answer: the per-term limits cannot be combined into a global one.
    pub fn get_index_type(
        &self,
        _txn: &PersistenceTransaction,
        target: &Target,
    ) -> PersistencePromise<IndexType> {
        let inner = self.inner.borrow();
        let sub_targets = target.dnf_sub_targets();
        let mut result = IndexType::Full;
        for sub_target in &sub_targets {
            match inner.best_index(sub_target) {
                None => {
                    result = IndexType::None;
                    break;
                }
                Some(index) => {
                    if index.segments.len() < target_segment_count(sub_target) {
                        result = IndexType::Partial;
                    }
                }
            }
        }
        if result == IndexType::Full && target.limit.is_some() && sub_targets.len() > 1 {
            result = IndexType::Partial;
        }
        PersistencePromise::resolve(result)
    }

    /// Runs index scans for `target` and returns the union of matching keys
    /// over its disjunction terms, or `None` when some term has no index.
    /// The result may over-approximate and callers re-check matches.
    pub fn get_documents_matching_target(
        &self,
        _txn: &PersistenceTransaction,
        target: &Target,
    ) -> PersistencePromise<Option<Vec<DocumentKey>>> {
        let inner = self.inner.borrow();
        let mut keys = BTreeSet::new();
        for sub_target in target.dnf_sub_targets() {
            let Some(index) = inner.best_index(&sub_target) else {
                return PersistencePromise::resolve(None);
            };
            log::debug!(
                "Using index {} to execute {}",
                index.index_id,
                target.canonical_id()
            );
            inner.scan_index(&index, &sub_target, &mut keys);
        }
        PersistencePromise::resolve(Some(keys.into_iter().collect()))
    }

    /// The earliest backfill offset among the indexes serving `target`.
    /// Documents written after it are not guaranteed to be indexed yet.
    pub fn get_min_offset(
        &self,
        _txn: &PersistenceTransaction,
        target: &Target,
    ) -> PersistencePromise<IndexOffset> {
        let inner = self.inner.borrow();
        let offsets: Vec<IndexOffset> = target
            .dnf_sub_targets()
            .iter()
            .filter_map(|sub| inner.best_index(sub).map(|index| index.offset().clone()))
            .collect();
        PersistencePromise::resolve(offsets.into_iter().min().unwrap_or_else(IndexOffset::min))
    }

    pub fn get_min_offset_for_collection_group(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: &str,
    ) -> PersistencePromise<IndexOffset> {
        let inner = self.inner.borrow();
        let offset = inner
            .indexes
            .get(collection_group)
            .and_then(|indexes| indexes.iter().map(|i| i.offset().clone()).min())
            .unwrap_or_else(IndexOffset::min);
        PersistencePromise::resolve(offset)
    }

    /// The collection group whose indexes have waited longest for backfill.
    pub fn get_next_collection_group_to_update(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<Option<String>> {
        let inner = self.inner.borrow();
        let group = inner
            .indexes
            .iter()
            .filter(|(_, indexes)| !indexes.is_empty())
            .min_by_key(|(group, indexes)| {
                let sequence = indexes
                    .iter()
                    .map(|i| i.index_state.sequence_number)
                    .min()
                    .unwrap_or(0);
                (sequence, (*group).clone())
            })
            .map(|(group, _)| group.clone());
        PersistencePromise::resolve(group)
    }

    /// Advances the backfill state of every index in the group.
    pub fn update_collection_group(
        &self,
        _txn: &PersistenceTransaction,
        collection_group: &str,
        offset: IndexOffset,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        inner.update_sequence += 1;
        let sequence = inner.update_sequence;
        if let Some(indexes) = inner.indexes.get_mut(collection_group) {
            for index in indexes.iter_mut() {
                index.index_state = IndexState::new(sequence, offset.clone());
            }
        }
        PersistencePromise::resolve(())
    }

    /// Re-indexes the given documents under every index of their collection
    /// groups, replacing stale entries.
    pub fn update_index_entries(
        &self,
        _txn: &PersistenceTransaction,
        documents: &BTreeMap<DocumentKey, Document>,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        for (key, document) in documents {
            let group = key.collection_group().to_string();
            let indexes = inner.indexes.get(&group).cloned().unwrap_or_default();
            for index in indexes {
                let new_entries = compute_index_entries(&index, document);
                let slot = (index.index_id, key.clone());
                let old_entries = inner.entries_by_document.remove(&slot).unwrap_or_default();
                for stale in old_entries.difference(&new_entries) {
                    inner.entries.remove(stale);
                }
                for fresh in new_entries.difference(&old_entries) {
                    inner.entries.insert(fresh.clone());
                }
                if new_entries.is_empty() {
                    inner.entries_by_document.remove(&slot);
                } else {
                    inner.entries_by_document.insert(slot, new_entries);
                }
            }
        }
        PersistencePromise::resolve(())
    }

    /// Creates the indexes `target` would need for a full answer, where they
    /// do not exist yet.
    pub fn create_target_indexes(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> PersistencePromise<()> {
        let sub_targets = target.dnf_sub_targets();
        let missing: Vec<FieldIndex> = {
            let inner = self.inner.borrow();
            sub_targets
                .iter()
                .filter(|sub| inner.best_index(sub).is_none())
                .map(|sub| TargetIndexMatcher::new(sub).build_target_index())
                .collect()
        };
        let mut chain = PersistencePromise::resolve(());
        for index in missing {
            if index.segments.is_empty() {
                continue;
            }
            let added = self.add_field_index(txn, index);
            chain = chain.next(move |()| added);
        }
        chain
    }
}

impl Inner {
    /// The serving index with the most segments, if any serves.
    fn best_index(&self, sub_target: &Target) -> Option<FieldIndex> {
        let collection_id = sub_target.collection_id()?;
        let candidates = self.indexes.get(collection_id)?;
        let matcher = TargetIndexMatcher::new(sub_target);
        candidates
            .iter()
            .filter(|index| matcher.served_by_index(index))
            .max_by_key(|index| index.segments.len())
            .cloned()
    }

    /// Collects the keys of all entries within the scan ranges the
    /// sub-target induces on `index`.
    fn scan_index(&self, index: &FieldIndex, sub_target: &Target, keys: &mut BTreeSet<DocumentKey>) {
        let array_encodings: Vec<Vec<u8>> = match sub_target.array_values(index) {
            Some(values) => values.iter().map(encode_single_element).collect(),
            None => vec![Vec::new()],
        };

        let lower = sub_target.lower_bound(index);
        let upper = sub_target.upper_bound(index);
        let lower_encodings = encode_positions(index, sub_target, &lower.position);
        let upper_encodings = encode_positions(index, sub_target, &upper.position);
        hard_assert(
            lower_encodings.len() == upper_encodings.len(),
            "Expected the same number of lower and upper bounds",
        );

        let excluded_encodings = self.encode_excluded_positions(index, sub_target, &lower.position);

        for array_value in &array_encodings {
            for (lower_bytes, upper_bytes) in lower_encodings.iter().zip(&upper_encodings) {
                let start = IndexEntry::new(
                    index.index_id,
                    array_value.clone(),
                    if lower.inclusive {
                        lower_bytes.clone()
                    } else {
                        byte_successor(lower_bytes)
                    },
                    DocumentKey::empty(),
                );
                let end = IndexEntry::new(
                    index.index_id,
                    array_value.clone(),
                    if upper.inclusive {
                        byte_successor(upper_bytes)
                    } else {
                        upper_bytes.clone()
                    },
                    DocumentKey::empty(),
                );
                let excluded: Vec<IndexEntry> = excluded_encodings
                    .iter()
                    .map(|bytes| {
                        IndexEntry::new(
                            index.index_id,
                            array_value.clone(),
                            bytes.clone(),
                            DocumentKey::empty(),
                        )
                    })
                    .collect();
                for (range_start, range_end) in create_range(start, end, excluded) {
                    for entry in self.entries.range(range_start..range_end) {
                        keys.insert(entry.document_key.clone());
                    }
                }
            }
        }
    }

    /// Encodes the index positions excluded by `!=`/`not-in` filters: the
    /// scan's lower position with the excluded segment's value swapped in.
    fn encode_excluded_positions(
        &self,
        index: &FieldIndex,
        sub_target: &Target,
        lower_position: &[FirestoreValue],
    ) -> Vec<Vec<u8>> {
        let Some(excluded_values) = sub_target.not_in_values(index) else {
            return Vec::new();
        };
        let excluded_segment = index.directional_segments().position(|segment| {
            sub_target
                .field_filters_for(&segment.field_path)
                .iter()
                .any(|f| {
                    matches!(
                        f.operator(),
                        Some(Operator::NotEqual) | Some(Operator::NotIn)
                    )
                })
        });
        let Some(segment_index) = excluded_segment else {
            return Vec::new();
        };
        excluded_values
            .iter()
            .flat_map(|value| {
                let mut position: Vec<FirestoreValue> =
                    lower_position[..=segment_index.min(lower_position.len() - 1)].to_vec();
                if let Some(slot) = position.get_mut(segment_index) {
                    *slot = value.clone();
                }
                encode_positions(index, sub_target, &position)
            })
            .collect()
    }
}

/// The number of index segments a full answer for `sub_target` requires.
fn target_segment_count(sub_target: &Target) -> usize {
    let mut fields = BTreeSet::new();
    let mut has_array_segment = false;
    for filter in sub_target.filters.iter().flat_map(|f| f.field_filters()) {
        let Some(field) = filter.field() else { continue };
        if field.is_document_id() {
            continue;
        }
        if matches!(
            filter.operator(),
            Some(Operator::ArrayContains) | Some(Operator::ArrayContainsAny)
        ) {
            has_array_segment = true;
        } else {
            fields.insert(field.canonical_string());
        }
    }
    for order_by in &sub_target.order_by {
        if !order_by.field.is_document_id() {
            fields.insert(order_by.field.canonical_string());
        }
    }
    fields.len() + usize::from(has_array_segment)
}

/// Splits `[lower, upper)` around the excluded points, producing disjoint
/// subranges that skip exactly those positions.
fn create_range(
    lower: IndexEntry,
    upper: IndexEntry,
    mut excluded: Vec<IndexEntry>,
) -> Vec<(IndexEntry, IndexEntry)> {
    excluded.sort();
    excluded.dedup();

    let mut bounds = vec![lower.clone()];
    for point in excluded {
        if point < lower {
            continue;
        }
        if point >= upper {
            break;
        }
        if point == bounds[0] {
            bounds[0] = entry_successor(&point);
        } else {
            bounds.push(point.clone());
            bounds.push(entry_successor(&point));
        }
    }
    bounds.push(upper);

    bounds
        .chunks(2)
        .filter(|pair| pair.len() == 2 && pair[0] < pair[1])
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn entry_successor(entry: &IndexEntry) -> IndexEntry {
    IndexEntry::new(
        entry.index_id,
        entry.array_value.clone(),
        byte_successor(&entry.directional_value),
        DocumentKey::empty(),
    )
}

/// Encodes a directional position, expanding `in`-style array values into
/// one encoding per element (the cross product when several apply).
fn encode_positions(
    index: &FieldIndex,
    sub_target: &Target,
    position: &[FirestoreValue],
) -> Vec<Vec<u8>> {
    let mut encoders = vec![IndexByteEncoder::new()];
    for (segment, value) in index.directional_segments().zip(position) {
        let expand = value.is_array()
            && sub_target
                .field_filters_for(&segment.field_path)
                .iter()
                .any(|f| matches!(f.operator(), Some(Operator::In) | Some(Operator::NotIn)));
        if expand {
            let ValueKind::Array(array) = value.kind() else {
                continue;
            };
            let mut expanded = Vec::new();
            for element in array.values() {
                for encoder in &encoders {
                    let mut branch = IndexByteEncoder::new();
                    branch.seed(&encoder.encoded_bytes());
                    write_index_value(element, &mut branch.for_kind(segment.kind));
                    expanded.push(branch);
                }
            }
            encoders = expanded;
        } else {
            for encoder in encoders.iter_mut() {
                write_index_value(value, &mut encoder.for_kind(segment.kind));
            }
        }
    }
    encoders.into_iter().map(|e| e.encoded_bytes()).collect()
}

fn encode_single_element(value: &FirestoreValue) -> Vec<u8> {
    let mut encoder = IndexByteEncoder::new();
    write_index_value(value, &mut encoder.for_kind(crate::model::IndexKind::Ascending));
    encoder.encoded_bytes()
}

/// All index entries `document` produces under `index`. Documents missing a
/// directional field, or whose array field is not an array, produce none.
fn compute_index_entries(index: &FieldIndex, document: &Document) -> BTreeSet<IndexEntry> {
    let mut entries = BTreeSet::new();
    if !document.is_found_document() {
        return entries;
    }

    let mut encoder = IndexByteEncoder::new();
    for segment in index.directional_segments() {
        let Some(value) = document.field(&segment.field_path) else {
            return entries;
        };
        write_index_value(value, &mut encoder.for_kind(segment.kind));
    }
    let directional = encoder.encoded_bytes();

    match index.array_segment() {
        None => {
            entries.insert(IndexEntry::new(
                index.index_id,
                Vec::new(),
                directional,
                document.key().clone(),
            ));
        }
        Some(segment) => {
            let Some(value) = document.field(&segment.field_path) else {
                return entries;
            };
            let ValueKind::Array(array) = value.kind() else {
                return entries;
            };
            for element in array.values() {
                entries.insert(IndexEntry::new(
                    index.index_id,
                    encode_single_element(element),
                    directional.clone(),
                    document.key().clone(),
                ));
            }
        }
    }
    entries
}
