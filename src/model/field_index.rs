use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{Document, DocumentKey, SnapshotVersion, Timestamp};

/// Batch id assigned before the first local mutation is seen.
pub const INITIAL_LARGEST_BATCH_ID: i32 = -1;

/// Sequence number assigned to a field index before it is backfilled.
pub const INITIAL_SEQUENCE_NUMBER: i64 = 0;

/// Placeholder id for indexes that have not been persisted yet.
pub const UNKNOWN_INDEX_ID: i32 = -1;

/// How a single field participates in an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    ArrayContains,
}

/// One field of a composite index definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: crate::model::FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: crate::model::FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// A cursor into the document stream: everything up to and including
/// `(read_time, document_key)` has already been indexed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn new(
        read_time: SnapshotVersion,
        document_key: DocumentKey,
        largest_batch_id: i32,
    ) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// The offset that precedes every document.
    pub fn min() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: DocumentKey::empty(),
            largest_batch_id: INITIAL_LARGEST_BATCH_ID,
        }
    }

    /// The offset produced by indexing `document`.
    pub fn from_document(document: &Document) -> Self {
        Self {
            read_time: document.read_time(),
            document_key: document.key().clone(),
            largest_batch_id: INITIAL_LARGEST_BATCH_ID,
        }
    }

    /// The smallest offset that sorts after everything at `read_time`.
    pub fn successor_of(read_time: SnapshotVersion, largest_batch_id: i32) -> Self {
        let ts = read_time.timestamp();
        let successor = SnapshotVersion::new(Timestamp::new(ts.seconds, ts.nanos + 1));
        Self {
            read_time: successor,
            document_key: DocumentKey::empty(),
            largest_batch_id,
        }
    }

    /// Offsets order by read time first, then by key. The batch id is
    /// bookkeeping for overlay staleness and does not affect ordering.
    pub fn compare_to(&self, other: &Self) -> Ordering {
        self.read_time
            .compare_to(&other.read_time)
            .then_with(|| self.document_key.compare_to(&other.document_key))
    }

    /// Whether `document` was written after this offset.
    pub fn sorts_before_document(&self, document: &Document) -> bool {
        match self.read_time.compare_to(&document.read_time()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.document_key.compare_to(document.key()) == Ordering::Less,
        }
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare_to(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_to(other)
    }
}

/// Backfill progress of a field index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl IndexState {
    pub fn new(sequence_number: i64, offset: IndexOffset) -> Self {
        Self {
            sequence_number,
            offset,
        }
    }

    pub fn empty() -> Self {
        Self {
            sequence_number: INITIAL_SEQUENCE_NUMBER,
            offset: IndexOffset::min(),
        }
    }
}

/// Definition and backfill state of a client-side field index over a
/// collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub fn new(
        index_id: i32,
        collection_group: impl Into<String>,
        segments: Vec<IndexSegment>,
        index_state: IndexState,
    ) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
            index_state,
        }
    }

    /// The single array segment, if the index has one.
    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::ArrayContains)
    }

    /// All ordered (non-array) segments, in definition order.
    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::ArrayContains)
    }

    pub fn offset(&self) -> &IndexOffset {
        &self.index_state.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;
    use crate::value::MapValue;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, read_seconds: i64) -> Document {
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(read_seconds),
            MapValue::empty(),
        )
        .with_read_time(version(read_seconds))
    }

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let early = IndexOffset::new(
            version(1),
            DocumentKey::from_string("coll/b").unwrap(),
            INITIAL_LARGEST_BATCH_ID,
        );
        let same_time_smaller_key = IndexOffset::new(
            version(1),
            DocumentKey::from_string("coll/a").unwrap(),
            INITIAL_LARGEST_BATCH_ID,
        );
        let late = IndexOffset::new(
            version(2),
            DocumentKey::from_string("coll/a").unwrap(),
            INITIAL_LARGEST_BATCH_ID,
        );
        assert!(same_time_smaller_key < early);
        assert!(early < late);
    }

    #[test]
    fn offset_filters_documents_at_or_before_it() {
        let offset = IndexOffset::new(
            version(2),
            DocumentKey::from_string("coll/m").unwrap(),
            INITIAL_LARGEST_BATCH_ID,
        );
        assert!(offset.sorts_before_document(&doc("coll/a", 3)));
        assert!(offset.sorts_before_document(&doc("coll/z", 2)));
        assert!(!offset.sorts_before_document(&doc("coll/a", 2)));
        assert!(!offset.sorts_before_document(&doc("coll/z", 1)));
    }

    #[test]
    fn successor_sorts_after_all_keys_at_read_time() {
        let successor = IndexOffset::successor_of(version(1), INITIAL_LARGEST_BATCH_ID);
        assert!(!successor.sorts_before_document(&doc("coll/zzz", 1)));
        assert!(successor.sorts_before_document(&doc("coll/a", 2)));
    }

    #[test]
    fn field_index_splits_segments() {
        let index = FieldIndex::new(
            1,
            "coll",
            vec![
                IndexSegment::new(
                    FieldPath::from_dot_separated("tags").unwrap(),
                    IndexKind::ArrayContains,
                ),
                IndexSegment::new(
                    FieldPath::from_dot_separated("count").unwrap(),
                    IndexKind::Ascending,
                ),
            ],
            IndexState::empty(),
        );
        assert_eq!(
            index.array_segment().unwrap().field_path.canonical_string(),
            "tags"
        );
        assert_eq!(index.directional_segments().count(), 1);
    }
}
