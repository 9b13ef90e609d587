use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{FirestoreValue, MapValue};

/// Whether a document body is known, known-missing, or not known at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known about the document at this key.
    Invalid,
    /// The server confirmed the document does not exist.
    NoDocument,
    /// The document exists with the stored body.
    FoundDocument,
}

/// The local representation of a document. Documents are never mutated in
/// place once cached; applying a mutation replaces the stored copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    /// A document whose state is unknown; the base value mutations are
    /// applied against when the cache has no entry.
    pub fn invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self {
            key,
            document_type: DocumentType::FoundDocument,
            version,
            read_time: SnapshotVersion::min(),
            data,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            document_type: DocumentType::NoDocument,
            version,
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) {
        self.read_time = read_time;
    }

    /// Replaces the document body; used when applying a mutation locally.
    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) {
        self.document_type = DocumentType::FoundDocument;
        self.version = version;
        self.data = data;
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) {
        self.document_type = DocumentType::NoDocument;
        self.version = version;
        self.data = MapValue::empty();
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
    }

    pub fn set_has_local_mutations(&mut self) {
        self.has_local_mutations = true;
        self.version = SnapshotVersion::min();
    }

    pub fn set_has_committed_mutations(&mut self) {
        self.has_committed_mutations = true;
    }

    pub(crate) fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }
}

impl Display for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Document({}, {:?}, v={:?})",
            self.key, self.document_type, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use std::collections::BTreeMap;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn found_document_reads_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("sf"));
        let doc = Document::new_found_document(
            DocumentKey::from_string("cities/sf").unwrap(),
            version(1),
            MapValue::new(fields),
        );
        assert!(doc.is_found_document());
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("name").unwrap()),
            Some(&FirestoreValue::from_string("sf"))
        );
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc = Document::new_found_document(
            DocumentKey::from_string("cities/sf").unwrap(),
            version(5),
            MapValue::empty(),
        );
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
    }
}
