mod document;
mod document_key;
mod field_index;
mod field_path;
mod mutation;
mod resource_path;
mod timestamp;

pub use document::{Document, DocumentType};
pub use document_key::DocumentKey;
pub use field_index::{
    FieldIndex, IndexKind, IndexOffset, IndexSegment, IndexState, INITIAL_LARGEST_BATCH_ID,
    INITIAL_SEQUENCE_NUMBER, UNKNOWN_INDEX_ID,
};
pub use field_path::FieldPath;
pub use mutation::{
    calculate_overlay_mutation, DeleteMutation, FieldMask, Mutation, MutationBatch, Overlay,
    PatchMutation, SetMutation, BATCH_ID_UNKNOWN,
};
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};
