mod document_overlay_cache;
mod encoded_resource_path;
mod index_backfiller;
mod index_byte_encoder;
mod index_entry;
mod index_manager;
mod index_value_writer;
mod local_documents_view;
mod local_store;
mod lru_garbage_collector;
mod mutation_queue;
mod persistence;
mod persistence_promise;
mod query_context;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;
mod target_data;
mod target_index_matcher;

pub use document_overlay_cache::MemoryDocumentOverlayCache;
pub use encoded_resource_path::{decode_resource_path, encode_resource_path};
pub use index_backfiller::{IndexBackfiller, DEFAULT_MAX_DOCUMENTS_TO_PROCESS};
pub use index_byte_encoder::{DirectionalIndexByteEncoder, IndexByteEncoder};
pub use index_entry::IndexEntry;
pub use index_manager::{IndexType, MemoryIndexManager};
pub use local_documents_view::{LocalDocumentsResult, LocalDocumentsView};
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use lru_garbage_collector::{
    LruDelegate, LruGarbageCollector, LruParams, LruResults, RollingSequenceNumberBuffer,
    LRU_COLLECTION_DISABLED, LRU_DEFAULT_CACHE_SIZE_BYTES, LRU_DEFAULT_COLLECTION_PERCENTILE,
    LRU_DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
};
pub use mutation_queue::MemoryMutationQueue;
pub use persistence::{MemoryPersistence, OrphanedDocuments, PersistenceTransaction, User};
pub use persistence_promise::PersistencePromise;
pub use query_context::QueryContext;
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::MemoryTargetCache;
pub use target_data::TargetData;
pub use target_index_matcher::TargetIndexMatcher;
