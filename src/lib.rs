//! Offline cache and query engine for a Firestore-style document database
//! client.
//!
//! This crate is the local half of an offline-capable client: it keeps a copy
//! of server-confirmed documents, queues local writes that have not been
//! acknowledged yet, answers queries from the local copy using the cheapest
//! strategy that can be proven correct, and reclaims bounded cache space with
//! an LRU pass over listen sequence numbers.
//!
//! - [`model`] and [`value`] hold the document and mutation data model.
//! - [`core`] holds the query/target model shared with the backend.
//! - [`local`] holds the caches, the field index manager, the query engine
//!   and the LRU garbage collector.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod util;
pub mod value;

pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
