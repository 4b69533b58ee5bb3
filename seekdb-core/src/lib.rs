//! # seekdb-core
//!
//! The search-engine side of seekdb: the document model, query
//! parameters, the in-memory index engine, and the database pool the
//! connection handlers check databases out of.

pub mod document;
pub mod engine;
pub mod error;
pub mod pool;
pub mod query;

pub use document::{DocData, Document};
pub use engine::{Engine, SearchResult};
pub use error::EngineError;
pub use pool::{DatabaseGuard, DatabasePool, DB_SPAWN, DB_WRITABLE};
pub use query::QueryField;

/// Content type for JSON documents.
pub const JSON_TYPE: &str = "application/json";

/// Content type for msgpack documents.
pub const MSGPACK_TYPE: &str = "application/msgpack";

/// Reserved document-id field name.
pub const RESERVED_ID: &str = "_id";
