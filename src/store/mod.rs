//! Persistence layer: keyed blob store backends and the typed job collection.

pub mod jobs;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use jobs::JobStore;
pub use libsql_backend::LibSqlBlobStore;
pub use memory::MemoryBlobStore;
pub use traits::BlobStore;
