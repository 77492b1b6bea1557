//! Persistence layer: `Store` trait plus libSQL and in-memory backends.

pub mod libsql_store;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_store::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::Store;
