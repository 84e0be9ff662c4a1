//! threadboard/crates/storage-adapters/src/lib.rs
//!
//! Implementations of the `domains::KvStore` port.

pub mod file;
pub mod memory;
pub mod timeout;

#[cfg(feature = "db-sqlite")]
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

#[cfg(feature = "db-sqlite")]
pub use sqlite::SqliteStore;
