//! Threads, replies and the rules for accepting them.

pub mod sanitize;
pub mod signature;
pub mod store;

pub use sanitize::sanitize;
pub use signature::derive_tag;
pub use store::{ContentStore, RecentFeed, StoreSettings, DEFAULT_MAX_THREADS};
