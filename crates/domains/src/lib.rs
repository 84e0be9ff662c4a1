//! threadboard/crates/domains/src/lib.rs
//!
//! The domain models, error types and persistence port for threadboard.

pub mod errors;
pub mod models;
pub mod ports;

// Re-exporting for easier access in other crates
pub use errors::*;
pub use models::*;
pub use ports::*;
