//! threadboard/crates/services/src/lib.rs
//!
//! Application logic: the content store and the plugin substrate. Both
//! depend only on the `domains` ports, never on a concrete adapter.

pub mod content;
pub mod plugins;

pub use content::{ContentStore, StoreSettings};
pub use plugins::{PluginError, PluginHost, PluginRegistry, SharedContext};
