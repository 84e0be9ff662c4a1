//! # api-adapters
//!
//! The HTTP surface of threadboard: page shells, JSON sources, submission
//! endpoints and plugin routes, each registered together with the plugin
//! middleware that applies to it.

pub mod metrics;
pub mod pages;

#[cfg(feature = "web-axum")]
pub mod web;

pub use metrics::Metrics;
