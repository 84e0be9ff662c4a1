use std::sync::Arc;

use services::{ContentStore, PluginHost};

use crate::Metrics;

/// Everything a handler needs, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ContentStore>,
    pub plugins: Arc<PluginHost>,
    pub metrics: Arc<Metrics>,
    /// Mount point, empty or `/`-prefixed without a trailing slash.
    pub route_prefix: Arc<str>,
    pub recent_feed_limit: usize,
}

impl AppState {
    pub fn new(store: Arc<ContentStore>, plugins: Arc<PluginHost>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            plugins,
            metrics,
            route_prefix: Arc::from(""),
            recent_feed_limit: 20,
        }
    }

    pub fn with_route_prefix(mut self, prefix: &str) -> Self {
        self.route_prefix = Arc::from(prefix.trim_end_matches('/'));
        self
    }

    pub fn with_recent_feed_limit(mut self, limit: usize) -> Self {
        self.recent_feed_limit = limit;
        self
    }

    /// Absolute URL for an application path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.route_prefix, path)
    }
}
