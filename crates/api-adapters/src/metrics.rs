//! Prometheus counters for submissions and pruning.

use std::fmt;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use services::ContentStore;

pub struct Metrics {
    registry: Registry,
    pub threads_created: Counter,
    pub posts_created: Counter,
    pub threads_pruned: Counter,
    pub submissions_rejected: Counter,
    pub post_submit_failures: Counter,
    pub live_threads: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("threadboard");
        let threads_created = Counter::default();
        let posts_created = Counter::default();
        let threads_pruned = Counter::default();
        let submissions_rejected = Counter::default();
        let post_submit_failures = Counter::default();
        let live_threads = Gauge::default();

        registry.register("threads_created", "Threads created", threads_created.clone());
        registry.register("posts_created", "Replies created", posts_created.clone());
        registry.register("threads_pruned", "Threads removed by pruning", threads_pruned.clone());
        registry.register("submissions_rejected", "Submissions rejected as invalid", submissions_rejected.clone());
        registry.register("post_submit_failures", "Failed plugin post-submit actions", post_submit_failures.clone());
        registry.register("live_threads", "Threads currently stored", live_threads.clone());

        Self {
            registry,
            threads_created,
            posts_created,
            threads_pruned,
            submissions_rejected,
            post_submit_failures,
            live_threads,
        }
    }

    /// Pulls the gauges and the prune count from the store.
    pub fn observe(&self, store: &ContentStore) {
        let threads = i64::try_from(store.statistics().threads).unwrap_or(i64::MAX);
        self.live_threads.set(threads);

        let pruned = store.pruned_total();
        let seen = self.threads_pruned.get();
        if pruned > seen {
            self.threads_pruned.inc_by(pruned - seen);
        }
    }

    /// OpenMetrics text exposition.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let metrics = Metrics::new();
        metrics.threads_created.inc();
        metrics.submissions_rejected.inc_by(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("threadboard_threads_created_total 1"));
        assert!(text.contains("threadboard_submissions_rejected_total 2"));
        assert!(text.contains("threadboard_live_threads 0"));
    }
}
