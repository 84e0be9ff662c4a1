//! # threadboard
//!
//! Assembles the board from configuration: storage backend, plugin host,
//! content store, background pruner and the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api_adapters::web::{self, AppState};
use api_adapters::Metrics;
use configs::{LogFormat, LogSettings, Settings, StorageBackend, StorageSettings};
use domains::KvStore;
use plugin_captcha::CaptchaFactory;
use plugin_moderation::ModerationFactory;
use services::{ContentStore, PluginHost, PluginRegistry, SharedContext, StoreSettings};
use storage_adapters::{FileStore, MemoryStore, TimeoutStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Every plugin this binary can load. Discovery only selects among these.
fn registry() -> PluginRegistry {
    PluginRegistry::new().with(CaptchaFactory).with(ModerationFactory)
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn open_backend(settings: &StorageSettings) -> anyhow::Result<Arc<dyn KvStore>> {
    let limit = Duration::from_millis(settings.timeout_ms);
    let backend: Arc<dyn KvStore> = match settings.backend {
        StorageBackend::File => {
            let store = FileStore::open(&settings.path)
                .await
                .with_context(|| format!("opening file store at {}", settings.path.display()))?;
            Arc::new(TimeoutStore::new(store, limit))
        }
        StorageBackend::Memory => {
            warn!("memory storage selected; content is lost on shutdown");
            Arc::new(TimeoutStore::new(MemoryStore::new(), limit))
        }
        StorageBackend::Sqlite => open_sqlite(settings, limit).await?,
    };
    info!(backend = ?settings.backend, timeout_ms = settings.timeout_ms, "storage ready");
    Ok(backend)
}

#[cfg(feature = "db-sqlite")]
async fn open_sqlite(settings: &StorageSettings, limit: Duration) -> anyhow::Result<Arc<dyn KvStore>> {
    let url = format!("sqlite://{}?mode=rwc", settings.path.display());
    let store = storage_adapters::SqliteStore::connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(Arc::new(TimeoutStore::new(store, limit)))
}

#[cfg(not(feature = "db-sqlite"))]
async fn open_sqlite(_settings: &StorageSettings, _limit: Duration) -> anyhow::Result<Arc<dyn KvStore>> {
    anyhow::bail!("sqlite storage requested but this binary was built without the db-sqlite feature")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    init_tracing(&settings.log);

    let backend = open_backend(&settings.storage).await?;
    let store = Arc::new(ContentStore::new(
        backend.clone(),
        StoreSettings {
            boards: settings.board.names.clone(),
            max_threads_per_board: settings.board.max_threads,
        },
    ));

    // Plugins initialize against the shared context before any content is read.
    let mut context = SharedContext::new(settings.board.names.clone(), settings.moderation.moderators.clone())
        .with_route_prefix(&settings.server.route_prefix);
    let mut host = PluginHost::new(registry());
    if settings.plugins.enabled {
        let found = host
            .discover(&settings.plugins.dir)
            .await
            .context("discovering plugins")?;
        host.load(&mut context, backend.clone()).await.context("loading plugins")?;
        info!(found, loaded = host.loaded().len(), "plugins loaded");
    }

    store.init_system().await.context("initializing system record")?;
    host.apply_context_modifiers(&mut context);
    store.set_moderators(context.moderators.iter().cloned());

    let (threads, posts) = store.reload().await.context("loading content")?;
    info!(threads, posts, moderators = context.moderators.len(), "content loaded");
    for orphan in store.consistency_sweep() {
        warn!(
            post_id = orphan.post_id,
            thread_id = orphan.thread_id,
            thread_exists = orphan.thread_exists,
            "post is not linked from its thread"
        );
    }

    let state = AppState::new(store.clone(), Arc::new(host), Arc::new(Metrics::new()))
        .with_route_prefix(&settings.server.route_prefix)
        .with_recent_feed_limit(settings.board.recent_feed_limit);
    let app = web::router(state);
    let _pruner = store.start_pruner();

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("binding {}", settings.server.bind))?;
    info!(addr = %settings.server.bind, prefix = %settings.server.route_prefix, "threadboard listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
