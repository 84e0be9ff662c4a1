//! axum wiring: state, error mapping, route composition and handlers.

mod compose;
mod error;
pub mod handlers;
mod state;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use compose::RouteTable;
pub use error::ApiError;
pub use state::AppState;

/// Builds the application router: plugin routes first, then the core
/// board routes, all mounted under the configured prefix.
pub fn router(state: AppState) -> Router {
    let mut table = RouteTable::new(state.plugins.clone());
    for (plugin, route) in state.plugins.routes() {
        info!(%plugin, method = %route.method, path = %route.path, "mounting plugin route");
        table = table.plugin_route(route);
    }

    let routes = table
        .get("/", handlers::index)
        .get("/source.json", handlers::recent_source)
        .get("/metrics", handlers::metrics)
        .get("/{board}", handlers::board_page)
        .get("/{board}/", handlers::board_page)
        .get("/{board}/source.json", handlers::board_source)
        .post("/{board}/new", handlers::new_thread)
        .get("/{board}/{thread}/", handlers::thread_page)
        .get("/{board}/{thread}/source.json", handlers::thread_source)
        .post("/{board}/{thread}/reply", handlers::reply)
        .post("/{board}/{thread}/pin", handlers::pin)
        .post("/{board}/{thread}/delete", handlers::delete_thread)
        .post("/{board}/{thread}/{post}/delete", handlers::delete_post)
        .into_router();

    let app = if state.route_prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&state.route_prefix, routes)
    };
    app.layer(TraceLayer::new_for_http()).with_state(state)
}
