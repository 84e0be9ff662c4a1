//! Route registration. Each core or plugin route is registered together
//! with the plugin middleware chain composed for its method and template,
//! so the chain is fixed once at startup.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{OriginalUri, Path, State};
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{Form, Router};
use services::plugins::{HttpMethod, MiddlewareChain, PluginRequest, PluginResponse, PluginRoute};
use services::PluginHost;
use tracing::debug;

use super::{ApiError, AppState};

pub struct RouteTable {
    plugins: Arc<PluginHost>,
    router: Router<AppState>,
}

impl RouteTable {
    pub fn new(plugins: Arc<PluginHost>) -> Self {
        Self { plugins, router: Router::new() }
    }

    pub fn get<H, Fut>(self, route: &str, terminal: H) -> Self
    where
        H: Fn(AppState, PluginRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
    {
        self.add(HttpMethod::Get, route, terminal)
    }

    pub fn post<H, Fut>(self, route: &str, terminal: H) -> Self
    where
        H: Fn(AppState, PluginRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
    {
        self.add(HttpMethod::Post, route, terminal)
    }

    pub fn add<H, Fut>(mut self, method: HttpMethod, route: &str, terminal: H) -> Self
    where
        H: Fn(AppState, PluginRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
    {
        let chain = self.plugins.middleware_for(method, route);
        debug!(%method, route, middleware = ?chain.names(), "route registered");
        self.router = self.router.route(route, endpoint(method, route, chain, terminal));
        self
    }

    /// Registers a plugin route behind the same middleware composition.
    pub fn plugin_route(self, route: PluginRoute) -> Self {
        let handler = route.handler.clone();
        self.add(route.method, &route.path, move |state: AppState, request: PluginRequest| {
            let handler = handler.clone();
            async move {
                let response = handler.call(request).await?;
                Ok::<_, ApiError>(plugin_response(&state, response))
            }
        })
    }

    pub fn into_router(self) -> Router<AppState> {
        self.router
    }
}

fn plugin_response(state: &AppState, response: PluginResponse) -> Response {
    match response {
        PluginResponse::Html(body) => Html(body).into_response(),
        PluginResponse::Json(value) => Json(value).into_response(),
        PluginResponse::Text(body) => body.into_response(),
        PluginResponse::Redirect(to) if to.starts_with('/') => Redirect::to(&state.url(&to)).into_response(),
        PluginResponse::Redirect(to) => Redirect::to(&to).into_response(),
    }
}

fn endpoint<H, Fut>(method: HttpMethod, route: &str, chain: MiddlewareChain, terminal: H) -> MethodRouter<AppState>
where
    H: Fn(AppState, PluginRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
{
    let has_params = route.contains('{');
    let template: Arc<str> = Arc::from(route);
    let run = move |state: AppState, params: BTreeMap<String, String>, path: String, fields: BTreeMap<String, String>| {
        let chain = chain.clone();
        let terminal = terminal.clone();
        let template = template.clone();
        async move {
            let mut request = PluginRequest::new(method, template.as_ref(), path)
                .with_params(params)
                .with_fields(fields);
            chain.run(&mut request).await?;
            terminal(state, request).await
        }
    };

    let filter = match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
    };
    if has_params {
        on(
            filter,
            move |State(state): State<AppState>,
                  Path(params): Path<BTreeMap<String, String>>,
                  OriginalUri(uri): OriginalUri,
                  Form(fields): Form<BTreeMap<String, String>>| {
                run(state, params, uri.path().to_string(), fields)
            },
        )
    } else {
        on(
            filter,
            move |State(state): State<AppState>,
                  OriginalUri(uri): OriginalUri,
                  Form(fields): Form<BTreeMap<String, String>>| {
                run(state, BTreeMap::new(), uri.path().to_string(), fields)
            },
        )
    }
}
