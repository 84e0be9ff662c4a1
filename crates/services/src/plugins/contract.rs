//! The interface between the host and plugin implementations.
//!
//! Plugins are a closed set of Rust types registered with the host through a
//! [`PluginFactory`]. A factory turns a validated descriptor into a live
//! [`PluginInstance`]; the instance exposes whichever capabilities its
//! descriptor declares.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use domains::{ContentKind, KvStore};
use serde_json::Value;

use super::context::{ContextDelta, SharedContext};
use super::descriptor::{HttpMethod, PluginDescriptor};
use super::error::PluginError;

/// The request view handed to middleware, plugin routes and post-submit
/// actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRequest {
    pub method: HttpMethod,
    /// Route template the request was matched against, e.g. `/{board}/new`.
    pub route: String,
    /// Concrete request path.
    pub path: String,
    pub params: BTreeMap<String, String>,
    /// Form fields (POST) or query parameters (GET).
    pub fields: BTreeMap<String, String>,
}

impl PluginRequest {
    pub fn new(method: HttpMethod, route: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            path: path.into(),
            params: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// What a plugin route handler produces.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginResponse {
    Html(String),
    Json(Value),
    Text(String),
    Redirect(String),
}

/// A middleware function. It may rewrite the request (e.g. strip a field)
/// or refuse it with [`PluginError::Rejected`].
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &mut PluginRequest) -> Result<(), PluginError>;
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, request: PluginRequest) -> Result<PluginResponse, PluginError>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(PluginRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PluginResponse, PluginError>> + Send + 'static,
{
    async fn call(&self, request: PluginRequest) -> Result<PluginResponse, PluginError> {
        (self)(request).await
    }
}

#[derive(Clone)]
pub struct PluginRoute {
    pub method: HttpMethod,
    /// Route template in the request layer's syntax, e.g. `/captcha/{id}`.
    pub path: String,
    pub handler: Arc<dyn RouteHandler>,
}

/// Collects the routes a plugin wants mounted.
#[derive(Clone, Default)]
pub struct PluginRouter {
    routes: Vec<PluginRoute>,
}

impl PluginRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, method: HttpMethod, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.routes.push(PluginRoute {
            method,
            path: path.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn get(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(HttpMethod::Get, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl RouteHandler + 'static) -> &mut Self {
        self.route(HttpMethod::Post, path, handler)
    }

    pub fn into_routes(self) -> Vec<PluginRoute> {
        self.routes
    }
}

/// Creates plugin instances for one plugin name.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    /// Must equal the `name` field of the descriptor it serves.
    fn name(&self) -> &'static str;

    /// Initializes the plugin. The plugin may read and write the shared
    /// context and keeps whatever handle to the store it needs.
    async fn init(
        &self,
        descriptor: &PluginDescriptor,
        context: &mut SharedContext,
        store: Arc<dyn KvStore>,
    ) -> Result<Arc<dyn PluginInstance>, PluginError>;
}

/// A loaded plugin. Every capability has a no-op default.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    fn routes(&self, _router: &mut PluginRouter) {}

    /// Resolves a middleware function named in the descriptor.
    fn middleware(&self, _function: &str) -> Option<Arc<dyn Middleware>> {
        None
    }

    /// Produces the markup fragment of a template-injection function.
    /// `None` means the function does not exist.
    fn template_fragment(&self, _function: &str, _method: HttpMethod, _route: &str) -> Option<String> {
        None
    }

    fn context(&self, _context: &SharedContext) -> ContextDelta {
        ContextDelta::default()
    }

    /// Runs after content was stored successfully.
    async fn post_submit(&self, _request: &PluginRequest, _kind: ContentKind, _id: u64) -> Result<(), PluginError> {
        Ok(())
    }
}
