//! The plugin host: registry, loading and capability dispatch.
//!
//! The host is assembled at startup through `&mut self` methods and then
//! shared read-only, so registry mutations never race with request handling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use domains::{ContentKind, KvStore};
use futures_util::future::join_all;
use tracing::{debug, info};

use super::context::SharedContext;
use super::contract::{PluginFactory, PluginInstance, PluginRequest, PluginRoute, PluginRouter};
use super::descriptor::{Capability, HookRef, HttpMethod, PluginDescriptor, PluginId};
use super::discovery::discover;
use super::error::PluginError;
use super::middleware::{MiddlewareChain, MiddlewareEntry, RouteMatcher};
use super::resolve::resolve_load_order;

/// The closed set of plugin implementations compiled into the binary.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: impl PluginFactory + 'static) -> Self {
        self.register(Arc::new(factory));
        self
    }

    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(factory.name(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

/// A plugin that passed loading, with its live instance.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub descriptor: PluginDescriptor,
    pub instance: Arc<dyn PluginInstance>,
    pub load_index: usize,
}

#[derive(Clone)]
struct TemplateEntry {
    plugin: usize,
    method: HttpMethod,
    matcher: RouteMatcher,
    function: String,
}

#[derive(Clone, Default)]
pub struct PluginHost {
    registry: PluginRegistry,
    discovered: BTreeMap<PluginId, PluginDescriptor>,
    loaded: Vec<LoadedPlugin>,
    middleware: Vec<MiddlewareEntry>,
    templates: Vec<TemplateEntry>,
}

impl PluginHost {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry, ..Self::default() }
    }

    /// Registers a validated descriptor under `name:version`.
    pub fn register_descriptor(&mut self, descriptor: PluginDescriptor) -> Result<PluginId, PluginError> {
        let id = descriptor.id();
        descriptor
            .validate()
            .map_err(|reason| PluginError::malformed(id.as_str(), reason))?;
        if self.discovered.contains_key(&id) {
            return Err(PluginError::malformed(id.as_str(), "duplicate plugin id"));
        }
        self.discovered.insert(id.clone(), descriptor);
        Ok(id)
    }

    /// Discovers and registers every package under `dir`.
    pub async fn discover(&mut self, dir: &Path) -> Result<usize, PluginError> {
        let descriptors = discover(dir).await?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register_descriptor(descriptor)?;
        }
        Ok(count)
    }

    /// Dependency-respecting load order of the registered descriptors.
    pub fn resolve(&self) -> Result<Vec<PluginId>, PluginError> {
        let descriptors: Vec<PluginDescriptor> = self.discovered.values().cloned().collect();
        resolve_load_order(&descriptors)
    }

    /// Resolves load order, then initializes every plugin in that order and
    /// binds the functions its descriptor names.
    pub async fn load(&mut self, context: &mut SharedContext, store: Arc<dyn KvStore>) -> Result<(), PluginError> {
        let order = self.resolve()?;

        for id in order {
            let Some(descriptor) = self.discovered.get(&id).cloned() else { continue };
            let factory = self
                .registry
                .get(&descriptor.name)
                .cloned()
                .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?;

            let instance = factory.init(&descriptor, context, Arc::clone(&store)).await?;
            let load_index = self.loaded.len();
            self.bind_functions(&descriptor, &instance, load_index)?;

            info!(plugin = %id, load_index, provides = ?descriptor.provides, "plugin loaded");
            self.loaded.push(LoadedPlugin { descriptor, instance, load_index });
        }
        Ok(())
    }

    fn bind_functions(
        &mut self,
        descriptor: &PluginDescriptor,
        instance: &Arc<dyn PluginInstance>,
        load_index: usize,
    ) -> Result<(), PluginError> {
        let id = descriptor.id();
        let missing = |capability: Capability, function: &str| PluginError::MissingFunction {
            plugin: id.to_string(),
            capability: capability.as_str(),
            function: function.to_string(),
        };
        let matcher = |route: &str, hook: &HookRef| {
            RouteMatcher::from_hook(hook).map_err(|e| PluginError::malformed(id.as_str(), format!("{route}: {e}")))
        };

        for hook in &descriptor.middleware {
            let handler = instance
                .middleware(&hook.function)
                .ok_or_else(|| missing(Capability::Middleware, &hook.function))?;
            self.middleware.push(MiddlewareEntry {
                plugin: id.clone(),
                load_index,
                method: hook.method,
                matcher: matcher(&hook.route, hook)?,
                important: hook.important,
                function: hook.function.clone(),
                handler,
            });
        }

        for hook in &descriptor.template_injection {
            if instance.template_fragment(&hook.function, hook.method, &hook.route).is_none() {
                return Err(missing(Capability::TemplateInjection, &hook.function));
            }
            self.templates.push(TemplateEntry {
                plugin: load_index,
                method: hook.method,
                matcher: matcher(&hook.route, hook)?,
                function: hook.function.clone(),
            });
        }
        Ok(())
    }

    /// Loaded plugins in load order.
    pub fn loaded(&self) -> &[LoadedPlugin] {
        &self.loaded
    }

    fn providers(&self, capability: Capability) -> impl Iterator<Item = &LoadedPlugin> + '_ {
        self.loaded.iter().filter(move |p| p.descriptor.provides(capability))
    }

    /// Runs every context modifier in load order, merging each delta.
    pub fn apply_context_modifiers(&self, context: &mut SharedContext) {
        for plugin in self.providers(Capability::Context) {
            let delta = plugin.instance.context(context);
            if !delta.is_empty() {
                debug!(plugin = %plugin.descriptor.id(), "applying context delta");
            }
            context.apply(delta);
        }
    }

    /// Routes contributed by plugins providing `routes`.
    pub fn routes(&self) -> Vec<(PluginId, PluginRoute)> {
        self.providers(Capability::Routes)
            .flat_map(|plugin| {
                let mut router = PluginRouter::new();
                plugin.instance.routes(&mut router);
                let id = plugin.descriptor.id();
                router.into_routes().into_iter().map(move |r| (id.clone(), r))
            })
            .collect()
    }

    /// The middleware chain for one route registration.
    pub fn middleware_for(&self, method: HttpMethod, route: &str) -> MiddlewareChain {
        MiddlewareChain::compose(&self.middleware, method, route)
    }

    /// Concatenated template fragments for `(method, route)`, one per line,
    /// in load order.
    pub fn template_injection(&self, method: HttpMethod, route: &str) -> String {
        self.templates
            .iter()
            .filter(|t| t.method == method && t.matcher.matches(route))
            .filter_map(|t| {
                self.loaded
                    .get(t.plugin)
                    .and_then(|p| p.instance.template_fragment(&t.function, method, route))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Runs every post-submit action concurrently. Each action runs to
    /// completion; the first failure in load order is returned afterwards.
    pub async fn post_submit(&self, request: &PluginRequest, kind: ContentKind, id: u64) -> Result<(), PluginError> {
        let actions = self
            .providers(Capability::PostSubmitAction)
            .map(|plugin| plugin.instance.post_submit(request, kind, id));
        join_all(actions).await.into_iter().collect()
    }
}
