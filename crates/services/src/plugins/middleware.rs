//! Route matching and middleware chain composition.

use std::sync::Arc;

use regex::Regex;

use super::contract::{Middleware, PluginRequest};
use super::descriptor::{compile_pattern, HookRef, HttpMethod, PluginId};
use super::error::PluginError;

/// How a hook's route is matched against a route template.
#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// `explicit` hooks compare the template literally.
    Exact(String),
    /// `*`
    Wildcard,
    Pattern(Regex),
}

impl RouteMatcher {
    pub fn from_hook(hook: &HookRef) -> Result<Self, regex::Error> {
        if hook.route == "*" {
            Ok(RouteMatcher::Wildcard)
        } else if hook.explicit {
            Ok(RouteMatcher::Exact(hook.route.clone()))
        } else {
            compile_pattern(&hook.route).map(RouteMatcher::Pattern)
        }
    }

    pub fn matches(&self, route: &str) -> bool {
        match self {
            RouteMatcher::Exact(expected) => expected == route,
            RouteMatcher::Wildcard => true,
            RouteMatcher::Pattern(re) => re.is_match(route),
        }
    }

    /// Precedence tier; lower runs first.
    pub fn tier(&self) -> u8 {
        match self {
            RouteMatcher::Exact(_) => 0,
            RouteMatcher::Wildcard => 1,
            RouteMatcher::Pattern(_) => 2,
        }
    }
}

/// One middleware function registered by a loaded plugin.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub plugin: PluginId,
    /// Position of the plugin in load order.
    pub load_index: usize,
    pub method: HttpMethod,
    pub matcher: RouteMatcher,
    pub important: bool,
    pub function: String,
    pub handler: Arc<dyn Middleware>,
}

/// An ordered list of middleware installed ahead of a terminal handler.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    links: Vec<(String, Arc<dyn Middleware>)>,
}

impl MiddlewareChain {
    /// Collects the entries matching `(method, route)` and orders them:
    /// important first, then by match tier, then by plugin load order, then
    /// by declaration order within the plugin.
    pub fn compose(entries: &[MiddlewareEntry], method: HttpMethod, route: &str) -> Self {
        let mut matched: Vec<(usize, &MiddlewareEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.method == method && e.matcher.matches(route))
            .collect();
        matched.sort_by_key(|(declared, e)| (!e.important, e.matcher.tier(), e.load_index, *declared));

        MiddlewareChain {
            links: matched
                .into_iter()
                .map(|(_, e)| (format!("{}::{}", e.plugin, e.function), Arc::clone(&e.handler)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// `plugin:version::function` for each link, in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Runs each link in order; the first error stops the chain.
    pub async fn run(&self, request: &mut PluginRequest) -> Result<(), PluginError> {
        for (name, handler) in &self.links {
            if let Err(e) = handler.handle(request).await {
                tracing::debug!(middleware = %name, route = %request.route, error = %e, "request stopped by middleware");
                return Err(e);
            }
        }
        Ok(())
    }
}
