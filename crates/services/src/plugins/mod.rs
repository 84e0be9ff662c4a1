//! The plugin substrate.
//!
//! Startup sequence: [`PluginHost::discover`] reads `plugin-*/plugin.json`
//! packages, [`PluginHost::load`] orders them by dependency and initializes
//! each through its registered [`PluginFactory`]. The request layer then asks
//! the host for routes, middleware chains, template fragments and
//! post-submit actions.

pub mod context;
pub mod contract;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod host;
pub mod middleware;
pub mod resolve;

pub use context::{ContextDelta, SharedContext};
pub use contract::{
    Middleware, PluginFactory, PluginInstance, PluginRequest, PluginResponse, PluginRoute,
    PluginRouter, RouteHandler,
};
pub use descriptor::{Capability, HookRef, HttpMethod, PluginDescriptor, PluginId};
pub use error::PluginError;
pub use host::{LoadedPlugin, PluginHost, PluginRegistry};
pub use middleware::{MiddlewareChain, RouteMatcher};
