//! Typed plugin descriptors (`plugin.json`).
//!
//! A descriptor is read once at startup, validated, and never mutated.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::PluginError;
use super::middleware::RouteMatcher;

/// Composite registry key `name:version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    pub fn new(name: &str, version: &str) -> Self {
        PluginId(format!("{name}:{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        PluginId(value.to_string())
    }
}

/// What a plugin contributes to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Routes,
    Middleware,
    TemplateInjection,
    Context,
    PostSubmitAction,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Routes => "routes",
            Capability::Middleware => "middleware",
            Capability::TemplateInjection => "templateInjection",
            Capability::Context => "context",
            Capability::PostSubmitAction => "postSubmitAction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
        }
    }
}

/// A named plugin function bound to a (method, route) pair.
///
/// `route` is `*` for every route, an exact route template when `explicit`
/// is set (e.g. `/{board}/new`), or otherwise a regular expression matched
/// against the whole route template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRef {
    pub method: HttpMethod,
    pub route: String,
    pub function: String,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub explicit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    /// Required plugins as `name:version`.
    #[serde(default, rename = "pluginDependencies")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provides: BTreeSet<Capability>,
    #[serde(default)]
    pub middleware: Vec<HookRef>,
    #[serde(default)]
    pub template_injection: Vec<HookRef>,
    /// Free-form plugin settings handed to the plugin at init.
    #[serde(default)]
    pub config: Value,
}

impl PluginDescriptor {
    /// Parses and validates a descriptor. `origin` names the source in errors.
    pub fn from_json(bytes: &[u8], origin: &str) -> Result<Self, PluginError> {
        let descriptor: PluginDescriptor = serde_json::from_slice(bytes)
            .map_err(|e| PluginError::malformed(origin, e.to_string()))?;
        descriptor.validate().map_err(|reason| PluginError::malformed(origin, reason))?;
        Ok(descriptor)
    }

    pub fn id(&self) -> PluginId {
        PluginId::new(&self.name, &self.version)
    }

    pub fn provides(&self, capability: Capability) -> bool {
        self.provides.contains(&capability)
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = PluginId> + '_ {
        self.dependencies.iter().map(|d| PluginId::from(d.as_str()))
    }

    /// Checks identity, dependency syntax and hook declarations.
    pub fn validate(&self) -> Result<(), String> {
        if !valid_name(&self.name) {
            return Err(format!("invalid plugin name {:?}", self.name));
        }
        if self.version.trim().is_empty() || self.version.contains(':') {
            return Err(format!("invalid version {:?}", self.version));
        }
        for dep in &self.dependencies {
            match dep.split_once(':') {
                Some((name, version)) if valid_name(name) && !version.is_empty() => {}
                _ => return Err(format!("dependency {dep:?} is not of the form name:version")),
            }
        }

        check_hooks(self, Capability::Middleware, &self.middleware)?;
        check_hooks(self, Capability::TemplateInjection, &self.template_injection)?;
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn check_hooks(descriptor: &PluginDescriptor, capability: Capability, hooks: &[HookRef]) -> Result<(), String> {
    if !hooks.is_empty() && !descriptor.provides(capability) {
        return Err(format!(
            "declares {} entries without providing {}",
            capability.as_str(),
            capability.as_str()
        ));
    }
    for hook in hooks {
        if hook.function.trim().is_empty() {
            return Err(format!("{} entry for {} has no function", capability.as_str(), hook.route));
        }
        RouteMatcher::from_hook(hook)
            .map_err(|e| format!("invalid route pattern {:?}: {e}", hook.route))?;
    }
    Ok(())
}

/// Compiles a route pattern the way [`RouteMatcher`] does.
pub(crate) fn compile_pattern(route: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{route})$"))
}
