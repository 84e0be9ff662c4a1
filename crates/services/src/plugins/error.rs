use domains::StoreError;
use thiserror::Error;

/// Failures of plugin discovery, loading and execution.
#[derive(Error, Debug)]
pub enum PluginError {
    /// A descriptor could not be read or does not describe a usable plugin.
    #[error("malformed plugin descriptor {origin}: {reason}")]
    MalformedDescriptor { origin: String, reason: String },

    #[error("unresolved plugin dependencies: {}", .0.join(", "))]
    UnresolvedDependency(Vec<String>),

    #[error("plugin dependency cycle among: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// The descriptor names a plugin no factory was registered for.
    #[error("no implementation registered for plugin {0}")]
    UnknownPlugin(String),

    #[error("plugin {plugin} does not export {capability} function {function}")]
    MissingFunction {
        plugin: String,
        capability: &'static str,
        function: String,
    },

    #[error("plugin {plugin} failed to initialize: {reason}")]
    Init { plugin: String, reason: String },

    /// Middleware refused the request. The message is shown to the user.
    #[error("{0}")]
    Rejected(String),

    #[error("plugin action failed: {0}")]
    Action(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PluginError {
    pub fn malformed(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::MalformedDescriptor { origin: origin.into(), reason: reason.into() }
    }

    /// Errors that abort startup rather than a single request.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            PluginError::MalformedDescriptor { .. }
                | PluginError::UnresolvedDependency(_)
                | PluginError::DependencyCycle(_)
                | PluginError::UnknownPlugin(_)
                | PluginError::MissingFunction { .. }
                | PluginError::Init { .. }
        )
    }
}
