//! Finds plugin packages on disk.
//!
//! A package is a directory named `plugin-<name>` (optionally
//! `plugin-<name>-<suffix>`) holding a `plugin.json` descriptor.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::descriptor::PluginDescriptor;
use super::error::PluginError;

pub const DESCRIPTOR_FILE: &str = "plugin.json";

static PACKAGE_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^plugin-[a-z]+(-[a-z]+)?$").expect("package pattern is valid"));

pub fn is_package_dir(name: &str) -> bool {
    PACKAGE_DIR.is_match(name)
}

/// Reads every package descriptor under `dir`, sorted by directory name.
///
/// A missing directory yields no plugins. Any unreadable or invalid
/// descriptor fails the whole discovery.
pub async fn discover(dir: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "plugin directory not found; no plugins discovered");
            return Ok(Vec::new());
        }
        Err(e) => return Err(PluginError::malformed(dir.display().to_string(), e.to_string())),
    };

    let mut packages = Vec::new();
    loop {
        let entry = entries
            .next_entry()
            .await
            .map_err(|e| PluginError::malformed(dir.display().to_string(), e.to_string()))?;
        let Some(entry) = entry else { break };

        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir || !is_package_dir(&name) {
            debug!(entry = %name, "skipping non-package entry");
            continue;
        }
        packages.push((name, entry.path()));
    }
    packages.sort();

    let mut descriptors = Vec::with_capacity(packages.len());
    for (name, path) in packages {
        let file = path.join(DESCRIPTOR_FILE);
        let origin = file.display().to_string();
        let bytes = tokio::fs::read(&file)
            .await
            .map_err(|e| PluginError::malformed(&origin, e.to_string()))?;
        let descriptor = PluginDescriptor::from_json(&bytes, &origin)?;
        info!(package = %name, plugin = %descriptor.id(), "discovered plugin");
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}
