//! Load-order resolution.
//!
//! Dependencies load before their dependents. Plugins with no ordering
//! constraint between them load in ascending id order.

use std::collections::{BTreeMap, BTreeSet};

use super::descriptor::{PluginDescriptor, PluginId};
use super::error::PluginError;

/// Orders `descriptors` so that every plugin follows all of its
/// dependencies (Kahn's algorithm).
pub fn resolve_load_order(descriptors: &[PluginDescriptor]) -> Result<Vec<PluginId>, PluginError> {
    let known: BTreeMap<PluginId, &PluginDescriptor> =
        descriptors.iter().map(|d| (d.id(), d)).collect();

    let missing: BTreeSet<String> = descriptors
        .iter()
        .flat_map(|d| d.dependency_ids())
        .filter(|dep| !known.contains_key(dep))
        .map(|dep| dep.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(PluginError::UnresolvedDependency(missing.into_iter().collect()));
    }

    let mut pending: BTreeMap<&PluginId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<PluginId, Vec<&PluginId>> = BTreeMap::new();
    for (id, descriptor) in &known {
        let deps: BTreeSet<PluginId> = descriptor.dependency_ids().collect();
        pending.insert(id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&PluginId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(known.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < known.len() {
        let stuck = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PluginError::DependencyCycle(stuck));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &str, deps: &[&str]) -> PluginDescriptor {
        let json = serde_json::json!({
            "name": name,
            "version": "1",
            "pluginDependencies": deps,
        });
        serde_json::from_value(json).unwrap()
    }

    fn names(order: &[PluginId]) -> Vec<&str> {
        order.iter().map(PluginId::as_str).collect()
    }

    #[test]
    fn dependencies_load_first() {
        let order = resolve_load_order(&[
            plugin("c", &["b:1"]),
            plugin("b", &["a:1"]),
            plugin("a", &[]),
        ])
        .unwrap();
        assert_eq!(names(&order), vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn independent_plugins_are_ordered_by_id() {
        let order = resolve_load_order(&[plugin("zeta", &[]), plugin("alpha", &[]), plugin("mid", &["zeta:1"])]).unwrap();
        assert_eq!(names(&order), vec!["alpha:1", "zeta:1", "mid:1"]);
    }

    #[test]
    fn shared_dependency_loads_once_before_all_dependents() {
        let order = resolve_load_order(&[
            plugin("x", &["base:1"]),
            plugin("y", &["base:1", "x:1"]),
            plugin("base", &[]),
        ])
        .unwrap();
        assert_eq!(names(&order), vec!["base:1", "x:1", "y:1"]);
    }

    #[test]
    fn missing_dependencies_are_reported_by_name() {
        let err = resolve_load_order(&[plugin("a", &["ghost:2", "b:9"])]).unwrap_err();
        match err {
            PluginError::UnresolvedDependency(missing) => assert_eq!(missing, vec!["b:9", "ghost:2"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let err = resolve_load_order(&[
            plugin("a", &["b:1"]),
            plugin("b", &["a:1"]),
            plugin("free", &[]),
        ])
        .unwrap_err();
        match err {
            PluginError::DependencyCycle(members) => assert_eq!(members, vec!["a:1", "b:1"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(matches!(
            resolve_load_order(&[plugin("a", &["a:1"])]),
            Err(PluginError::DependencyCycle(_))
        ));
    }
}
