//! Read-side resolvers for static asset routes and load errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::PluginError;
use crate::manifest::PluginClass;
use crate::plugin::StaticRoute;

/// Lists static asset routes of registered plugins.
pub trait StaticRouteResolver: Send + Sync {
    /// Routes derived from the current registry snapshot.
    fn routes(&self) -> Vec<StaticRoute>;
}

/// Lists the per-plugin errors of the latest reloads.
pub trait ErrorResolver: Send + Sync {
    /// All current errors.
    fn plugin_errors(&self) -> Vec<PluginError>;

    /// The first error recorded for `plugin_id`.
    fn plugin_error(&self, plugin_id: &str) -> Option<PluginError> {
        self.plugin_errors()
            .into_iter()
            .find(|e| e.plugin_id == plugin_id)
    }
}

/// Latest error set per plugin class.
///
/// Each reload of a class replaces that class's set wholesale; readers get
/// a consistent copy.
#[derive(Debug, Default)]
pub struct PluginErrorStore {
    by_class: RwLock<BTreeMap<PluginClass, Arc<Vec<PluginError>>>>,
}

impl PluginErrorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the error set of `class`.
    pub fn replace(&self, class: PluginClass, errors: Vec<PluginError>) {
        let mut by_class = self.by_class.write();
        if errors.is_empty() {
            by_class.remove(&class);
        } else {
            by_class.insert(class, Arc::new(errors));
        }
    }

    /// Errors of a single class.
    pub fn errors_for(&self, class: PluginClass) -> Arc<Vec<PluginError>> {
        self.by_class
            .read()
            .get(&class)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of stored errors.
    pub fn len(&self) -> usize {
        self.by_class.read().values().map(|v| v.len()).sum()
    }

    /// True if no class has errors.
    pub fn is_empty(&self) -> bool {
        self.by_class.read().is_empty()
    }
}

impl ErrorResolver for PluginErrorStore {
    fn plugin_errors(&self) -> Vec<PluginError> {
        self.by_class
            .read()
            .values()
            .flat_map(|errors| errors.iter().cloned())
            .collect()
    }
}
