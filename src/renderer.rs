//! Lookup of the active renderer plugin.

use crate::manifest::PluginType;
use crate::plugin::{BackendStatus, PluginDto};
use crate::registry::PluginRegistry;

/// Finds the plugin that renders panels to images.
pub trait RendererManager: Send + Sync {
    /// The active renderer, if one is registered and its backend is alive.
    fn renderer(&self) -> Option<PluginDto>;
}

impl RendererManager for PluginRegistry {
    fn renderer(&self) -> Option<PluginDto> {
        // `plugins` is sorted by ID, so the choice is stable across calls.
        self.plugins(&[PluginType::Renderer])
            .into_iter()
            .find(|p| p.backend_status() != BackendStatus::Exited)
    }
}
