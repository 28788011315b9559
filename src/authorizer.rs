//! Load-time authorization gate.

use std::collections::HashSet;

use crate::plugin::{PluginDefinition, SignatureStatus};

/// Decides whether a discovered plugin may be registered.
///
/// Implementations must be pure: no side effects, same answer for the same
/// definition.
pub trait PluginLoaderAuthorizer: Send + Sync {
    /// Confirm the plugin is authorized to load.
    fn can_load_plugin(&self, plugin: &PluginDefinition) -> bool;
}

impl<F> PluginLoaderAuthorizer for F
where
    F: Fn(&PluginDefinition) -> bool + Send + Sync,
{
    fn can_load_plugin(&self, plugin: &PluginDefinition) -> bool {
        self(plugin)
    }
}

/// Authorizes every plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PluginLoaderAuthorizer for AllowAll {
    fn can_load_plugin(&self, _plugin: &PluginDefinition) -> bool {
        true
    }
}

/// Authorizes by signature status.
///
/// Internal and valid signatures always pass. Unsigned plugins pass only when
/// their ID is allow-listed. Invalid or modified signatures never pass.
#[derive(Debug, Clone, Default)]
pub struct SignatureAuthorizer {
    allow_unsigned: HashSet<String>,
}

impl SignatureAuthorizer {
    /// Create an authorizer with an allow-list of unsigned plugin IDs.
    pub fn new<I, S>(allow_unsigned: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_unsigned: allow_unsigned.into_iter().map(Into::into).collect(),
        }
    }
}

impl PluginLoaderAuthorizer for SignatureAuthorizer {
    fn can_load_plugin(&self, plugin: &PluginDefinition) -> bool {
        match plugin.signature() {
            SignatureStatus::Internal | SignatureStatus::Valid => true,
            SignatureStatus::Unsigned => self.allow_unsigned.contains(plugin.id()),
            SignatureStatus::Invalid | SignatureStatus::Modified => false,
        }
    }
}
