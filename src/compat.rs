//! Host version compatibility gate.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::manifest::Version;
use crate::plugin::PluginDefinition;

/// Inputs to the compatibility check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompatibilityOpts {
    /// Running host version.
    pub grafana_version: String,
}

impl CompatibilityOpts {
    /// Options for the given host version.
    pub fn new(grafana_version: impl Into<String>) -> Self {
        Self {
            grafana_version: grafana_version.into(),
        }
    }
}

/// Checks a plugin's minimum host version against the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatibilityChecker;

impl CompatibilityChecker {
    /// Fail with [`Error::VersionIncompatible`] unless host >= minimum.
    ///
    /// An empty or unparseable host version is a development build and
    /// passes every plugin.
    pub fn check(definition: &PluginDefinition, opts: &CompatibilityOpts) -> Result<()> {
        let Some(required) = definition.min_host_version() else {
            return Ok(());
        };

        let host = match Version::parse(&opts.grafana_version) {
            Ok(host) => host,
            Err(_) => {
                tracing::warn!(
                    plugin_id = %definition.id(),
                    host_version = %opts.grafana_version,
                    "host version not parseable, skipping compatibility check"
                );
                return Ok(());
            }
        };

        if host.satisfies_minimum(required) {
            Ok(())
        } else {
            Err(Error::version_incompatible(
                definition.id(),
                required.to_string(),
                host.to_string(),
            ))
        }
    }
}
