//! Plugin discovery from the filesystem.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, PluginError, PluginErrorKind, Result};
use crate::manifest::{Manifest, PluginClass};
use crate::plugin::{PluginDefinition, SignatureStatus};

/// Signature file marking a signed package.
pub const SIGNATURE_FILE: &str = "MANIFEST.txt";

/// Configuration for the plugin loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Manifest file names marking a package root, in priority order.
    pub manifest_names: Vec<String>,
    /// Maximum directory depth below each root.
    pub max_depth: usize,
    /// Directory names never descended into.
    pub skip_dirs: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            manifest_names: vec!["plugin.json".to_string(), "plugin.toml".to_string()],
            max_depth: 8,
            skip_dirs: vec!["node_modules".to_string()],
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manifest file names.
    pub fn with_manifest_names(mut self, names: Vec<String>) -> Self {
        self.manifest_names = names;
        self
    }

    /// Set the maximum scan depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Add a directory name to skip.
    pub fn with_skip_dir(mut self, name: impl Into<String>) -> Self {
        self.skip_dirs.push(name.into());
        self
    }
}

/// Result of a scan: valid definitions plus per-plugin errors.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Valid, de-duplicated definitions in discovery order.
    pub plugins: Vec<PluginDefinition>,
    /// Non-fatal errors for packages that were skipped.
    pub errors: Vec<PluginError>,
}

impl LoadOutcome {
    /// Number of packages found, valid or not.
    pub fn candidates(&self) -> usize {
        self.plugins.len() + self.errors.len()
    }
}

/// Plugin loader for discovering plugin packages.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    config: LoaderConfig,
}

impl PluginLoader {
    /// Create a new plugin loader.
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Scan `paths` for plugin packages of the given class.
    ///
    /// Every call re-reads the disk. Packages whose ID is in `ignore` are
    /// skipped. When an ID appears twice, the first package in path order
    /// wins and each later copy is reported as a conflict.
    pub fn load(
        &self,
        class: PluginClass,
        paths: &[PathBuf],
        ignore: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome> {
        let mut manifests = Vec::new();
        for root in paths {
            if !root.exists() {
                tracing::warn!(class = %class, path = %root.display(), "plugin path does not exist");
                continue;
            }
            if root.is_file() {
                manifests.push(root.clone());
                continue;
            }
            // An unreadable root aborts the scan.
            std::fs::read_dir(root)?;
            self.scan_dir(root, 0, cancel, &mut manifests)?;
        }

        let mut outcome = LoadOutcome::default();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for manifest_path in manifests {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let package_root = manifest_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();

            // Ignored packages are skipped before validation so that a broken
            // manifest under an ignored ID is never reported.
            let raw_id = Manifest::peek_id(&manifest_path).unwrap_or_else(|| package_name(&package_root));
            if ignore.contains(&raw_id) {
                tracing::debug!(plugin_id = %raw_id, "plugin ignored");
                continue;
            }

            let definition = match self.read_definition(class, &manifest_path, &package_root) {
                Ok(definition) => definition,
                Err((plugin_id, err)) => {
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        path = %manifest_path.display(),
                        error = %err,
                        "skipping invalid plugin"
                    );
                    outcome.errors.push(
                        PluginError::from_error(plugin_id, &err).with_path(&manifest_path),
                    );
                    continue;
                }
            };

            if let Some(first) = seen.get(definition.id()) {
                tracing::warn!(
                    plugin_id = %definition.id(),
                    path = %manifest_path.display(),
                    winner = %first.display(),
                    "duplicate plugin id"
                );
                outcome.errors.push(
                    PluginError::new(
                        definition.id(),
                        PluginErrorKind::Conflict,
                        format!("duplicate plugin id, already loaded from {}", first.display()),
                    )
                    .with_path(&manifest_path)
                    .with_signature(definition.signature()),
                );
                continue;
            }

            seen.insert(definition.id().to_string(), manifest_path);
            outcome.plugins.push(definition);
        }

        tracing::debug!(
            class = %class,
            plugins = outcome.plugins.len(),
            errors = outcome.errors.len(),
            "plugin scan complete"
        );

        Ok(outcome)
    }

    fn scan_dir(
        &self,
        dir: &Path,
        depth: usize,
        cancel: &CancellationToken,
        manifests: &mut Vec<PathBuf>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(manifest) = self.manifest_in(dir) {
            manifests.push(manifest);
        }

        if depth >= self.config.max_depth {
            return Ok(());
        }

        let mut children: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir() && !self.is_skipped(p))
                .collect(),
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "cannot read plugin directory");
                return Ok(());
            }
        };
        children.sort();

        for child in children {
            self.scan_dir(&child, depth + 1, cancel, manifests)?;
        }

        Ok(())
    }

    fn manifest_in(&self, dir: &Path) -> Option<PathBuf> {
        self.config
            .manifest_names
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    fn is_skipped(&self, path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.starts_with('.') || self.config.skip_dirs.iter().any(|s| s == name),
            None => true,
        }
    }

    fn read_definition(
        &self,
        class: PluginClass,
        manifest_path: &Path,
        package_root: &Path,
    ) -> std::result::Result<PluginDefinition, (String, Error)> {
        let fallback_id = package_name(package_root);

        let manifest = Manifest::from_file(manifest_path).map_err(|e| (fallback_id.clone(), e))?;
        let plugin_id = if manifest.id.is_empty() {
            fallback_id
        } else {
            manifest.id.clone()
        };

        if class != PluginClass::Core && manifest.backend && manifest.executable.is_none() {
            return Err((
                plugin_id,
                Error::invalid_manifest("backend plugins must declare an executable"),
            ));
        }

        let signature = signature_status(class, package_root);
        let definition = PluginDefinition::from_manifest(&manifest, class, package_root, signature)
            .map_err(|e| (plugin_id, e))?
            .with_manifest_path(manifest_path);

        Ok(match class {
            PluginClass::Core => definition.without_static_route(),
            _ => definition,
        })
    }
}

fn package_name(package_root: &Path) -> String {
    package_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

/// Signature status of a package.
///
/// Only the presence of the signature file is checked here; verifying its
/// contents belongs to whoever supplies the authorizer.
pub fn signature_status(class: PluginClass, package_root: &Path) -> SignatureStatus {
    if class == PluginClass::Core {
        SignatureStatus::Internal
    } else if package_root.join(SIGNATURE_FILE).is_file() {
        SignatureStatus::Valid
    } else {
        SignatureStatus::Unsigned
    }
}
