//! Repository lookups used by [`PluginRegistry::add`](crate::PluginRegistry::add).

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::compat::CompatibilityOpts;
use crate::error::{Error, Result};
use crate::loader::PluginLoader;
use crate::manifest::{PluginClass, Version};
use crate::plugin::PluginDefinition;

/// Resolves a plugin ID and version to a definition.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    /// Resolve `plugin_id` at `version`.
    ///
    /// An empty version, or `latest`, picks the highest available version.
    /// Fails with [`Error::NotFound`] on a miss and [`Error::Cancelled`] once
    /// `cancel` fires.
    async fn resolve(
        &self,
        plugin_id: &str,
        version: &str,
        opts: &CompatibilityOpts,
        cancel: &CancellationToken,
    ) -> Result<PluginDefinition>;
}

/// Repository backed by directories of unpacked plugin packages.
///
/// Several versions of one plugin may sit side by side, e.g.
/// `repo/pg-1.0.0/plugin.json` and `repo/pg-2.0.0/plugin.json`.
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    loader: PluginLoader,
    class: PluginClass,
    paths: Vec<PathBuf>,
}

impl DirectoryRepository {
    /// Create a repository over `paths` producing plugins of `class`.
    pub fn new(loader: PluginLoader, class: PluginClass, paths: Vec<PathBuf>) -> Self {
        Self {
            loader,
            class,
            paths,
        }
    }

    // Blocking; run off the async workers.
    fn candidates(&self, plugin_id: &str, cancel: &CancellationToken) -> Result<Vec<PluginDefinition>> {
        // Each path is scanned on its own so that side-by-side versions are
        // not reported as duplicates of one another.
        let mut found = Vec::new();
        for path in &self.paths {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut dirs: Vec<PathBuf> = match std::fs::read_dir(path) {
                Ok(entries) => entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect(),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "repository path unreadable");
                    continue;
                }
            };
            dirs.sort();

            for dir in dirs {
                let outcome = self.loader.load(self.class, &[dir], &HashSet::new(), cancel)?;
                found.extend(outcome.plugins.into_iter().filter(|p| p.id() == plugin_id));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl RepositoryService for DirectoryRepository {
    async fn resolve(
        &self,
        plugin_id: &str,
        version: &str,
        _opts: &CompatibilityOpts,
        cancel: &CancellationToken,
    ) -> Result<PluginDefinition> {
        let repo = self.clone();
        let id = plugin_id.to_string();
        let scan_cancel = cancel.clone();
        let candidates = tokio::task::spawn_blocking(move || repo.candidates(&id, &scan_cancel))
            .await
            .map_err(|e| Error::Backend(format!("repository scan panicked: {e}")))??;

        let wanted = match version.trim() {
            "" | "latest" => None,
            v => Some(Version::parse(v).map_err(|_| Error::not_found(format!("{plugin_id}@{v}")))?),
        };

        let chosen = match wanted {
            Some(wanted) => candidates.into_iter().find(|p| p.version() == &wanted),
            None => candidates.into_iter().max_by(|a, b| a.version().cmp(b.version())),
        };

        chosen.ok_or_else(|| {
            if version.is_empty() {
                Error::not_found(plugin_id)
            } else {
                Error::not_found(format!("{plugin_id}@{version}"))
            }
        })
    }
}
