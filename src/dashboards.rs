//! Dashboard files bundled with plugins.
//!
//! A plugin declares its dashboards as `includes` of type `dashboard` in its
//! manifest. Only declared files can be read, and only while they resolve to
//! a location inside the plugin's root directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;

use crate::backend::BodyStream;
use crate::error::{Error, Result};
use crate::plugin::PluginDefinition;
use crate::registry::PluginRegistry;

/// Streamed contents of one dashboard file.
pub struct DashboardFileContents {
    /// File reference as listed by the plugin.
    pub file_ref: String,
    /// File body.
    pub content: BodyStream,
}

impl fmt::Debug for DashboardFileContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DashboardFileContents")
            .field("file_ref", &self.file_ref)
            .finish_non_exhaustive()
    }
}

/// Read access to the dashboard files of registered plugins.
#[async_trait]
pub trait DashboardFileStore: Send + Sync {
    /// File references of the dashboards bundled with `plugin_id`.
    async fn list_plugin_dashboard_files(&self, plugin_id: &str) -> Result<Vec<String>>;

    /// Contents of one dashboard file of `plugin_id`.
    ///
    /// `file_ref` must be one of the references returned by
    /// [`list_plugin_dashboard_files`](Self::list_plugin_dashboard_files).
    async fn get_plugin_dashboard_file_contents(
        &self,
        plugin_id: &str,
        file_ref: &str,
    ) -> Result<DashboardFileContents>;
}

/// [`DashboardFileStore`] over the plugins in a registry.
#[derive(Debug, Clone)]
pub struct PluginDashboardFiles {
    registry: Arc<PluginRegistry>,
}

impl PluginDashboardFiles {
    /// Serve dashboard files of the plugins in `registry`.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    fn definition(&self, plugin_id: &str) -> Result<PluginDefinition> {
        if plugin_id.is_empty() {
            return Err(Error::InvalidArgument("plugin ID is required".into()));
        }
        self.registry
            .plugin(plugin_id)
            .map(|p| p.definition().clone())
            .ok_or_else(|| Error::not_found(plugin_id))
    }
}

#[async_trait]
impl DashboardFileStore for PluginDashboardFiles {
    async fn list_plugin_dashboard_files(&self, plugin_id: &str) -> Result<Vec<String>> {
        Ok(self.definition(plugin_id)?.dashboards().to_vec())
    }

    async fn get_plugin_dashboard_file_contents(
        &self,
        plugin_id: &str,
        file_ref: &str,
    ) -> Result<DashboardFileContents> {
        let definition = self.definition(plugin_id)?;
        if file_ref.is_empty() {
            return Err(Error::InvalidArgument("dashboard file reference is required".into()));
        }
        if !definition.dashboards().iter().any(|d| d == file_ref) {
            return Err(Error::not_found(format!("{plugin_id}/{file_ref}")));
        }

        let path = contained_path(definition.root(), file_ref).await?;
        let file = tokio::fs::File::open(&path).await?;
        tracing::debug!(plugin_id = %plugin_id, path = %path.display(), "serving dashboard file");

        let content = ReaderStream::new(file)
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed();
        Ok(DashboardFileContents {
            file_ref: file_ref.to_string(),
            content,
        })
    }
}

// Resolves symlinks, so a link pointing out of the package is refused too.
async fn contained_path(root: &Path, file_ref: &str) -> Result<PathBuf> {
    let root = tokio::fs::canonicalize(root).await?;
    let path = tokio::fs::canonicalize(root.join(file_ref)).await?;
    if !path.starts_with(&root) {
        return Err(Error::InvalidArgument(format!(
            "dashboard file escapes the plugin directory: {file_ref}"
        )));
    }
    Ok(path)
}
