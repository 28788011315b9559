//! Plugin definitions and their read-only projections.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::manifest::{Capability, CapabilitySet, Manifest, PluginClass, PluginType, Version};

/// URL prefix under which plugin assets are served.
pub const STATIC_ROUTE_PREFIX: &str = "/public/plugins";

/// Outcome of the package signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignatureStatus {
    /// Core plugin shipped with the host.
    Internal,
    /// Signed package.
    Valid,
    /// Signature present but does not verify.
    Invalid,
    /// Signed, but files changed after signing.
    Modified,
    /// No signature found.
    Unsigned,
}

impl SignatureStatus {
    /// True for statuses that never need an explicit allow-list entry.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Internal | Self::Valid)
    }
}

/// Static asset route of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StaticRoute {
    /// URL prefix, e.g. `/public/plugins/mysql`.
    pub prefix: String,
    /// Directory served under the prefix.
    pub directory: PathBuf,
}

impl StaticRoute {
    /// Route for a plugin ID serving the given directory.
    pub fn for_plugin(plugin_id: &str, directory: impl Into<PathBuf>) -> Self {
        Self {
            prefix: format!("{STATIC_ROUTE_PREFIX}/{plugin_id}"),
            directory: directory.into(),
        }
    }
}

/// A validated plugin discovered on disk or resolved from a repository.
///
/// Immutable once constructed; share it through [`Arc`].
#[derive(Debug, Clone)]
pub struct PluginDefinition {
    id: String,
    name: String,
    plugin_type: PluginType,
    class: PluginClass,
    version: Version,
    min_host_version: Option<Version>,
    root: PathBuf,
    manifest_path: Option<PathBuf>,
    static_route: Option<StaticRoute>,
    capabilities: CapabilitySet,
    backend: bool,
    executable: Option<PathBuf>,
    signature: SignatureStatus,
    description: Option<String>,
    keywords: Vec<String>,
    dashboards: Vec<String>,
}

impl PluginDefinition {
    /// Build a definition from a validated manifest.
    pub fn from_manifest(
        manifest: &Manifest,
        class: PluginClass,
        root: impl Into<PathBuf>,
        signature: SignatureStatus,
    ) -> Result<Self> {
        manifest.validate()?;
        let root = root.into();

        let version = manifest.parsed_version()?;
        let min_host_version = manifest.min_host_version()?;
        let static_dir = match &manifest.static_dir {
            Some(dir) => root.join(dir),
            None => root.clone(),
        };

        Ok(Self {
            id: manifest.id.clone(),
            name: if manifest.name.is_empty() {
                manifest.id.clone()
            } else {
                manifest.name.clone()
            },
            plugin_type: manifest.plugin_type,
            class,
            version,
            min_host_version,
            static_route: Some(StaticRoute::for_plugin(&manifest.id, static_dir)),
            capabilities: manifest.capability_set(),
            backend: manifest.backend,
            executable: manifest.executable.as_ref().map(|e| root.join(e)),
            signature,
            description: manifest.description.clone(),
            keywords: manifest.keywords.clone(),
            dashboards: manifest
                .includes
                .iter()
                .filter(|i| i.is_dashboard_file())
                .filter_map(|i| i.path.clone())
                .collect(),
            manifest_path: None,
            root,
        })
    }

    /// Record the manifest file the definition was read from.
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Drop the static route (core plugins whose assets ship with the host).
    pub fn without_static_route(mut self) -> Self {
        self.static_route = None;
        self
    }

    /// Plugin ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin type.
    pub fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    /// Plugin class.
    pub fn class(&self) -> PluginClass {
        self.class
    }

    /// Plugin version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Minimum host version, if declared.
    pub fn min_host_version(&self) -> Option<&Version> {
        self.min_host_version.as_ref()
    }

    /// Package root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest file, if known.
    pub fn manifest_path(&self) -> Option<&Path> {
        self.manifest_path.as_deref()
    }

    /// Static asset route.
    pub fn static_route(&self) -> Option<&StaticRoute> {
        self.static_route.as_ref()
    }

    /// Advertised capabilities.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Check a single capability.
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Whether the plugin ships a backend.
    pub fn has_backend(&self) -> bool {
        self.backend
    }

    /// Absolute path of the backend executable.
    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// Signature status.
    pub fn signature(&self) -> SignatureStatus {
        self.signature
    }

    /// Description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Keywords.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Bundled dashboard files, relative to the package root.
    pub fn dashboards(&self) -> &[String] {
        &self.dashboards
    }
}

impl fmt::Display for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({}, {})", self.id, self.version, self.plugin_type, self.class)
    }
}

/// State of a registered plugin's backend at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendStatus {
    /// Plugin has no backend.
    NotApplicable,
    /// Backend started and accepting calls.
    Running,
    /// Backend process exited.
    Exited,
}

/// Read-only view of a registered plugin.
#[derive(Debug, Clone)]
pub struct PluginDto {
    definition: Arc<PluginDefinition>,
    backend_status: BackendStatus,
}

impl PluginDto {
    pub(crate) fn new(definition: Arc<PluginDefinition>, backend_status: BackendStatus) -> Self {
        Self {
            definition,
            backend_status,
        }
    }

    /// Plugin ID.
    pub fn id(&self) -> &str {
        self.definition.id()
    }

    /// Plugin version.
    pub fn version(&self) -> &Version {
        self.definition.version()
    }

    /// Plugin type.
    pub fn plugin_type(&self) -> PluginType {
        self.definition.plugin_type()
    }

    /// Plugin class.
    pub fn class(&self) -> PluginClass {
        self.definition.class()
    }

    /// Backend state when the snapshot was taken.
    pub fn backend_status(&self) -> BackendStatus {
        self.backend_status
    }

    /// Underlying definition.
    pub fn definition(&self) -> &PluginDefinition {
        &self.definition
    }
}
