//! Plugin manifest schema, versions and validation.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Semantic version of a plugin or of the host.
///
/// Parsing is lenient: a leading `v` is accepted, missing minor/patch
/// components default to zero and build metadata is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Patch version.
    pub patch: u64,
    /// Pre-release tag, if any.
    pub pre: Option<String>,
}

impl Version {
    /// Create a new release version.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse from a string like "10.1.0" or "v9.2.0-beta1".
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some((core, _)) => (core, None),
            None => (without_build, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if core.is_empty() || parts.len() > 3 {
            return Err(Error::invalid_manifest(format!("invalid version: {s}")));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| Error::invalid_manifest(format!("invalid version: {s}")))?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
        })
    }

    /// Release triple, ignoring any pre-release tag.
    pub fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// Check if this version satisfies a minimum, comparing release triples only.
    pub fn satisfies_minimum(&self, minimum: &Version) -> bool {
        self.core() >= minimum.core()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core().cmp(&other.core()).then_with(|| match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Extract the minimum version from a requirement such as `>=9.0.0`,
/// `^10.1`, `>=7.x.x`, `>= 9.2.0 < 11` or `10.0.0 || 11.0.0`.
///
/// Returns `None` for an empty or wildcard requirement.
pub fn parse_minimum_requirement(requirement: &str) -> Result<Option<Version>> {
    let first = requirement.split("||").next().unwrap_or_default().trim();
    if first.is_empty() || first == "*" {
        return Ok(None);
    }

    if first.starts_with('<') {
        // An upper bound alone places no minimum on the host.
        return Ok(None);
    }

    let stripped = first.trim_start_matches(|c: char| matches!(c, '>' | '=' | '^' | '~'));
    let token = stripped
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()
        .unwrap_or_default();

    // `x` and `*` components, as in `>=7.x.x` or `^10.x`, count as zero.
    let parts: Vec<&str> = token
        .split('.')
        .map(|part| if matches!(part, "x" | "X" | "*") { "0" } else { part })
        .collect();
    let version = Version::parse(&parts.join("."))?;
    if version.core() == (0, 0, 0) && version.pre.is_none() {
        return Ok(None);
    }
    Ok(Some(version))
}

/// Plugin type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Data source plugin.
    Datasource,
    /// Panel visualization.
    Panel,
    /// App plugin bundling pages and other plugins.
    App,
    /// Image renderer.
    Renderer,
    /// Secrets manager.
    SecretsManager,
}

impl PluginType {
    /// All plugin types.
    pub const ALL: [PluginType; 5] = [
        Self::Datasource,
        Self::Panel,
        Self::App,
        Self::Renderer,
        Self::SecretsManager,
    ];

    /// Lowercase name as it appears in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datasource => "datasource",
            Self::Panel => "panel",
            Self::App => "app",
            Self::Renderer => "renderer",
            Self::SecretsManager => "secretsmanager",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a plugin was installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginClass {
    /// Shipped inside the host and run in-process.
    Core,
    /// Shipped alongside the host.
    Bundled,
    /// Installed by an operator.
    External,
}

impl PluginClass {
    /// All classes in registration order.
    pub const ALL: [PluginClass; 3] = [Self::Core, Self::Bundled, Self::External];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Bundled => "bundled",
            Self::External => "external",
        }
    }
}

impl fmt::Display for PluginClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend call kinds a plugin can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Data queries.
    Query,
    /// Health checks.
    Health,
    /// Resource (HTTP-like) calls.
    Resource,
    /// Streaming subscribe/publish/run.
    Stream,
    /// Metrics collection.
    Metrics,
}

impl Capability {
    /// All capabilities.
    pub const ALL: [Capability; 5] = [
        Self::Query,
        Self::Health,
        Self::Resource,
        Self::Stream,
        Self::Metrics,
    ];

    fn bit(self) -> u8 {
        match self {
            Self::Query => 1,
            Self::Health => 1 << 1,
            Self::Resource => 1 << 2,
            Self::Stream => 1 << 3,
            Self::Metrics => 1 << 4,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Health => "health",
            Self::Resource => "resource",
            Self::Stream => "stream",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of advertised capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// Empty set.
    pub fn none() -> Self {
        Self(0)
    }

    /// Every capability.
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Add a capability.
    pub fn with(mut self, cap: Capability) -> Self {
        self.0 |= cap.bit();
        self
    }

    /// Check membership.
    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// True if no capability is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the set in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// Host dependency declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDependencies {
    /// Host version requirement, e.g. `>=9.0.0`.
    #[serde(default)]
    pub grafana_dependency: Option<String>,
    /// Legacy plain minimum host version.
    #[serde(default)]
    pub grafana_version: Option<String>,
}

/// Plugin manifest as found on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Plugin ID (unique identifier).
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Plugin type.
    #[serde(rename = "type")]
    pub plugin_type: PluginType,

    /// Plugin version.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Search keywords.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Whether the plugin ships a backend.
    #[serde(default)]
    pub backend: bool,

    /// Backend executable, relative to the package root.
    #[serde(default)]
    pub executable: Option<String>,

    /// Advertised backend capabilities.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Host dependency declarations.
    #[serde(default)]
    pub dependencies: ManifestDependencies,

    /// Directory served as static assets, relative to the package root.
    #[serde(default)]
    pub static_dir: Option<String>,

    /// Bundled resources such as dashboards.
    #[serde(default)]
    pub includes: Vec<PluginInclude>,
}

/// A resource bundled with a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInclude {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Include type, e.g. `dashboard` or `page`.
    #[serde(rename = "type")]
    pub include_type: String,
    /// File path, relative to the package root.
    #[serde(default)]
    pub path: Option<String>,
}

impl PluginInclude {
    /// Include type of bundled dashboards.
    pub const DASHBOARD: &'static str = "dashboard";

    /// True for a dashboard that points at a file.
    pub fn is_dashboard_file(&self) -> bool {
        self.include_type == Self::DASHBOARD && self.path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

impl Manifest {
    /// Create a new manifest with required fields.
    pub fn new(id: impl Into<String>, plugin_type: PluginType, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            plugin_type,
            version: version.into(),
            description: None,
            keywords: Vec::new(),
            backend: false,
            executable: None,
            capabilities: Vec::new(),
            dependencies: ManifestDependencies::default(),
            static_dir: None,
            includes: Vec::new(),
        }
    }

    /// Load a manifest from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            _ => Err(Error::Parse(format!(
                "unsupported manifest format: {}",
                path.display()
            ))),
        }
    }

    /// Read only the `id` of a manifest file.
    ///
    /// Works for manifests that would fail full parsing or validation, as
    /// long as the file is well-formed and carries a string `id`.
    pub fn peek_id(path: &Path) -> Option<String> {
        #[derive(Deserialize)]
        struct IdOnly {
            #[serde(default)]
            id: String,
        }

        let content = std::fs::read_to_string(path).ok()?;
        let parsed: IdOnly = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).ok()?,
            Some("toml") => toml::from_str(&content).ok()?,
            _ => return None,
        };
        Some(parsed.id).filter(|id| !id.is_empty())
    }

    /// Parse manifest from JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Parse manifest from TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_manifest("missing required field: id"));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::invalid_manifest(format!("invalid plugin id: {}", self.id)));
        }

        if self.version.is_empty() {
            return Err(Error::invalid_manifest("missing required field: version"));
        }
        self.parsed_version()?;
        self.min_host_version()?;

        if !self.capabilities.is_empty() && !self.backend {
            return Err(Error::invalid_manifest(
                "capabilities are only valid for plugins with a backend",
            ));
        }

        if let Some(dir) = &self.static_dir {
            if !is_contained(dir) {
                return Err(Error::invalid_manifest(format!(
                    "static directory must stay inside the plugin: {dir}"
                )));
            }
        }

        for path in self.includes.iter().filter_map(|i| i.path.as_deref()) {
            if !is_contained(path) {
                return Err(Error::invalid_manifest(format!(
                    "include must stay inside the plugin: {path}"
                )));
            }
        }

        Ok(())
    }

    /// Parsed plugin version.
    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.version)
    }

    /// Minimum host version, if declared.
    pub fn min_host_version(&self) -> Result<Option<Version>> {
        match (
            &self.dependencies.grafana_dependency,
            &self.dependencies.grafana_version,
        ) {
            (Some(req), _) => parse_minimum_requirement(req),
            (None, Some(req)) => parse_minimum_requirement(req),
            (None, None) => Ok(None),
        }
    }

    /// Declared capabilities as a set.
    pub fn capability_set(&self) -> CapabilitySet {
        self.capabilities.iter().copied().collect()
    }
}

fn is_contained(path: &str) -> bool {
    !Path::new(path).is_absolute() && !path.split(['/', '\\']).any(|c| c == "..")
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(id: impl Into<String>, plugin_type: PluginType, version: impl Into<String>) -> Self {
        Self {
            manifest: Manifest::new(id, plugin_type, version),
        }
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.manifest.name = name.into();
        self
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = Some(desc.into());
        self
    }

    /// Add a keyword.
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.manifest.keywords.push(keyword.into());
        self
    }

    /// Declare a backend with the given executable.
    pub fn executable(mut self, executable: impl Into<String>) -> Self {
        self.manifest.backend = true;
        self.manifest.executable = Some(executable.into());
        self
    }

    /// Declare an in-process backend (no executable).
    pub fn backend(mut self) -> Self {
        self.manifest.backend = true;
        self
    }

    /// Add a capability.
    pub fn capability(mut self, cap: Capability) -> Self {
        self.manifest.capabilities.push(cap);
        self
    }

    /// Add capabilities.
    pub fn capabilities<I>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.manifest.capabilities.extend(caps);
        self
    }

    /// Set the host version requirement.
    pub fn grafana_dependency(mut self, requirement: impl Into<String>) -> Self {
        self.manifest.dependencies.grafana_dependency = Some(requirement.into());
        self
    }

    /// Set the static asset directory.
    pub fn static_dir(mut self, dir: impl Into<String>) -> Self {
        self.manifest.static_dir = Some(dir.into());
        self
    }

    /// Bundle a dashboard file.
    pub fn dashboard(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.manifest.includes.push(PluginInclude {
            name: name.into(),
            include_type: PluginInclude::DASHBOARD.to_string(),
            path: Some(path.into()),
        });
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<Manifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> Manifest {
        self.manifest
    }
}
