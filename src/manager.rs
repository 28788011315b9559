//! Plugin manager: configuration, reload and reconciliation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::authorizer::SignatureAuthorizer;
use crate::backend::BackendFactoryProvider;
use crate::client::{BackendClient, ClientConfig};
use crate::compat::CompatibilityOpts;
use crate::error::{Error, PluginError, PluginErrorKind, Result};
use crate::lifecycle::LifecycleEvent;
use crate::loader::{LoadOutcome, LoaderConfig, PluginLoader};
use crate::manifest::{PluginClass, Version};
use crate::plugin::{PluginDefinition, StaticRoute};
use crate::provisioning::Provisioner;
use crate::registry::{PluginRegistry, RegistryConfig};
use crate::resolver::{ErrorResolver, PluginErrorStore, StaticRouteResolver};

/// Directories scanned for one plugin class.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginSource {
    /// Class given to every plugin found here.
    pub class: PluginClass,
    /// Directories, scanned in order.
    pub paths: Vec<PathBuf>,
}

/// Manager configuration, usually read from TOML.
///
/// ```toml
/// grafana_version = "10.2.0"
/// allow_unsigned_plugins = ["my-dev-panel"]
///
/// [[sources]]
/// class = "external"
/// paths = ["/var/lib/monitor/plugins"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Running host version, checked against plugin requirements.
    pub grafana_version: String,
    /// Plugin sources.
    pub sources: Vec<PluginSource>,
    /// Plugin IDs never loaded.
    pub ignore: Vec<String>,
    /// Unsigned plugins allowed to load.
    pub allow_unsigned_plugins: Vec<String>,
    /// Drain timeout for removals, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Backend start timeout, in milliseconds.
    pub start_timeout_ms: u64,
    /// Manifest file names, in priority order.
    pub manifest_names: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            grafana_version: String::new(),
            sources: Vec::new(),
            ignore: Vec::new(),
            allow_unsigned_plugins: Vec::new(),
            drain_timeout_ms: registry.drain_timeout.as_millis() as u64,
            start_timeout_ms: registry.start_timeout.as_millis() as u64,
            manifest_names: LoaderConfig::default().manifest_names,
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Set the host version.
    pub fn with_grafana_version(mut self, version: impl Into<String>) -> Self {
        self.grafana_version = version.into();
        self
    }

    /// Add a source directory for `class`.
    pub fn with_source(mut self, class: PluginClass, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match self.sources.iter_mut().find(|s| s.class == class) {
            Some(source) => source.paths.push(path),
            None => self.sources.push(PluginSource {
                class,
                paths: vec![path],
            }),
        }
        self
    }

    /// Ignore a plugin ID.
    pub fn with_ignored(mut self, id: impl Into<String>) -> Self {
        self.ignore.push(id.into());
        self
    }

    /// Allow an unsigned plugin.
    pub fn with_unsigned_allowed(mut self, id: impl Into<String>) -> Self {
        self.allow_unsigned_plugins.push(id.into());
        self
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Source paths of one class, in configuration order.
    pub fn paths_for(&self, class: PluginClass) -> Vec<PathBuf> {
        self.sources
            .iter()
            .filter(|s| s.class == class)
            .flat_map(|s| s.paths.iter().cloned())
            .collect()
    }

    /// Classes with at least one source, in registration order.
    pub fn classes(&self) -> Vec<PluginClass> {
        PluginClass::ALL
            .into_iter()
            .filter(|c| self.sources.iter().any(|s| s.class == *c))
            .collect()
    }

    /// Registry configuration derived from this one.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new()
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .with_start_timeout(Duration::from_millis(self.start_timeout_ms))
    }

    /// Loader configuration derived from this one.
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig::new().with_manifest_names(self.manifest_names.clone())
    }

    /// Compatibility options derived from this one.
    pub fn compat_opts(&self) -> CompatibilityOpts {
        CompatibilityOpts::new(self.grafana_version.clone())
    }
}

/// Pauses and resumes change detection for a plugin class around a reload.
pub trait WatchControl: Send + Sync {
    /// Stop watching `class`.
    fn stop(&self, class: PluginClass);

    /// Start watching `paths` for `class`.
    fn start(&self, class: PluginClass, paths: &[PathBuf]) -> Result<()>;
}

/// Watch control that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatch;

impl WatchControl for NoopWatch {
    fn stop(&self, _class: PluginClass) {}

    fn start(&self, _class: PluginClass, _paths: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Newly registered plugins.
    pub added: Vec<String>,
    /// Plugins replaced by another version or location.
    pub updated: Vec<String>,
    /// Plugins no longer on disk.
    pub removed: Vec<String>,
    /// Plugins left as they were.
    pub unchanged: Vec<String>,
    /// Per-plugin errors.
    pub errors: Vec<PluginError>,
}

impl ReloadSummary {
    /// Number of plugins added or updated.
    pub fn changed(&self) -> usize {
        self.added.len() + self.updated.len()
    }

    /// Number of plugins active after the reload.
    pub fn active(&self) -> usize {
        self.added.len() + self.updated.len() + self.unchanged.len()
    }
}

/// Owns the loader, registry and client, and keeps the registry in step with
/// the configured plugin directories.
pub struct PluginManager {
    config: ManagerConfig,
    loader: PluginLoader,
    registry: Arc<PluginRegistry>,
    client: BackendClient,
    errors: Arc<PluginErrorStore>,
    watch: Arc<dyn WatchControl>,
    compat: CompatibilityOpts,
    reload_lock: tokio::sync::Mutex<()>,
}

impl PluginManager {
    /// Create a manager whose registry builds backends through `provider`.
    pub fn new(config: ManagerConfig, provider: Arc<dyn BackendFactoryProvider>) -> Self {
        let authorizer = Arc::new(SignatureAuthorizer::new(config.allow_unsigned_plugins.clone()));
        let registry =
            Arc::new(PluginRegistry::new(config.registry_config(), provider).with_authorizer(authorizer));
        Self::with_registry(config, registry)
    }

    /// Create a manager over an existing registry.
    ///
    /// Plugins are authorized by the registry's authorizer, so the
    /// `allow_unsigned_plugins` setting only applies through [`new`](Self::new).
    pub fn with_registry(config: ManagerConfig, registry: Arc<PluginRegistry>) -> Self {
        Self {
            loader: PluginLoader::new(config.loader_config()),
            client: BackendClient::new(registry.clone()),
            compat: config.compat_opts(),
            registry,
            errors: Arc::new(PluginErrorStore::new()),
            watch: Arc::new(NoopWatch),
            reload_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// Use a watch control around reloads.
    pub fn with_watch(mut self, watch: Arc<dyn WatchControl>) -> Self {
        self.watch = watch;
        self
    }

    /// Configure the backend client.
    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client = BackendClient::with_config(self.registry.clone(), config);
        self
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Get the backend client.
    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    /// Get the error store.
    pub fn errors(&self) -> &Arc<PluginErrorStore> {
        &self.errors
    }

    /// Static routes of all registered plugins.
    pub fn routes(&self) -> Vec<StaticRoute> {
        self.registry.routes()
    }

    /// Errors of the latest reload of every class.
    pub fn plugin_errors(&self) -> Vec<PluginError> {
        self.errors.plugin_errors()
    }

    /// Reload every configured class in registration order.
    ///
    /// A class whose candidates all failed is logged and skipped; I/O
    /// failures and cancellation abort.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        for class in self.config.classes() {
            match self.reload(class, cancel).await {
                Ok(_) => {}
                Err(Error::Reload(reason)) => {
                    tracing::warn!(class = %class, reason = %reason, "no plugins of class could be loaded");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Re-scan the sources of `class` and reconcile the registry with them.
    ///
    /// Reloads are serialized. Change detection for the class is paused for
    /// the duration and resumed even if the reload fails.
    pub async fn reload(&self, class: PluginClass, cancel: &CancellationToken) -> Result<ReloadSummary> {
        let _serial = self.reload_lock.lock().await;
        let paths = self.config.paths_for(class);

        self.watch.stop(class);
        let result = self.scan_and_reconcile(class, &paths, cancel).await;
        if let Err(err) = self.watch.start(class, &paths) {
            tracing::warn!(class = %class, error = %err, "failed to resume watching");
        }

        result
    }

    /// Reconcile the registry with an already computed scan of `class`.
    pub async fn reconcile(&self, class: PluginClass, outcome: LoadOutcome) -> Result<ReloadSummary> {
        let _serial = self.reload_lock.lock().await;
        self.reconcile_locked(class, outcome).await
    }

    async fn scan_and_reconcile(
        &self,
        class: PluginClass,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<ReloadSummary> {
        let mut ignore: HashSet<String> = self.config.ignore.iter().cloned().collect();
        ignore.extend(
            self.registry
                .plugins(&[])
                .into_iter()
                .filter(|p| p.class() != class)
                .map(|p| p.id().to_string()),
        );

        let loader = self.loader.clone();
        let scan_paths = paths.to_vec();
        let scan_cancel = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            loader.load(class, &scan_paths, &ignore, &scan_cancel)
        })
        .await
        .map_err(|e| Error::Reload(format!("plugin scan panicked: {e}")))??;

        self.reconcile_locked(class, outcome).await
    }

    async fn reconcile_locked(&self, class: PluginClass, outcome: LoadOutcome) -> Result<ReloadSummary> {
        let candidates = outcome.candidates();
        let mut summary = ReloadSummary {
            errors: outcome.errors,
            ..ReloadSummary::default()
        };

        let mut discovered: BTreeMap<String, PluginDefinition> = BTreeMap::new();
        let authorizer = self.registry.authorizer();
        for definition in outcome.plugins {
            if !authorizer.can_load_plugin(&definition) {
                tracing::warn!(plugin_id = %definition.id(), signature = ?definition.signature(), "plugin not authorized to load");
                summary.errors.push(
                    PluginError::new(
                        definition.id(),
                        PluginErrorKind::Unauthorized,
                        "plugin is not authorized to load",
                    )
                    .with_path(definition.root())
                    .with_signature(definition.signature()),
                );
                continue;
            }
            discovered.insert(definition.id().to_string(), definition);
        }

        let active: HashMap<String, (Version, PathBuf)> = self
            .registry
            .plugins_of_class(class)
            .into_iter()
            .map(|p| {
                let current = (p.version().clone(), p.definition().root().to_path_buf());
                (p.id().to_string(), current)
            })
            .collect();

        let mut gone: Vec<&String> = active.keys().filter(|id| !discovered.contains_key(*id)).collect();
        gone.sort();
        for id in gone {
            match self.registry.remove(id).await {
                Ok(()) => summary.removed.push(id.clone()),
                Err(err) => summary.errors.push(PluginError::from_error(id.as_str(), &err)),
            }
        }

        for (id, definition) in discovered {
            let replacing = match active.get(&id) {
                Some((version, root)) if version == definition.version() && root == definition.root() => {
                    summary.unchanged.push(id);
                    continue;
                }
                Some(_) => {
                    if let Err(err) = self.registry.remove(&id).await {
                        summary.errors.push(PluginError::from_error(id.as_str(), &err));
                        continue;
                    }
                    true
                }
                None => false,
            };

            let root = definition.root().to_path_buf();
            let signature = definition.signature();
            match self.registry.register(definition, &self.compat).await {
                Ok(()) if replacing => summary.updated.push(id),
                Ok(()) => summary.added.push(id),
                Err(err) => summary.errors.push(
                    PluginError::from_error(id.as_str(), &err)
                        .with_path(root)
                        .with_signature(signature),
                ),
            }
        }

        self.errors.replace(class, summary.errors.clone());

        tracing::info!(
            class = %class,
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged.len(),
            errors = summary.errors.len(),
            "plugins reconciled"
        );
        self.registry.emit(LifecycleEvent::Reloaded {
            class,
            changed: summary.changed(),
            removed: summary.removed.len(),
            at: std::time::Instant::now(),
        });

        if candidates > 0 && summary.active() == 0 && self.registry.plugins_of_class(class).is_empty() {
            return Err(Error::Reload(format!(
                "all {candidates} {class} plugin candidates failed to load"
            )));
        }

        Ok(summary)
    }

    /// Stop watching and remove every plugin.
    pub async fn shutdown(&self) {
        let _serial = self.reload_lock.lock().await;
        for class in PluginClass::ALL {
            self.watch.stop(class);
        }
        self.registry.shutdown().await;
    }
}

#[async_trait]
impl Provisioner for PluginManager {
    async fn reload(&self, cancel: &CancellationToken) -> Result<()> {
        let mut first_error = None;
        for class in self.config.classes() {
            if let Err(err) = PluginManager::reload(self, class, cancel).await {
                if matches!(err, Error::Cancelled) {
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("plugin_count", &self.registry.len())
            .field("error_count", &self.errors.len())
            .finish()
    }
}
