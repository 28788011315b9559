//! Plugin registry: the set of active plugins and their backend handles.
//!
//! Readers work against an immutable snapshot that is swapped atomically on
//! every write, so a lookup never observes a half-applied add or remove.
//! Writers on the same plugin ID are refused rather than queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as WriterEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::authorizer::{PluginLoaderAuthorizer, SignatureAuthorizer};
use crate::backend::BackendFactoryProvider;
use crate::compat::{CompatibilityChecker, CompatibilityOpts};
use crate::error::{Error, Result};
use crate::handle::{BackendHandle, CallGuard};
use crate::lifecycle::{LifecycleEvent, LifecycleHooks};
use crate::manifest::{Capability, PluginClass, PluginType};
#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;
use crate::plugin::{BackendStatus, PluginDefinition, PluginDto, StaticRoute};
use crate::repository::RepositoryService;
use crate::resolver::StaticRouteResolver;

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long removal waits for in-flight calls before cutting them off.
    pub drain_timeout: Duration,
    /// Upper bound on a backend's start.
    pub start_timeout: Duration,
    /// Upper bound on a backend's stop.
    pub stop_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the backend start timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set the backend stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered plugins.
    pub total: usize,
    /// Plugins with a backend handle.
    pub with_backend: usize,
    /// Backends whose process has exited.
    pub exited: usize,
    /// Calls in flight across all handles.
    pub in_flight: usize,
}

struct RegistryEntry {
    definition: Arc<PluginDefinition>,
    handle: Option<BackendHandle>,
}

impl RegistryEntry {
    fn dto(&self) -> PluginDto {
        let status = match &self.handle {
            Some(handle) => handle.status(),
            None => BackendStatus::NotApplicable,
        };
        PluginDto::new(self.definition.clone(), status)
    }
}

type Snapshot = Arc<HashMap<String, Arc<RegistryEntry>>>;

/// State that removal tasks keep alive after the call that started them.
struct Shared {
    entries: RwLock<Snapshot>,
    writers: DashMap<String, ()>,
    hooks: RwLock<LifecycleHooks>,
}

impl Shared {
    fn snapshot(&self) -> Snapshot {
        self.entries.read().clone()
    }

    // Handlers run on a copy so they may register further handlers.
    fn hooks(&self) -> LifecycleHooks {
        self.hooks.read().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, Arc<RegistryEntry>>)) {
        let mut entries = self.entries.write();
        let mut next = HashMap::clone(&entries);
        apply(&mut next);
        *entries = Arc::new(next);
    }
}

/// Marks a plugin ID as having a writer; released on drop.
struct WriteLock {
    shared: Arc<Shared>,
    id: String,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.shared.writers.remove(&self.id);
    }
}

/// Drain, release and unpublish of one entry.
struct Retirement {
    lock: WriteLock,
    entry: Arc<RegistryEntry>,
    drain_timeout: Duration,
    stop_timeout: Duration,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl Retirement {
    async fn run(self) {
        let id = self.lock.id.as_str();
        let mut forced = false;
        if let Some(handle) = &self.entry.handle {
            if !handle.drain(self.drain_timeout).await {
                forced = true;
                tracing::warn!(
                    plugin_id = %id,
                    in_flight = handle.in_flight(),
                    "drain timed out, cancelling in-flight calls"
                );
            }
            handle.release(self.stop_timeout).await;
        }

        self.lock.shared.update(|entries| {
            entries.remove(id);
        });

        tracing::info!(plugin_id = %id, forced, "plugin removed");
        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_removed(forced);
        }
        self.lock.shared.hooks().emit_removed(id, forced);
    }
}

/// An admitted call against a registered plugin.
pub(crate) struct Checkout {
    pub(crate) definition: Arc<PluginDefinition>,
    pub(crate) guard: CallGuard,
}

/// Registry of active plugins.
pub struct PluginRegistry {
    config: RegistryConfig,
    provider: Arc<dyn BackendFactoryProvider>,
    authorizer: Arc<dyn PluginLoaderAuthorizer>,
    shared: Arc<Shared>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl PluginRegistry {
    /// Create a registry that builds backends through `provider`.
    ///
    /// Plugins are authorized by signature with an empty unsigned allow-list
    /// until [`with_authorizer`](Self::with_authorizer) says otherwise.
    pub fn new(config: RegistryConfig, provider: Arc<dyn BackendFactoryProvider>) -> Self {
        Self {
            config,
            provider,
            authorizer: Arc::new(SignatureAuthorizer::default()),
            shared: Arc::new(Shared {
                entries: RwLock::new(Arc::new(HashMap::new())),
                writers: DashMap::new(),
                hooks: RwLock::new(LifecycleHooks::new()),
            }),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    /// Decide which plugins may be registered.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn PluginLoaderAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Record registry and call metrics.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Metrics collector, if one is attached.
    #[cfg(feature = "metrics-prometheus")]
    pub fn metrics(&self) -> Option<&Arc<PluginMetrics>> {
        self.metrics.as_ref()
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Authorizer consulted before every registration.
    pub fn authorizer(&self) -> &Arc<dyn PluginLoaderAuthorizer> {
        &self.authorizer
    }

    /// Add a lifecycle event handler.
    ///
    /// Handlers may call back into the registry, including this method.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.shared.hooks.write().on_event(handler);
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.shared.hooks().emit(event);
    }

    fn snapshot(&self) -> Snapshot {
        self.shared.snapshot()
    }

    fn lock_id(&self, id: &str) -> Result<WriteLock> {
        match self.shared.writers.entry(id.to_string()) {
            WriterEntry::Occupied(_) => Err(Error::Conflict(id.to_string())),
            WriterEntry::Vacant(slot) => {
                slot.insert(());
                Ok(WriteLock {
                    shared: self.shared.clone(),
                    id: id.to_string(),
                })
            }
        }
    }

    /// Look up a plugin by ID.
    pub fn plugin(&self, id: &str) -> Option<PluginDto> {
        self.snapshot().get(id).map(|entry| entry.dto())
    }

    /// Plugins of the given types, sorted by ID. An empty filter means all.
    pub fn plugins(&self, types: &[PluginType]) -> Vec<PluginDto> {
        let snapshot = self.snapshot();
        let mut plugins: Vec<PluginDto> = snapshot
            .values()
            .filter(|e| types.is_empty() || types.contains(&e.definition.plugin_type()))
            .map(|e| e.dto())
            .collect();
        plugins.sort_by(|a, b| a.id().cmp(b.id()));
        plugins
    }

    /// Plugins of one class, sorted by ID.
    pub fn plugins_of_class(&self, class: PluginClass) -> Vec<PluginDto> {
        let mut plugins = self.plugins(&[]);
        plugins.retain(|p| p.class() == class);
        plugins
    }

    /// Check if a plugin is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot();
        let mut stats = RegistryStats {
            total: snapshot.len(),
            ..RegistryStats::default()
        };

        for handle in snapshot.values().filter_map(|e| e.handle.as_ref()) {
            stats.with_backend += 1;
            stats.in_flight += handle.in_flight();
            if handle.has_exited() {
                stats.exited += 1;
            }
        }

        stats
    }

    /// Resolve `id` at `version` from a repository and register it.
    ///
    /// Fails with [`Error::AlreadyExists`] if the plugin is active; this is
    /// not an upsert. `cancel` aborts the repository lookup.
    pub async fn add(
        &self,
        id: &str,
        version: &str,
        repo: &dyn RepositoryService,
        opts: &CompatibilityOpts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _lock = self.lock_id(id)?;
        if self.contains(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }

        let definition = match repo.resolve(id, version, opts, cancel).await {
            Ok(definition) => definition,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                self.record_failure(id, &err);
                return Err(err);
            }
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if definition.id() != id {
            return Err(Error::invalid_manifest(format!(
                "repository returned {} for {id}",
                definition.id()
            )));
        }
        self.publish(definition, opts).await
    }

    /// Register a definition that was already discovered.
    pub async fn register(&self, definition: PluginDefinition, opts: &CompatibilityOpts) -> Result<()> {
        let _lock = self.lock_id(definition.id())?;
        if self.contains(definition.id()) {
            return Err(Error::AlreadyExists(definition.id().to_string()));
        }
        self.publish(definition, opts).await
    }

    // Caller holds the ID's write lock.
    async fn publish(&self, definition: PluginDefinition, opts: &CompatibilityOpts) -> Result<()> {
        let id = definition.id().to_string();
        let started = Instant::now();

        let result = async {
            if !self.authorizer.can_load_plugin(&definition) {
                return Err(Error::Unauthorized(format!(
                    "{id} (signature {:?})",
                    definition.signature()
                )));
            }
            CompatibilityChecker::check(&definition, opts)?;
            self.start_backend(&definition).await
        }
        .await;

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.record_failure(&id, &err);
                return Err(err);
            }
        };

        let version = definition.version().to_string();
        let entry = Arc::new(RegistryEntry {
            definition: Arc::new(definition),
            handle,
        });
        self.shared.update(|entries| {
            entries.insert(id.clone(), entry);
        });

        tracing::info!(plugin_id = %id, version = %version, "plugin registered");
        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_added(started.elapsed().as_secs_f64());
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = started;
        self.shared.hooks().emit_added(&id, &version);
        Ok(())
    }

    async fn start_backend(&self, definition: &PluginDefinition) -> Result<Option<BackendHandle>> {
        if !definition.has_backend() {
            return Ok(None);
        }

        let id = definition.id();
        let factory = self
            .provider
            .backend_factory(definition)
            .ok_or_else(|| Error::backend_unavailable(id, "no backend factory for plugin"))?;
        let handle = BackendHandle::new(id, factory(definition)?);

        match tokio::time::timeout(self.config.start_timeout, handle.start()).await {
            Ok(Ok(())) => Ok(Some(handle)),
            Ok(Err(err)) => {
                handle.release(self.config.stop_timeout).await;
                Err(err)
            }
            Err(_) => {
                handle.release(self.config.stop_timeout).await;
                Err(Error::Timeout(format!("starting backend for {id}")))
            }
        }
    }

    fn record_failure(&self, id: &str, err: &Error) {
        tracing::warn!(plugin_id = %id, error = %err, "plugin registration failed");
        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_error();
        }
        self.shared.hooks().emit_failed(id, &err.to_string());
    }

    /// Remove a plugin.
    ///
    /// New calls are refused at once. In-flight calls get up to the drain
    /// timeout to finish; after that they are cancelled and observe
    /// [`Error::BackendUnavailable`]. The backend is stopped before the entry
    /// leaves the snapshot.
    ///
    /// Removal runs on its own task and completes even if the returned future
    /// is dropped; the ID stays locked against other writers until then.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let lock = self.lock_id(id)?;
        let entry = self
            .snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))?;

        let retirement = Retirement {
            lock,
            entry,
            drain_timeout: self.config.drain_timeout,
            stop_timeout: self.config.stop_timeout,
            #[cfg(feature = "metrics-prometheus")]
            metrics: self.metrics.clone(),
        };
        tokio::spawn(retirement.run())
            .await
            .map_err(|e| Error::Backend(format!("removal of {id} did not finish: {e}")))
    }

    /// Remove every plugin, releasing all backend handles.
    pub async fn shutdown(&self) {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Err(err) = self.remove(&id).await {
                tracing::warn!(plugin_id = %id, error = %err, "failed to remove plugin during shutdown");
            }
        }
    }

    /// Admit a call needing `capability` on plugin `id`.
    pub(crate) fn checkout(&self, id: &str, capability: Capability) -> Result<Checkout> {
        let entry = self
            .snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))?;

        if !entry.definition.supports(capability) {
            return Err(Error::method_not_implemented(id, capability));
        }

        let handle = entry
            .handle
            .as_ref()
            .ok_or_else(|| Error::backend_unavailable(id, "plugin has no backend"))?;
        let guard = handle.acquire().ok_or_else(|| Error::not_found(id))?;
        if handle.has_exited() {
            return Err(Error::backend_unavailable(id, "backend process exited"));
        }

        Ok(Checkout {
            definition: entry.definition.clone(),
            guard,
        })
    }
}

impl StaticRouteResolver for PluginRegistry {
    fn routes(&self) -> Vec<StaticRoute> {
        self.plugins(&[])
            .iter()
            .filter_map(|p| p.definition().static_route().cloned())
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugin_count", &self.len())
            .finish()
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        let entries = self.snapshot();
        if entries.is_empty() {
            return;
        }
        tracing::warn!(count = entries.len(), "registry dropped without shutdown");
        for handle in entries.values().filter_map(|e| e.handle.as_ref()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::AllowAll;
    use crate::backend::{BackendPlugin, InProcessProvider};
    use crate::manifest::ManifestBuilder;
    use crate::plugin::SignatureStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct Tracked {
        stopped: AtomicBool,
        fail_start: bool,
    }

    #[async_trait]
    impl BackendPlugin for Tracked {
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::Backend("boom".into()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedRepository(PluginDefinition);

    #[async_trait]
    impl RepositoryService for FixedRepository {
        async fn resolve(
            &self,
            _plugin_id: &str,
            _version: &str,
            _opts: &CompatibilityOpts,
            cancel: &CancellationToken,
        ) -> Result<PluginDefinition> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(self.0.clone())
        }
    }

    fn definition(id: &str, backend: bool) -> PluginDefinition {
        signed_as(id, backend, SignatureStatus::Valid)
    }

    fn signed_as(id: &str, backend: bool, signature: SignatureStatus) -> PluginDefinition {
        let mut builder = ManifestBuilder::new(id, PluginType::Datasource, "1.0.0");
        if backend {
            builder = builder.backend().capability(Capability::Query);
        }
        PluginDefinition::from_manifest(
            &builder.build_unchecked(),
            PluginClass::External,
            format!("/plugins/{id}"),
            signature,
        )
        .unwrap()
    }

    fn failure_counter(registry: &PluginRegistry) -> Arc<AtomicUsize> {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        registry.on_event(move |event| {
            if event.event_name() == "failed" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        failures
    }

    fn registry_with(provider: InProcessProvider) -> PluginRegistry {
        PluginRegistry::new(
            RegistryConfig::new().with_drain_timeout(Duration::from_millis(50)),
            Arc::new(provider),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry_with(InProcessProvider::new());
        let opts = CompatibilityOpts::default();

        registry.register(definition("clock", false), &opts).await.unwrap();

        let dto = registry.plugin("clock").unwrap();
        assert_eq!(dto.backend_status(), BackendStatus::NotApplicable);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_register_duplicate() {
        let registry = registry_with(InProcessProvider::new());
        let opts = CompatibilityOpts::default();

        registry.register(definition("clock", false), &opts).await.unwrap();
        let result = registry.register(definition("clock", false), &opts).await;

        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_backend_without_factory_fails() {
        let registry = registry_with(InProcessProvider::new());
        let result = registry
            .register(definition("mysql", true), &CompatibilityOpts::default())
            .await;

        assert!(matches!(result, Err(Error::BackendUnavailable { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_not_published() {
        let provider = InProcessProvider::new();
        provider.register("mysql", |_def: &PluginDefinition| {
            Ok(Arc::new(Tracked {
                fail_start: true,
                ..Tracked::default()
            }) as Arc<dyn BackendPlugin>)
        });
        let registry = registry_with(provider);

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        registry.on_event(move |event| {
            if event.event_name() == "failed" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = registry
            .register(definition("mysql", true), &CompatibilityOpts::default())
            .await;
        assert!(matches!(result, Err(Error::Backend(_))));
        assert!(!registry.contains("mysql"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_stops_backend() {
        let backend = Arc::new(Tracked::default());
        let provider = InProcessProvider::new();
        let shared = backend.clone();
        provider.register("mysql", move |_def: &PluginDefinition| {
            Ok(shared.clone() as Arc<dyn BackendPlugin>)
        });
        let registry = registry_with(provider);

        registry
            .register(definition("mysql", true), &CompatibilityOpts::default())
            .await
            .unwrap();
        assert_eq!(registry.plugin("mysql").unwrap().backend_status(), BackendStatus::Running);
        assert_eq!(registry.stats().with_backend, 1);

        registry.remove("mysql").await.unwrap();
        assert!(backend.stopped.load(Ordering::SeqCst));
        assert!(registry.plugin("mysql").is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let registry = registry_with(InProcessProvider::new());
        assert!(matches!(registry.remove("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_same_id_writers_conflict() {
        let registry = registry_with(InProcessProvider::new());
        let _held = registry.lock_id("clock").unwrap();

        let result = registry
            .register(definition("clock", false), &CompatibilityOpts::default())
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));

        let other = registry
            .register(definition("table", false), &CompatibilityOpts::default())
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_plugins_filter_and_order() {
        let registry = registry_with(InProcessProvider::new());
        let opts = CompatibilityOpts::default();
        registry.register(definition("zeta", false), &opts).await.unwrap();
        registry.register(definition("alpha", false), &opts).await.unwrap();

        let panel = ManifestBuilder::new("graph", PluginType::Panel, "1.0.0").build_unchecked();
        let panel =
            PluginDefinition::from_manifest(&panel, PluginClass::Core, "/core/graph", SignatureStatus::Internal)
                .unwrap();
        registry.register(panel, &opts).await.unwrap();

        let ids: Vec<String> = registry
            .plugins(&[PluginType::Datasource])
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(registry.plugins(&[]).len(), 3);
        assert_eq!(registry.plugins_of_class(PluginClass::Core).len(), 1);
    }

    #[tokio::test]
    async fn test_checkout_rules() {
        let provider = InProcessProvider::new();
        provider.register("mysql", |_def: &PluginDefinition| {
            Ok(Arc::new(Tracked::default()) as Arc<dyn BackendPlugin>)
        });
        let registry = registry_with(provider);
        let opts = CompatibilityOpts::default();
        registry.register(definition("mysql", true), &opts).await.unwrap();
        registry.register(definition("clock", false), &opts).await.unwrap();

        assert!(registry.checkout("mysql", Capability::Query).is_ok());
        assert!(matches!(
            registry.checkout("mysql", Capability::Stream),
            Err(Error::MethodNotImplemented { .. })
        ));
        assert!(matches!(
            registry.checkout("clock", Capability::Query),
            Err(Error::MethodNotImplemented { .. })
        ));
        assert!(matches!(
            registry.checkout("ghost", Capability::Query),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let backend = Arc::new(Tracked::default());
        let provider = InProcessProvider::new();
        let shared = backend.clone();
        provider.register("mysql", move |_def: &PluginDefinition| {
            Ok(shared.clone() as Arc<dyn BackendPlugin>)
        });
        let registry = registry_with(provider);
        let opts = CompatibilityOpts::default();
        registry.register(definition("mysql", true), &opts).await.unwrap();
        registry.register(definition("clock", false), &opts).await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(backend.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unauthorized_plugin_is_refused() {
        let registry = registry_with(InProcessProvider::new());
        let failures = failure_counter(&registry);
        let opts = CompatibilityOpts::default();

        let result = registry
            .register(signed_as("dev-panel", false, SignatureStatus::Unsigned), &opts)
            .await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
        assert!(!registry.contains("dev-panel"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let result = registry
            .register(signed_as("tampered", false, SignatureStatus::Modified), &opts)
            .await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_authorizer_is_replaceable() {
        let registry = registry_with(InProcessProvider::new()).with_authorizer(Arc::new(AllowAll));
        registry
            .register(
                signed_as("dev-panel", false, SignatureStatus::Unsigned),
                &CompatibilityOpts::default(),
            )
            .await
            .unwrap();
        assert!(registry.contains("dev-panel"));
    }

    #[tokio::test]
    async fn test_add_checks_authorizer() {
        let registry = registry_with(InProcessProvider::new());
        let repo = FixedRepository(signed_as("dev-panel", false, SignatureStatus::Unsigned));

        let result = registry
            .add("dev-panel", "1.0.0", &repo, &CompatibilityOpts::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_add_is_not_a_failure() {
        let registry = registry_with(InProcessProvider::new());
        let failures = failure_counter(&registry);
        let repo = FixedRepository(definition("clock", false));
        let opts = CompatibilityOpts::default();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = registry.add("clock", "1.0.0", &repo, &opts, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!registry.contains("clock"));
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        registry
            .add("clock", "1.0.0", &repo, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert!(registry.contains("clock"));
    }

    #[tokio::test]
    async fn test_abandoned_remove_still_completes() {
        let backend = Arc::new(Tracked::default());
        let provider = InProcessProvider::new();
        let shared = backend.clone();
        provider.register("mysql", move |_def: &PluginDefinition| {
            Ok(shared.clone() as Arc<dyn BackendPlugin>)
        });
        let registry = PluginRegistry::new(
            RegistryConfig::new().with_drain_timeout(Duration::from_secs(5)),
            Arc::new(provider),
        );
        registry
            .register(definition("mysql", true), &CompatibilityOpts::default())
            .await
            .unwrap();

        let held = registry.checkout("mysql", Capability::Query).unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(20), registry.remove("mysql")).await;
        assert!(abandoned.is_err());

        // Still draining: new calls are refused and the ID stays locked.
        assert!(matches!(
            registry.checkout("mysql", Capability::Query),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(registry.remove("mysql").await, Err(Error::Conflict(_))));

        drop(held);
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.contains("mysql") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(backend.stopped.load(Ordering::SeqCst));

        registry
            .register(definition("mysql", true), &CompatibilityOpts::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_may_call_back_into_registry() {
        let registry = Arc::new(registry_with(InProcessProvider::new()));
        let nested = Arc::new(AtomicUsize::new(0));

        let weak: Weak<PluginRegistry> = Arc::downgrade(&registry);
        let counter = nested.clone();
        registry.on_event(move |event| {
            if event.event_name() != "added" {
                return;
            }
            if let Some(registry) = weak.upgrade() {
                let counter = counter.clone();
                registry.on_event(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        let opts = CompatibilityOpts::default();
        registry.register(definition("clock", false), &opts).await.unwrap();
        registry.register(definition("table", false), &opts).await.unwrap();
        assert!(nested.load(Ordering::SeqCst) >= 1);
    }
}
