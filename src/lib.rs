//! # monitor-plugin-runtime
//!
//! Plugin discovery, registry and backend call routing for a monitoring
//! platform's data source, panel, app, renderer and secrets manager plugins.
//!
//! This crate provides:
//! - **Discovery** - Scan plugin directories for `plugin.json` / `plugin.toml` manifests
//! - **Validation** - Authorize plugins and check host version requirements
//! - **Registry** - Publish plugins atomically and remove them without dropping calls
//! - **Backend Client** - Route queries, health checks, resource calls, metrics and streams
//! - **Reload** - Re-scan a plugin class and reconcile the registry with it
//! - **Provisioning** - Permission-checked reload requests
//! - **Assets** - Renderer lookup and bundled dashboard files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use monitor_plugin_runtime::{
//!     CallContext, InProcessProvider, ManagerConfig, PluginClass, PluginManager,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ManagerConfig::new()
//!     .with_grafana_version("10.2.0")
//!     .with_source(PluginClass::External, "/var/lib/monitor/plugins");
//! let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()));
//!
//! manager.init(&CancellationToken::new()).await?;
//!
//! let health = manager.client().check_health(&CallContext::new("mysql")).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `watch`: Reload plugin classes when their directories change
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod authorizer;
mod backend;
mod client;
mod compat;
mod dashboards;
mod error;
mod handle;
mod lifecycle;
mod loader;
mod manager;
mod manifest;
mod plugin;
mod provisioning;
mod registry;
mod renderer;
mod repository;
mod resolver;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use authorizer::{AllowAll, PluginLoaderAuthorizer, SignatureAuthorizer};
pub use backend::{
    body_from_bytes, BackendFactory, BackendFactoryProvider, BackendPlugin, BodyStream,
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, DataErrorKind, DataQuery, DataResponse, HealthStatus,
    InProcessProvider, PluginContext, ProviderChain, PublishStreamRequest, PublishStreamResponse,
    QueryDataRequest, QueryDataResponse, RunStreamRequest, StreamPacket, StreamSender, StreamStatus,
    SubscribeStreamRequest, SubscribeStreamResponse, TimeRange,
};
pub use client::{BackendClient, CallContext, ClientConfig, ResourceBody, ResourceResponse, StreamSubscription};
pub use compat::{CompatibilityChecker, CompatibilityOpts};
pub use dashboards::{DashboardFileContents, DashboardFileStore, PluginDashboardFiles};
pub use error::{Error, PluginError, PluginErrorKind, Result};
pub use handle::{BackendHandle, CallGuard};
pub use lifecycle::{LifecycleEvent, LifecycleHooks};
pub use loader::{signature_status, LoadOutcome, LoaderConfig, PluginLoader, SIGNATURE_FILE};
pub use manager::{ManagerConfig, NoopWatch, PluginManager, PluginSource, ReloadSummary, WatchControl};
pub use manifest::{
    parse_minimum_requirement, Capability, CapabilitySet, Manifest, ManifestBuilder,
    ManifestDependencies, PluginClass, PluginInclude, PluginType, Version,
};
pub use plugin::{
    BackendStatus, PluginDefinition, PluginDto, SignatureStatus, StaticRoute, STATIC_ROUTE_PREFIX,
};
pub use provisioning::{
    Permission, Principal, Provisioner, ProvisioningClass, ProvisioningService, ReloadStatus,
    RELOAD_ACTION,
};
pub use registry::{PluginRegistry, RegistryConfig, RegistryStats};
pub use renderer::RendererManager;
pub use repository::{DirectoryRepository, RepositoryService};
pub use resolver::{ErrorResolver, PluginErrorStore, StaticRouteResolver};

#[cfg(feature = "watch")]
pub use watcher::{spawn_auto_reload, PluginWatcher, WatchConfig, WatchEvent};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
