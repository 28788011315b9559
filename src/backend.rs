//! Backend plugin seam: call types, the backend trait and factory providers.
//!
//! The transport used to reach a plugin process is opaque to this crate. A
//! transport implements [`BackendPlugin`] and is handed to the registry by a
//! [`BackendFactoryProvider`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::manifest::Capability;
use crate::plugin::PluginDefinition;

/// Identifies the plugin a request is addressed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginContext {
    /// Plugin ID.
    pub plugin_id: String,
    /// Plugin version serving the request.
    pub plugin_version: String,
}

/// Time range of a query, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start, inclusive.
    pub from_ms: i64,
    /// End, inclusive.
    pub to_ms: i64,
}

/// A single data query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    /// Reference ID, unique within a request.
    pub ref_id: String,
    /// Plugin-defined query type.
    #[serde(default)]
    pub query_type: String,
    /// Time range.
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    /// Plugin-defined query model.
    #[serde(default)]
    pub json: serde_json::Value,
}

impl DataQuery {
    /// Create a query with a JSON model.
    pub fn new(ref_id: impl Into<String>, json: serde_json::Value) -> Self {
        Self {
            ref_id: ref_id.into(),
            query_type: String::new(),
            time_range: None,
            json,
        }
    }
}

/// Query request.
#[derive(Debug, Clone, Default)]
pub struct QueryDataRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Forwarded headers.
    pub headers: HashMap<String, String>,
    /// Queries to run.
    pub queries: Vec<DataQuery>,
}

/// Why a single query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DataErrorKind {
    /// The query ran past its deadline.
    Timeout,
    /// The plugin does not answer queries.
    NotImplemented,
    /// The backend could not be reached.
    Unavailable,
    /// The plugin reported the failure.
    Plugin,
}

/// Result of a single query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataResponse {
    /// Data frames, encoded by the plugin.
    pub frames: Vec<serde_json::Value>,
    /// Error for this query only.
    pub error: Option<String>,
    /// Classification of `error`; set whenever `error` is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DataErrorKind>,
}

impl DataResponse {
    /// Response carrying frames.
    pub fn frames(frames: Vec<serde_json::Value>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    /// Response carrying an error reported by the plugin.
    pub fn error(message: impl Into<String>) -> Self {
        Self::error_of(DataErrorKind::Plugin, message)
    }

    /// Response carrying an error of the given kind.
    pub fn error_of(kind: DataErrorKind, message: impl Into<String>) -> Self {
        Self {
            frames: Vec::new(),
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    /// Response for a query whose call failed with `err`.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Timeout(_) => DataErrorKind::Timeout,
            Error::MethodNotImplemented { .. } => DataErrorKind::NotImplemented,
            Error::BackendUnavailable { .. } | Error::NotFound(_) => DataErrorKind::Unavailable,
            _ => DataErrorKind::Plugin,
        };
        Self::error_of(kind, err.to_string())
    }
}

/// Query responses keyed by reference ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryDataResponse {
    /// One response per query.
    pub responses: BTreeMap<String, DataResponse>,
}

/// Health check request.
#[derive(Debug, Clone, Default)]
pub struct CheckHealthRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
}

/// Health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Status unknown.
    Unknown,
    /// Healthy.
    Ok,
    /// Unhealthy.
    Error,
}

/// Health check result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckHealthResult {
    /// Status.
    pub status: HealthStatus,
    /// Message for the user.
    pub message: String,
    /// Plugin-defined details.
    pub json_details: serde_json::Value,
}

impl CheckHealthResult {
    /// Healthy result with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            message: message.into(),
            json_details: serde_json::Value::Null,
        }
    }
}

/// Streamed body chunks.
pub type BodyStream = BoxStream<'static, Result<Vec<u8>>>;

/// Body stream yielding a single buffer.
pub fn body_from_bytes(bytes: impl Into<Vec<u8>>) -> BodyStream {
    stream::once(futures_util::future::ready(Ok(bytes.into()))).boxed()
}

/// Resource (HTTP-like) request forwarded to a plugin.
#[derive(Debug, Clone, Default)]
pub struct CallResourceRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// HTTP method.
    pub method: String,
    /// Path below the plugin's resource root.
    pub path: String,
    /// Full original URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, Vec<String>>,
    /// Request body.
    pub body: Vec<u8>,
}

impl CallResourceRequest {
    /// Request with method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Resource response as produced by a backend.
pub struct CallResourceResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, Vec<String>>,
    /// Lazily produced body.
    pub body: BodyStream,
}

impl fmt::Debug for CallResourceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallResourceResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Metrics collection request.
#[derive(Debug, Clone, Default)]
pub struct CollectMetricsRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
}

/// Metrics snapshot in Prometheus text format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectMetricsResult {
    /// Exposition text.
    pub prometheus_metrics: Vec<u8>,
}

/// Outcome of a stream subscribe/publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamStatus {
    /// Accepted.
    Ok,
    /// Unknown channel path.
    NotFound,
    /// Caller may not use the channel.
    PermissionDenied,
}

/// Stream subscription request.
#[derive(Debug, Clone, Default)]
pub struct SubscribeStreamRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Channel path.
    pub path: String,
    /// Subscription payload.
    pub data: serde_json::Value,
}

/// Stream subscription response.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeStreamResponse {
    /// Status.
    pub status: StreamStatus,
    /// Data sent to the subscriber right away.
    pub initial_data: Option<serde_json::Value>,
}

/// Stream publish request.
#[derive(Debug, Clone, Default)]
pub struct PublishStreamRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Channel path.
    pub path: String,
    /// Published payload.
    pub data: serde_json::Value,
}

/// Stream publish response.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishStreamResponse {
    /// Status.
    pub status: StreamStatus,
    /// Data to broadcast, possibly rewritten by the plugin.
    pub data: Option<serde_json::Value>,
}

/// Request to run a long-lived stream.
#[derive(Debug, Clone, Default)]
pub struct RunStreamRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Channel path.
    pub path: String,
    /// Stream payload.
    pub data: serde_json::Value,
}

/// One packet pushed by a running stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    /// Packet payload.
    pub data: serde_json::Value,
}

/// Sending half handed to [`BackendPlugin::run_stream`].
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamPacket>,
}

impl StreamSender {
    pub(crate) fn new(tx: mpsc::Sender<StreamPacket>) -> Self {
        Self { tx }
    }

    /// Push a packet; fails with [`Error::Cancelled`] once the subscriber is gone.
    pub async fn send(&self, packet: StreamPacket) -> Result<()> {
        self.tx.send(packet).await.map_err(|_| Error::Cancelled)
    }

    /// True once the subscriber has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running (or startable) plugin backend.
///
/// Every call method defaults to [`Error::MethodNotImplemented`], so a
/// transport only implements what its plugin serves.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// Start the backend.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop the backend and release its process.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// True once the backend process has exited.
    fn is_exited(&self) -> bool {
        false
    }

    /// Run data queries.
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Query))
    }

    /// Check health.
    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Health))
    }

    /// Handle a resource call.
    async fn call_resource(&self, req: CallResourceRequest) -> Result<CallResourceResponse> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Resource))
    }

    /// Collect metrics.
    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Metrics))
    }

    /// Authorize a stream subscription.
    async fn subscribe_stream(&self, req: SubscribeStreamRequest) -> Result<SubscribeStreamResponse> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Stream))
    }

    /// Handle a publish to a stream channel.
    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Stream))
    }

    /// Push packets until the stream ends or the sender closes.
    async fn run_stream(&self, req: RunStreamRequest, sender: StreamSender) -> Result<()> {
        let _ = sender;
        Err(Error::method_not_implemented(req.plugin_context.plugin_id, Capability::Stream))
    }
}

/// Constructs a backend for a definition.
pub type BackendFactory =
    Arc<dyn Fn(&PluginDefinition) -> Result<Arc<dyn BackendPlugin>> + Send + Sync>;

/// Supplies backend factories for plugins.
pub trait BackendFactoryProvider: Send + Sync {
    /// Factory for the plugin, or `None` if this provider cannot serve it.
    fn backend_factory(&self, plugin: &PluginDefinition) -> Option<BackendFactory>;
}

/// Provider for backends that run inside the host process, keyed by plugin ID.
#[derive(Default)]
pub struct InProcessProvider {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl InProcessProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a plugin ID, replacing any previous one.
    pub fn register<F>(&self, plugin_id: impl Into<String>, factory: F)
    where
        F: Fn(&PluginDefinition) -> Result<Arc<dyn BackendPlugin>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(plugin_id.into(), Arc::new(factory));
    }

    /// Remove the factory for a plugin ID.
    pub fn unregister(&self, plugin_id: &str) -> bool {
        self.factories.write().remove(plugin_id).is_some()
    }
}

impl BackendFactoryProvider for InProcessProvider {
    fn backend_factory(&self, plugin: &PluginDefinition) -> Option<BackendFactory> {
        self.factories.read().get(plugin.id()).cloned()
    }
}

impl fmt::Debug for InProcessProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("InProcessProvider").field("plugins", &ids).finish()
    }
}

/// Asks each provider in turn; the first that answers wins.
#[derive(Default)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn BackendFactoryProvider>>,
}

impl ProviderChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider.
    pub fn with(mut self, provider: Arc<dyn BackendFactoryProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

impl BackendFactoryProvider for ProviderChain {
    fn backend_factory(&self, plugin: &PluginDefinition) -> Option<BackendFactory> {
        self.providers.iter().find_map(|p| p.backend_factory(plugin))
    }
}

impl fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderChain")
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestBuilder, PluginClass, PluginType};
    use crate::plugin::SignatureStatus;

    struct Healthy;

    #[async_trait]
    impl BackendPlugin for Healthy {
        async fn check_health(&self, _req: CheckHealthRequest) -> Result<CheckHealthResult> {
            Ok(CheckHealthResult::ok("fine"))
        }
    }

    fn definition(id: &str) -> PluginDefinition {
        let manifest = ManifestBuilder::new(id, PluginType::Datasource, "1.0.0")
            .backend()
            .build_unchecked();
        PluginDefinition::from_manifest(&manifest, PluginClass::Core, "/core", SignatureStatus::Internal)
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_methods_not_implemented() {
        let backend = Healthy;
        let req = QueryDataRequest {
            plugin_context: PluginContext {
                plugin_id: "mysql".into(),
                plugin_version: "1.0.0".into(),
            },
            ..QueryDataRequest::default()
        };

        let err = backend.query_data(req).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotImplemented { .. }));
        assert_eq!(
            backend.check_health(CheckHealthRequest::default()).await.unwrap().status,
            HealthStatus::Ok
        );
    }

    #[test]
    fn test_in_process_provider() {
        let provider = InProcessProvider::new();
        provider.register("mysql", |_def: &PluginDefinition| {
            Ok(Arc::new(Healthy) as Arc<dyn BackendPlugin>)
        });

        assert!(provider.backend_factory(&definition("mysql")).is_some());
        assert!(provider.backend_factory(&definition("pg")).is_none());
        assert!(provider.unregister("mysql"));
        assert!(provider.backend_factory(&definition("mysql")).is_none());
    }

    #[test]
    fn test_provider_chain_order() {
        let first = Arc::new(InProcessProvider::new());
        let second = Arc::new(InProcessProvider::new());
        second.register("pg", |_def: &PluginDefinition| {
            Ok(Arc::new(Healthy) as Arc<dyn BackendPlugin>)
        });

        let chain = ProviderChain::new().with(first).with(second);
        assert!(chain.backend_factory(&definition("pg")).is_some());
        assert!(chain.backend_factory(&definition("mysql")).is_none());
    }

    #[tokio::test]
    async fn test_body_from_bytes() {
        let mut body = body_from_bytes(b"hello".to_vec());
        assert_eq!(body.next().await.unwrap().unwrap(), b"hello".to_vec());
        assert!(body.next().await.is_none());
    }

    #[test]
    fn test_data_error_kind_from_call_error() {
        let timed_out = DataResponse::from_error(&Error::Timeout("call to plugin pg".into()));
        assert_eq!(timed_out.error_kind, Some(DataErrorKind::Timeout));
        assert!(timed_out.error.is_some());

        let missing = DataResponse::from_error(&Error::method_not_implemented("pg", Capability::Query));
        assert_eq!(missing.error_kind, Some(DataErrorKind::NotImplemented));

        assert_eq!(DataResponse::error("bad").error_kind, Some(DataErrorKind::Plugin));
        assert_eq!(DataResponse::frames(Vec::new()).error_kind, None);
        assert_eq!(
            serde_json::to_value(&timed_out).unwrap()["error_kind"],
            serde_json::json!("timeout")
        );
    }
}
