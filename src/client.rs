//! Backend client: routes calls to the backend of a registered plugin.
//!
//! Every call is admitted through the registry, which counts it as in flight
//! until the call (or the body or stream it returned) is finished. Calls honor
//! the caller's cancellation token and deadline, and are cut off with
//! [`Error::BackendUnavailable`] when the plugin is force-removed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::backend::{
    BackendPlugin, BodyStream, CallResourceRequest, CheckHealthRequest, CheckHealthResult, CollectMetricsRequest,
    CollectMetricsResult, DataResponse, PluginContext, PublishStreamRequest, PublishStreamResponse,
    QueryDataRequest, QueryDataResponse, RunStreamRequest, StreamPacket, StreamSender,
    SubscribeStreamRequest, SubscribeStreamResponse,
};
use crate::error::{Error, Result};
use crate::handle::CallGuard;
use crate::manifest::Capability;
use crate::plugin::PluginDefinition;
use crate::registry::{Checkout, PluginRegistry};

/// Configuration for the backend client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to calls whose context carries none.
    pub default_timeout: Option<Duration>,
    /// Packets buffered per running stream.
    pub stream_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            stream_buffer: 16,
        }
    }
}

impl ClientConfig {
    /// Create a new client configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default call timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Set the stream buffer size.
    pub fn with_stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size.max(1);
        self
    }
}

/// Per-call context: target plugin, deadline and cancellation.
#[derive(Debug, Clone)]
pub struct CallContext {
    plugin_id: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context for a call to `plugin_id` with no deadline.
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Use the caller's cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Target plugin ID.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancellation token.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Bound `fut` by `deadline`.
async fn bounded<T>(
    plugin_id: &str,
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(format!("call to plugin {plugin_id}")))),
        None => fut.await,
    }
}

/// Run `fut` unless the caller cancels, the handle is released or the deadline passes.
async fn guarded<T>(
    plugin_id: &str,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = shutdown.cancelled() => Err(released(plugin_id)),
        res = bounded(plugin_id, deadline, fut) => res,
    }
}

fn released(plugin_id: &str) -> Error {
    Error::backend_unavailable(plugin_id, "backend released while the call was in flight")
}

fn plugin_context(definition: &PluginDefinition) -> PluginContext {
    PluginContext {
        plugin_id: definition.id().to_string(),
        plugin_version: definition.version().to_string(),
    }
}

/// Routes calls to plugin backends.
#[derive(Clone)]
pub struct BackendClient {
    registry: Arc<PluginRegistry>,
    config: ClientConfig,
}

impl BackendClient {
    /// Create a client over `registry`.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self::with_config(registry, ClientConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(registry: Arc<PluginRegistry>, config: ClientConfig) -> Self {
        Self { registry, config }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn deadline(&self, ctx: &CallContext) -> Option<Instant> {
        ctx.deadline
            .or_else(|| self.config.default_timeout.map(|t| Instant::now() + t))
    }

    fn checkout(&self, ctx: &CallContext, capability: Capability) -> Result<Checkout> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.registry.checkout(&ctx.plugin_id, capability)
    }

    #[cfg(feature = "metrics-prometheus")]
    fn observe(&self, started: std::time::Instant) {
        if let Some(metrics) = self.registry.metrics() {
            metrics.record_call(started.elapsed().as_secs_f64());
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    fn observe(&self, _started: std::time::Instant) {}

    async fn single<T, F, Fut>(&self, ctx: &CallContext, capability: Capability, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn BackendPlugin>, PluginContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let checkout = self.checkout(ctx, capability)?;
        let started = std::time::Instant::now();
        let backend = checkout.guard.backend();
        let result = guarded(
            &ctx.plugin_id,
            &ctx.cancel,
            checkout.guard.shutdown(),
            self.deadline(ctx),
            call(backend, plugin_context(&checkout.definition)),
        )
        .await;
        self.observe(started);
        result
    }

    /// Run data queries.
    ///
    /// Each query is sent to the backend as its own call; a failing or
    /// timed-out query yields an error entry without affecting its siblings.
    /// Caller cancellation and forced removal fail the whole call.
    pub async fn query_data(&self, ctx: &CallContext, mut req: QueryDataRequest) -> Result<QueryDataResponse> {
        let checkout = self.checkout(ctx, Capability::Query)?;
        let started = std::time::Instant::now();
        let shutdown = checkout.guard.shutdown().clone();
        let deadline = self.deadline(ctx);
        let context = plugin_context(&checkout.definition);

        let queries = std::mem::take(&mut req.queries);
        let calls = queries.into_iter().map(|query| {
            let ref_id = query.ref_id.clone();
            let backend = checkout.guard.backend();
            let single = QueryDataRequest {
                plugin_context: context.clone(),
                headers: req.headers.clone(),
                queries: vec![query],
            };
            let shutdown = &shutdown;
            async move {
                let result = guarded(
                    &ctx.plugin_id,
                    &ctx.cancel,
                    shutdown,
                    deadline,
                    backend.query_data(single),
                )
                .await;
                (ref_id, result)
            }
        });
        let results = join_all(calls).await;
        self.observe(started);

        let mut response = QueryDataResponse::default();
        for (ref_id, result) in results {
            let data = match result {
                Ok(mut resp) => resp.responses.remove(&ref_id).unwrap_or_else(|| {
                    DataResponse::error(format!("plugin returned no response for query {ref_id}"))
                }),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(_) if shutdown.is_cancelled() => return Err(released(&ctx.plugin_id)),
                Err(err) => {
                    tracing::debug!(plugin_id = %ctx.plugin_id, ref_id = %ref_id, error = %err, "query failed");
                    DataResponse::from_error(&err)
                }
            };
            response.responses.insert(ref_id, data);
        }
        Ok(response)
    }

    /// Check plugin health.
    pub async fn check_health(&self, ctx: &CallContext) -> Result<CheckHealthResult> {
        self.single(ctx, Capability::Health, |backend, plugin_context| async move {
            backend.check_health(CheckHealthRequest { plugin_context }).await
        })
        .await
    }

    /// Collect plugin metrics.
    pub async fn collect_metrics(&self, ctx: &CallContext) -> Result<CollectMetricsResult> {
        self.single(ctx, Capability::Metrics, |backend, plugin_context| async move {
            backend.collect_metrics(CollectMetricsRequest { plugin_context }).await
        })
        .await
    }

    /// Authorize a stream subscription.
    pub async fn subscribe_stream(
        &self,
        ctx: &CallContext,
        mut req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        self.single(ctx, Capability::Stream, |backend, plugin_context| async move {
            req.plugin_context = plugin_context;
            backend.subscribe_stream(req).await
        })
        .await
    }

    /// Publish to a stream channel.
    pub async fn publish_stream(
        &self,
        ctx: &CallContext,
        mut req: PublishStreamRequest,
    ) -> Result<PublishStreamResponse> {
        self.single(ctx, Capability::Stream, |backend, plugin_context| async move {
            req.plugin_context = plugin_context;
            backend.publish_stream(req).await
        })
        .await
    }

    /// Forward a resource call.
    ///
    /// The returned body streams lazily and keeps the call in flight until it
    /// is dropped.
    pub async fn call_resource(&self, ctx: &CallContext, mut req: CallResourceRequest) -> Result<ResourceResponse> {
        let checkout = self.checkout(ctx, Capability::Resource)?;
        let started = std::time::Instant::now();
        let deadline = self.deadline(ctx);
        let backend = checkout.guard.backend();
        req.plugin_context = plugin_context(&checkout.definition);

        let response = guarded(
            &ctx.plugin_id,
            &ctx.cancel,
            checkout.guard.shutdown(),
            deadline,
            backend.call_resource(req),
        )
        .await;
        self.observe(started);
        let response = response?;

        Ok(ResourceResponse {
            status: response.status,
            headers: response.headers,
            body: ResourceBody {
                plugin_id: ctx.plugin_id.clone(),
                stream: Some(response.body),
                cancel: ctx.cancel.clone(),
                deadline,
                guard: Some(checkout.guard),
            },
        })
    }

    /// Start a long-lived stream.
    ///
    /// Packets are pushed by a background task; dropping or closing the
    /// subscription stops it.
    pub async fn run_stream(&self, ctx: &CallContext, mut req: RunStreamRequest) -> Result<StreamSubscription> {
        let Checkout { definition, guard } = self.checkout(ctx, Capability::Stream)?;
        req.plugin_context = plugin_context(&definition);

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let cancel = ctx.cancel.clone();
        let deadline = self.deadline(ctx);
        let plugin_id = ctx.plugin_id.clone();

        let task = tokio::spawn(async move {
            let backend = guard.backend();
            let shutdown = guard.shutdown().clone();
            let result = tokio::select! {
                biased;
                _ = task_stop.cancelled() => Err(Error::Cancelled),
                res = guarded(&plugin_id, &cancel, &shutdown, deadline, backend.run_stream(req, StreamSender::new(tx))) => res,
            };
            drop(guard);
            match &result {
                Ok(()) => tracing::debug!(plugin_id = %plugin_id, "stream finished"),
                Err(Error::Cancelled) => tracing::debug!(plugin_id = %plugin_id, "stream cancelled"),
                Err(err) => tracing::warn!(plugin_id = %plugin_id, error = %err, "stream failed"),
            }
            result
        });

        Ok(StreamSubscription {
            rx,
            stop: stop.clone(),
            _stop_on_drop: stop.drop_guard(),
            task: Some(task),
        })
    }
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resource response with a lazily streamed body.
#[derive(Debug)]
pub struct ResourceResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: std::collections::HashMap<String, Vec<String>>,
    /// Body.
    pub body: ResourceBody,
}

/// Streamed resource body.
///
/// Holds the call open until dropped or fully read; every exit path releases
/// the backend stream.
pub struct ResourceBody {
    plugin_id: String,
    stream: Option<BodyStream>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    guard: Option<CallGuard>,
}

impl ResourceBody {
    /// Next body chunk, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let (Some(stream), Some(guard)) = (self.stream.as_mut(), self.guard.as_ref()) else {
            return Ok(None);
        };

        let next = guarded(
            &self.plugin_id,
            &self.cancel,
            guard.shutdown(),
            self.deadline,
            async { stream.next().await.transpose() },
        )
        .await;

        match next {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.release();
                Ok(None)
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    /// Read the remaining body into memory.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// True once the body was fully read, failed or was released.
    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }

    fn release(&mut self) {
        self.stream = None;
        self.guard = None;
    }
}

impl fmt::Debug for ResourceBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBody")
            .field("plugin_id", &self.plugin_id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A running stream. Dropping it cancels the stream.
pub struct StreamSubscription {
    rx: mpsc::Receiver<StreamPacket>,
    stop: CancellationToken,
    _stop_on_drop: DropGuard,
    task: Option<JoinHandle<Result<()>>>,
}

impl StreamSubscription {
    /// Next packet, or `None` once the stream ended.
    pub async fn next(&mut self) -> Option<StreamPacket> {
        self.rx.recv().await
    }

    /// Stop the stream and wait for it to wind down.
    ///
    /// Returns the stream's own error if it failed before being closed.
    pub async fn close(mut self) -> Result<()> {
        self.stop.cancel();
        self.rx.close();
        self.join().await
    }

    /// Wait for the stream to end on its own, discarding further packets.
    pub async fn finish(mut self) -> Result<()> {
        while self.rx.recv().await.is_some() {}
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(Error::Backend(format!("stream task failed: {err}"))),
        }
    }
}

impl fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}
