//! Integration tests for monitor-plugin-runtime.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use monitor_plugin_runtime::{
    BackendPlugin, BackendStatus, CallContext, CompatibilityOpts, DataQuery, DataResponse,
    DirectoryRepository, Error, InProcessProvider, LifecycleEvent, ManagerConfig, Manifest,
    PluginClass, PluginDefinition, PluginErrorKind, PluginLoader, PluginManager, PluginRegistry,
    PluginType, Principal, ProvisioningClass, ProvisioningService, QueryDataRequest,
    QueryDataResponse, RegistryConfig, Result, RunStreamRequest, SignatureStatus, StreamPacket,
    StreamSender, RELOAD_ACTION,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Backend whose queries take `delay` to answer.
struct SlowBackend {
    delay: Duration,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendPlugin for SlowBackend {
    async fn start(&self) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        tokio::time::sleep(self.delay).await;
        let responses: BTreeMap<String, DataResponse> = req
            .queries
            .into_iter()
            .map(|q| (q.ref_id, DataResponse::frames(vec![json!({"ok": true})])))
            .collect();
        Ok(QueryDataResponse { responses })
    }

    async fn run_stream(&self, _req: RunStreamRequest, sender: StreamSender) -> Result<()> {
        loop {
            sender.send(StreamPacket { data: json!("tick") }).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn provider_with(id: &str, delay: Duration) -> (Arc<InProcessProvider>, Arc<AtomicUsize>) {
    let provider = Arc::new(InProcessProvider::new());
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    provider.register(id, move |_def: &PluginDefinition| {
        Ok(Arc::new(SlowBackend {
            delay,
            started: counter.clone(),
        }) as Arc<dyn BackendPlugin>)
    });
    (provider, started)
}

fn write_plugin(dir: &Path, manifest: serde_json::Value) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
    fs::write(dir.join("MANIFEST.txt"), "signed").unwrap();
}

fn panel(id: &str, version: &str) -> serde_json::Value {
    json!({ "id": id, "type": "panel", "version": version })
}

fn datasource(id: &str, version: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "datasource",
        "version": version,
        "backend": true,
        "executable": format!("gpx_{id}"),
        "capabilities": ["query", "stream"],
    })
}

fn query(ref_id: &str) -> QueryDataRequest {
    QueryDataRequest {
        queries: vec![DataQuery::new(ref_id, json!({}))],
        ..QueryDataRequest::default()
    }
}

async fn wait_for_in_flight(registry: &PluginRegistry, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.stats().in_flight != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_duplicate_id_first_wins() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let first = tmp.path().join("a");
    let second = tmp.path().join("b");
    write_plugin(&first.join("mysql"), panel("mysql", "1.0.0"));
    write_plugin(&second.join("mysql"), panel("mysql", "2.0.0"));

    let config = ManagerConfig::new()
        .with_source(PluginClass::External, &first)
        .with_source(PluginClass::External, &second);
    let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()));

    let summary = manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.added, vec!["mysql"]);
    let mysql = manager.registry().plugin("mysql").unwrap();
    assert_eq!(mysql.version().to_string(), "1.0.0");

    let errors = manager.plugin_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, PluginErrorKind::Conflict);
    assert!(errors[0].path.as_ref().unwrap().starts_with(&second));
}

#[tokio::test]
async fn test_incompatible_host_version() {
    let tmp = tempfile::tempdir().unwrap();
    let mut pg = panel("pg", "1.0.0");
    pg["dependencies"] = json!({ "grafanaDependency": ">=10.0.0" });
    write_plugin(&tmp.path().join("pg"), pg);
    write_plugin(&tmp.path().join("clock"), panel("clock", "1.0.0"));

    let config = ManagerConfig::new()
        .with_grafana_version("9.0.0")
        .with_source(PluginClass::External, tmp.path());
    let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()));

    let summary = manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.added, vec!["clock"]);
    assert!(manager.registry().plugin("pg").is_none());
    let errors = manager.plugin_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].plugin_id, "pg");
    assert_eq!(errors[0].kind, PluginErrorKind::Incompatible);
}

#[tokio::test]
async fn test_partial_failure_registers_the_rest() {
    let tmp = tempfile::tempdir().unwrap();
    for id in ["alpha", "beta", "gamma"] {
        write_plugin(&tmp.path().join(id), panel(id, "1.0.0"));
    }
    let broken = tmp.path().join("broken");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("plugin.json"), "{ nope").unwrap();
    write_plugin(&tmp.path().join("bad-version"), panel("bad-version", "one"));

    let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
    let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()));

    let summary = manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.added.len(), 3);
    assert_eq!(summary.errors.len(), 2);
    assert_eq!(manager.registry().len(), 3);
    assert!(summary.errors.iter().all(|e| e.kind == PluginErrorKind::Parse));
}

#[tokio::test]
async fn test_add_then_remove_restores_state() {
    let repo_dir = tempfile::tempdir().unwrap();
    write_plugin(&repo_dir.path().join("pg-1.0.0"), datasource("pg", "1.0.0"));
    write_plugin(&repo_dir.path().join("pg-2.0.0"), datasource("pg", "2.0.0"));
    let repo = DirectoryRepository::new(
        PluginLoader::default(),
        PluginClass::External,
        vec![repo_dir.path().to_path_buf()],
    );

    let (provider, _) = provider_with("pg", Duration::ZERO);
    let registry = PluginRegistry::new(RegistryConfig::default(), provider);
    let opts = CompatibilityOpts::new("10.0.0");

    let before: Vec<String> = registry.plugins(&[]).iter().map(|p| p.id().to_string()).collect();

    registry.add("pg", "1.0.0", &repo, &opts, &CancellationToken::new()).await.unwrap();
    let added = registry.plugin("pg").unwrap();
    assert_eq!(added.version().to_string(), "1.0.0");
    assert_eq!(added.backend_status(), BackendStatus::Running);
    assert!(matches!(
        registry.add("pg", "2.0.0", &repo, &opts, &CancellationToken::new()).await,
        Err(Error::AlreadyExists(_))
    ));

    registry.remove("pg").await.unwrap();
    let after: Vec<String> = registry.plugins(&[]).iter().map(|p| p.id().to_string()).collect();
    assert_eq!(before, after);

    assert!(matches!(
        registry.add("pg", "3.0.0", &repo, &opts, &CancellationToken::new()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_add_unsigned_package_is_unauthorized() {
    let repo_dir = tempfile::tempdir().unwrap();
    let package = repo_dir.path().join("pg-1.0.0");
    write_plugin(&package, datasource("pg", "1.0.0"));
    fs::remove_file(package.join("MANIFEST.txt")).unwrap();
    let repo = DirectoryRepository::new(
        PluginLoader::default(),
        PluginClass::External,
        vec![repo_dir.path().to_path_buf()],
    );

    let (provider, started) = provider_with("pg", Duration::ZERO);
    let registry = PluginRegistry::new(RegistryConfig::default(), provider);
    let result = registry
        .add("pg", "1.0.0", &repo, &CompatibilityOpts::new("10.0.0"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Unauthorized(_))));
    assert!(registry.is_empty());
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_remove_unknown_is_not_found() {
    let registry = PluginRegistry::new(RegistryConfig::default(), Arc::new(InProcessProvider::new()));
    assert!(matches!(registry.remove("nope").await, Err(Error::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_always_carry_backend_status() {
    let tmp = tempfile::tempdir().unwrap();
    let ids: Vec<String> = (0..8).map(|i| format!("ds-{i}")).collect();
    let provider = Arc::new(InProcessProvider::new());
    for id in &ids {
        write_plugin(&tmp.path().join(id), datasource(id, "1.0.0"));
        provider.register(id.clone(), |_def: &PluginDefinition| {
            Ok(Arc::new(SlowBackend {
                delay: Duration::ZERO,
                started: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn BackendPlugin>)
        });
    }
    let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
    let manager = Arc::new(PluginManager::new(config, provider));

    let stop = CancellationToken::new();
    let reader = {
        let registry = manager.registry().clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut observed = 0;
            while !stop.is_cancelled() {
                for dto in registry.plugins(&[PluginType::Datasource]) {
                    assert_eq!(dto.backend_status(), BackendStatus::Running);
                    observed += 1;
                }
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.cancel();

    assert!(reader.await.unwrap() > 0);
    assert_eq!(manager.registry().len(), ids.len());
}

#[tokio::test]
async fn test_remove_waits_for_in_flight_query() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(&tmp.path().join("pg"), datasource("pg", "1.0.0"));
    let (provider, _) = provider_with("pg", Duration::from_millis(150));

    let config = ManagerConfig::new()
        .with_drain_timeout(Duration::from_secs(5))
        .with_source(PluginClass::External, tmp.path());
    let manager = Arc::new(PluginManager::new(config, provider));
    manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    let in_flight = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .client()
                .query_data(&CallContext::new("pg"), query("A"))
                .await
        })
    };
    wait_for_in_flight(manager.registry(), 1).await;

    manager.registry().remove("pg").await.unwrap();

    let resp = in_flight.await.unwrap().unwrap();
    assert!(resp.responses["A"].error.is_none());
    assert!(manager.registry().plugin("pg").is_none());
    assert!(matches!(
        manager.client().query_data(&CallContext::new("pg"), query("B")).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_forces_release_after_drain_timeout() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(&tmp.path().join("pg"), datasource("pg", "1.0.0"));
    let (provider, _) = provider_with("pg", Duration::from_secs(30));

    let config = ManagerConfig::new()
        .with_drain_timeout(Duration::from_millis(50))
        .with_source(PluginClass::External, tmp.path());
    let manager = Arc::new(PluginManager::new(config, provider));
    manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    let forced = Arc::new(AtomicUsize::new(0));
    let counter = forced.clone();
    manager.registry().on_event(move |event| {
        if let LifecycleEvent::Removed { forced: true, .. } = event {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let in_flight = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .client()
                .query_data(&CallContext::new("pg"), query("A"))
                .await
        })
    };
    wait_for_in_flight(manager.registry(), 1).await;

    manager.registry().remove("pg").await.unwrap();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::BackendUnavailable { .. })));
    assert_eq!(forced.load(Ordering::SeqCst), 1);
    assert!(manager.registry().plugin("pg").is_none());
}

#[tokio::test]
async fn test_concurrent_writers_on_same_id() {
    let (provider, started) = provider_with("pg", Duration::ZERO);
    let registry = PluginRegistry::new(RegistryConfig::default(), provider);
    let opts = CompatibilityOpts::default();

    let manifest = Manifest::from_json(&datasource("pg", "1.0.0").to_string()).unwrap();
    let definition = PluginDefinition::from_manifest(
        &manifest,
        PluginClass::External,
        "/plugins/pg",
        SignatureStatus::Valid,
    )
    .unwrap();

    let (a, b) = tokio::join!(
        registry.register(definition.clone(), &opts),
        registry.register(definition, &opts),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(r, Err(Error::Conflict(_)))));
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_dropped_stream_releases_call() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(&tmp.path().join("pg"), datasource("pg", "1.0.0"));
    let (provider, _) = provider_with("pg", Duration::ZERO);

    let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
    let manager = PluginManager::new(config, provider);
    manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    let mut sub = manager
        .client()
        .run_stream(&CallContext::new("pg"), RunStreamRequest::default())
        .await
        .unwrap();
    assert_eq!(sub.next().await.unwrap().data, json!("tick"));
    assert_eq!(manager.registry().stats().in_flight, 1);

    drop(sub);
    wait_for_in_flight(manager.registry(), 0).await;
}

#[tokio::test]
async fn test_static_routes_follow_registry() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(&tmp.path().join("clock"), panel("clock", "1.0.0"));

    let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
    let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()));
    manager
        .reload(PluginClass::External, &CancellationToken::new())
        .await
        .unwrap();

    let routes = manager.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].prefix, "/public/plugins/clock");

    manager.shutdown().await;
    assert!(manager.routes().is_empty());
}

#[tokio::test]
async fn test_provisioning_reload_of_plugins() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(&tmp.path().join("clock"), panel("clock", "1.0.0"));

    let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
    let manager = Arc::new(PluginManager::new(config, Arc::new(InProcessProvider::new())));
    let service = ProvisioningService::new(true).with_provisioner(ProvisioningClass::Plugins, manager.clone());

    let admin = Principal::new("admin").with_permission(RELOAD_ACTION, "provisioners:*");
    let cancel = CancellationToken::new();

    let status = service.reload(Some(&admin), ProvisioningClass::Plugins, &cancel).await;
    assert_eq!(status.code(), 200);
    assert!(manager.registry().contains("clock"));

    // Every candidate broken and nothing active: the reload fails.
    fs::remove_dir_all(tmp.path().join("clock")).unwrap();
    let broken = tmp.path().join("broken");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("plugin.json"), "[]").unwrap();

    let status = service.reload(Some(&admin), ProvisioningClass::Plugins, &cancel).await;
    assert_eq!(status.code(), 500);
    assert!(!manager.registry().contains("clock"));
}

#[cfg(feature = "metrics-prometheus")]
mod metrics_tests {
    use super::*;
    use monitor_plugin_runtime::{BackendClient, MetricsConfig, PluginMetrics};

    #[tokio::test]
    async fn test_registry_records_metrics() {
        let metrics = Arc::new(PluginMetrics::new(MetricsConfig::default()).unwrap());
        let (provider, _) = provider_with("pg", Duration::ZERO);
        let registry = Arc::new(
            PluginRegistry::new(RegistryConfig::default(), provider).with_metrics(metrics.clone()),
        );

        let manifest =
            Manifest::from_json(&datasource("pg", "1.0.0").to_string()).unwrap();
        let definition = PluginDefinition::from_manifest(
            &manifest,
            PluginClass::External,
            "/plugins/pg",
            SignatureStatus::Valid,
        )
        .unwrap();
        registry.register(definition, &CompatibilityOpts::default()).await.unwrap();

        let client = BackendClient::new(registry.clone());
        client.query_data(&CallContext::new("pg"), query("A")).await.unwrap();
        registry.remove("pg").await.unwrap();

        assert_eq!(metrics.plugins_added_total(), 1);
        assert_eq!(metrics.plugins_removed_total(), 1);
        assert!(metrics.encode().unwrap().contains("monitor_plugin_call_duration_seconds"));
    }
}

#[cfg(feature = "watch")]
mod watch_tests {
    use super::*;
    use monitor_plugin_runtime::{PluginWatcher, WatchConfig};

    #[tokio::test]
    async fn test_reload_restarts_watching() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(&tmp.path().join("clock"), panel("clock", "1.0.0"));

        let watcher = Arc::new(PluginWatcher::new(WatchConfig::default()));
        let config = ManagerConfig::new().with_source(PluginClass::External, tmp.path());
        let manager = PluginManager::new(config, Arc::new(InProcessProvider::new()))
            .with_watch(watcher.clone());

        manager
            .reload(PluginClass::External, &CancellationToken::new())
            .await
            .unwrap();
        assert!(watcher.is_watching(PluginClass::External));

        manager.shutdown().await;
        assert!(!watcher.is_watching(PluginClass::External));
    }
}
