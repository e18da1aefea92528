use anyhow::Context;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::watcher, Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use openfero_operator::{
    config::Config,
    dispatcher::{DispatchSettings, Dispatcher},
    kubernetes::{current_namespace, KubeJobStore, KubeTemplateSource, WatchCache},
    metrics,
    server::Server,
    store::create_store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting OpenFero");
    info!("Loaded configuration: {:?}", config);

    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let namespace = current_namespace(&client);
    let configmap_namespace = config
        .kube
        .configmap_namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());
    let job_namespace = config
        .kube
        .job_destination_namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());

    metrics::register_metrics();

    let selector = config.kube.selector_string();
    let template_cache = Arc::new(WatchCache::<ConfigMap>::new("ConfigMap"));
    let template_watch = template_cache.spawn(
        Api::namespaced(client.clone(), &configmap_namespace),
        watcher::Config::default().labels(&selector),
    );
    let job_cache = Arc::new(KubeJobStore::metered_cache());
    let job_watch = job_cache.spawn(
        Api::<Job>::namespaced(client.clone(), &job_namespace),
        watcher::Config::default().labels(&selector),
    );

    template_cache
        .wait_synced(config.kube.sync_timeout)
        .await
        .with_context(|| format!("syncing templates in namespace {}", configmap_namespace))?;
    job_cache
        .wait_synced(config.kube.sync_timeout)
        .await
        .with_context(|| format!("syncing jobs in namespace {}", job_namespace))?;

    let store = create_store(&config.alert_store).context("creating alert store")?;
    store
        .initialize()
        .await
        .context("initializing alert store")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(KubeJobStore::new(
            client.clone(),
            &job_namespace,
            job_cache,
            config.kube.submit_timeout,
        )),
        Arc::new(KubeTemplateSource::new(template_cache)),
        store.clone(),
        DispatchSettings {
            template_namespace: configmap_namespace,
            owner_labels: config.kube.label_selector.clone(),
            job_ttl_seconds: config.kube.job_ttl_seconds,
        },
    ));

    let ready = Arc::new(AtomicBool::new(true));
    let server = Server::new(dispatcher, ready.clone());
    let result = server.start(config.server.addr, shutdown_signal()).await;

    ready.store(false, Ordering::Release);
    template_watch.abort();
    job_watch.abort();
    if let Err(e) = store.close().await {
        warn!("Failed to close alert store: {}", e);
    }
    info!("Shutdown complete");

    result.context("running server")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
