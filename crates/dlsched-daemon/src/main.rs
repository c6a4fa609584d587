//! dlsched daemon
//!
//! Runs the learning task scheduler against a Kubernetes cluster and serves
//! the REST API.

use anyhow::{Context, Result};
use clap::Parser;
use dlsched_api::create_router;
use dlsched_core::{DaemonConfig, LogFormat};
use dlsched_kube::KubeClient;
use dlsched_scheduler::{InMemoryStateStore, Scheduler, TaskRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// dlsched daemon - GPU-aware gang scheduler for distributed learning tasks
#[derive(Parser, Debug)]
#[command(name = "dlschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Namespace to collect and bind pods in
    #[arg(long)]
    namespace: Option<String>,

    /// Scheduler name pods must request
    #[arg(long)]
    scheduler_name: Option<String>,

    /// Seconds between pod batch polls
    #[arg(long)]
    pod_batch_interval: Option<u64>,

    /// Path to a kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(namespace) = self.namespace {
            config.scheduler.namespace = namespace;
        }
        if let Some(name) = self.scheduler_name {
            config.scheduler.scheduler_name = name;
        }
        if let Some(secs) = self.pod_batch_interval {
            config.scheduler.pod_batch_interval_secs = secs;
        }
        if let Some(kubeconfig) = self.kubeconfig {
            config.kube.kubeconfig = Some(kubeconfig);
        }
        if let Some(address) = self.address {
            config.api.address = address;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        Ok(config)
    }
}

fn init_logging(config: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match config.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config);

    info!("Starting dlsched daemon v{}", env!("CARGO_PKG_VERSION"));

    let kube = Arc::new(
        KubeClient::new(config.kube.kubeconfig.clone(), config.scheduler.clone())
            .await
            .context("connecting to Kubernetes")?,
    );

    let tasks = TaskRegistry::new();
    let store = Arc::new(InMemoryStateStore::new());
    let mut scheduler = Scheduler::new(
        config.scheduler.clone(),
        kube.clone(),
        tasks.clone(),
        store.clone(),
    );
    scheduler.bootstrap().await;

    // Node watcher
    let (node_tx, node_rx) = mpsc::channel(config.scheduler.channel_capacity.max(1));
    let watcher = {
        let kube = kube.clone();
        tokio::spawn(async move { kube.watch_nodes(node_tx).await })
    };

    // API server
    let router = create_router(tasks, scheduler.handle(), store);
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("API server listening on {}", addr);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server error");
        }
    });

    let result = tokio::select! {
        result = scheduler.run(node_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    watcher.abort();
    server.abort();

    if let Err(e) = result {
        error!(error = %e, "Scheduler stopped");
        return Err(e.into());
    }
    Ok(())
}
