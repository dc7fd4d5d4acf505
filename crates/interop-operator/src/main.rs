//! Interoperator - multi-cluster deployment controller for service instances

mod controller_runner;
mod crds;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use interop_common::config::{ConfigMapProvider, ConfigProvider};
use interop_common::kube_utils::create_ambient_client;
use interop_common::retry::{retry_with_backoff, RetryConfig};
use interop_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use interop_common::DEFAULT_NAMESPACE;
use interop_mcd::{
    ClusterClient, ClusterRegistry, CredentialResolver, KubeClusterRegistry, RegistryConnector,
    WatchManager,
};

use controller_runner::{ControllerFuture, Runtime};

const CRD_INSTALL_ATTEMPTS: u32 = 5;

/// Interoperator - keeps service instances and bindings in sync across clusters
#[derive(Parser, Debug)]
#[command(name = "interoperator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Control namespace holding SFCluster records, the catalog and the config map
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Id of the cluster this process runs in
    #[arg(long, env = "OWN_CLUSTER_ID", default_value = "1")]
    own_cluster_id: String,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller on the primary cluster (default mode)
    ///
    /// - Watches every registered sister cluster
    /// - Replicates instances, bindings and cluster records
    /// - Reports the usage of the own cluster
    Controller,

    /// Only report the usage of the own cluster, as run inside sister clusters
    Usage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::render_all()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "interoperator".to_string(),
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
        Some(Commands::Usage) => run_usage(&cli).await,
    }
}

async fn build_runtime(cli: &Cli) -> anyhow::Result<Runtime> {
    let client = create_ambient_client()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config: Arc<dyn ConfigProvider> =
        Arc::new(ConfigMapProvider::new(client.clone(), &cli.namespace));
    let local = ClusterClient::from_client(cli.own_cluster_id.clone(), client.clone());
    let resolver = CredentialResolver::new(
        cli.own_cluster_id.clone(),
        cli.namespace.clone(),
        config.clone(),
        local.clusters.clone(),
        local.secrets.clone(),
    );
    let registry: Arc<dyn ClusterRegistry> =
        Arc::new(KubeClusterRegistry::new(client.clone(), resolver));
    let watch_manager = Arc::new(WatchManager::new(
        Arc::new(RegistryConnector::new(registry.clone(), cli.namespace.clone())),
        local.clone(),
    ));

    Ok(Runtime {
        client,
        namespace: cli.namespace.clone(),
        own_cluster_id: cli.own_cluster_id.clone(),
        config,
        registry,
        watch_manager,
        local,
    })
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(
        namespace = %cli.namespace,
        own_cluster = %cli.own_cluster_id,
        "Interoperator controller starting..."
    );

    let rt = build_runtime(cli).await?;
    // the API server may still be coming up next to us
    retry_with_backoff(&RetryConfig::with_max_attempts(CRD_INSTALL_ATTEMPTS), "install_crds", || {
        crds::ensure_crds_installed(&rt.client)
    })
    .await?;

    let settings = rt.config.get_config().await;
    tracing::info!(
        primary_cluster = %settings.primary_cluster_id,
        instance_workers = settings.instance_worker_count,
        binding_workers = settings.binding_worker_count,
        "Loaded interoperator config"
    );

    tracing::info!("Starting controllers:");
    let mut controllers: Vec<ControllerFuture> = controller_runner::build_replicators(&rt, &settings)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set up replicators: {}", e))?;
    controllers.extend(controller_runner::build_membership_controller(&rt));
    controllers.extend(controller_runner::build_usage_controller(&rt));

    futures::future::join_all(controllers).await;

    rt.watch_manager.shutdown().await;
    tracing::info!("Interoperator controller shutting down");
    Ok(())
}

async fn run_usage(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(own_cluster = %cli.own_cluster_id, "Usage collector starting...");
    let rt = build_runtime(cli).await?;
    futures::future::join_all(controller_runner::build_usage_controller(&rt)).await;
    tracing::info!("Usage collector shutting down");
    Ok(())
}
