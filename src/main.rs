//! nestvc syncer - projects one tenant cluster's PVCs onto the super cluster

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nestvc::backend::KubePvcBackend;
use nestvc::conversion::ClusterKey;
use nestvc::featuregate;
use nestvc::syncer::{PvcSyncer, SyncerConfig};
use nestvc::telemetry::init_telemetry;

/// Per-tenant sync engine keeping virtual and physical PVCs consistent
#[derive(Parser, Debug)]
#[command(name = "nestvc-syncer", version, about, long_about = None)]
struct Cli {
    /// Kubeconfig for the tenant (virtual) cluster apiserver
    #[arg(long)]
    tenant_kubeconfig: PathBuf,

    /// Kubeconfig for the super cluster; in-cluster config when omitted
    #[arg(long)]
    super_kubeconfig: Option<PathBuf>,

    /// Namespace of the tenant cluster object in the super cluster
    #[arg(long)]
    cluster_namespace: String,

    /// Name of the tenant cluster object
    #[arg(long)]
    cluster_name: String,

    /// UID of the tenant cluster object
    #[arg(long)]
    cluster_uid: String,

    /// Seconds between patrol passes
    #[arg(long, default_value_t = 60)]
    patrol_interval_secs: u64,

    /// Concurrent workers per sync queue
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Feature gates to enable, repeatable
    #[arg(long = "enable-feature")]
    enable_features: Vec<String>,
}

async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry()?;

    let cli = Cli::parse();

    for name in &cli.enable_features {
        // Gates are a closed set; unknown names are operator typos
        if name == featuregate::SYNC_TENANT_PVC_STATUS_PHASE {
            featuregate::set(featuregate::SYNC_TENANT_PVC_STATUS_PHASE, true);
            info!(gate = %name, "feature gate enabled");
        } else {
            warn!(gate = %name, "unknown feature gate ignored");
        }
    }

    let cluster_key = ClusterKey::new(&cli.cluster_namespace, &cli.cluster_name, &cli.cluster_uid);
    info!(cluster_key = %cluster_key, "starting syncer");

    let tenant = create_client(Some(&cli.tenant_kubeconfig)).await?;
    let superc = create_client(cli.super_kubeconfig.as_deref()).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let syncer = PvcSyncer::new(
        Arc::new(KubePvcBackend::new(tenant)),
        Arc::new(KubePvcBackend::new(superc)),
        cluster_key,
        SyncerConfig {
            workers: cli.workers,
            patrol_interval: Duration::from_secs(cli.patrol_interval_secs),
            ..Default::default()
        },
    );
    syncer.run(cancel).await?;

    Ok(())
}
