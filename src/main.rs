//! capmk - Cluster API infrastructure provider for minikube

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use capmk::controller::{ClusterReconciler, Context, MachineReconciler};
use capmk::health::serve_probes;
use capmk::metrics::serve_metrics;
use capmk::provisioner::{ExecProvisioner, DEFAULT_BRIDGE_BIN};
use capmk::registry::{crd_manifests, Kind};
use capmk::scheduler::watch::event_stream;
use capmk::scheduler::{Scheduler, SchedulerConfig};
use capmk::store::KubeStore;
use capmk::telemetry::{init_telemetry, TelemetryConfig};
use capmk::{
    DEFAULT_HEALTH_PROBE_ADDR, DEFAULT_METRICS_ADDR, DEFAULT_PROFILE, DEFAULT_STORAGE_PATH,
};

/// capmk - converges MinikubeCluster and MinikubeMachine objects onto minikube profiles
#[derive(Parser, Debug)]
#[command(name = "capmk", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// minikube storage directory handed to the bridge as MINIKUBE_HOME
    #[arg(long, env = "CAPMK_STORAGE_PATH", default_value = DEFAULT_STORAGE_PATH)]
    storage_path: PathBuf,

    /// Profile used when a deleting machine has no resolvable cluster
    #[arg(long, env = "CAPMK_PROFILE", default_value = DEFAULT_PROFILE)]
    profile: String,

    /// Node provisioner bridge executable
    #[arg(long, env = "CAPMK_BRIDGE_BIN", default_value = DEFAULT_BRIDGE_BIN)]
    bridge_bin: PathBuf,

    /// Address the Prometheus metrics endpoint binds to
    #[arg(long, env = "CAPMK_METRICS_BIND_ADDRESS", default_value = DEFAULT_METRICS_ADDR)]
    metrics_bind_address: SocketAddr,

    /// Address the liveness and readiness probes bind to
    #[arg(long, env = "CAPMK_HEALTH_PROBE_BIND_ADDRESS", default_value = DEFAULT_HEALTH_PROBE_ADDR)]
    health_probe_bind_address: SocketAddr,

    /// Deadline for one reconcile pass in seconds
    #[arg(long, env = "CAPMK_RECONCILE_TIMEOUT_SECS", default_value = "600")]
    reconcile_timeout_secs: u64,

    /// Timeout for one bridge invocation in seconds
    #[arg(long, env = "CAPMK_COMMAND_TIMEOUT_SECS", default_value = "300")]
    command_timeout_secs: u64,

    /// Interval between passes over provisioned machines in seconds
    #[arg(long, env = "CAPMK_RESYNC_SECS", default_value = "60")]
    resync_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    let registry = init_telemetry(TelemetryConfig::default())?;
    run_controller(cli, registry).await
}

/// Wire the store, provisioner and reconcilers and run until signalled
async fn run_controller(cli: Cli, registry: Registry) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let store = Arc::new(KubeStore::new(client.clone()));
    let provisioner = Arc::new(
        ExecProvisioner::new(&cli.bridge_bin, &cli.storage_path)
            .with_timeout(Duration::from_secs(cli.command_timeout_secs)),
    );
    let ctx = Arc::new(
        Context::builder(store, provisioner)
            .default_profile(cli.profile.clone())
            .resync_interval(Duration::from_secs(cli.resync_secs))
            .build(),
    );

    let scheduler = Arc::new(
        Scheduler::new(SchedulerConfig {
            reconcile_timeout: Duration::from_secs(cli.reconcile_timeout_secs),
            ..Default::default()
        })
        .register(
            Kind::MinikubeCluster,
            Arc::new(ClusterReconciler::new(ctx.clone())),
        )
        .register(Kind::MinikubeMachine, Arc::new(MachineReconciler::new(ctx))),
    );
    let cancel = scheduler.cancellation_token();

    let ready = scheduler.clone();
    let probes = tokio::spawn(serve_probes(
        cli.health_probe_bind_address,
        Arc::new(move || ready.is_running()),
        cancel.clone(),
    ));
    let metrics = tokio::spawn(serve_metrics(
        cli.metrics_bind_address,
        registry,
        cancel.clone(),
    ));
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!(
        storage_path = %cli.storage_path.display(),
        profile = %cli.profile,
        bridge = %cli.bridge_bin.display(),
        "starting controllers"
    );
    scheduler.run(event_stream(client)).await;
    cancel.cancel();

    for (server, task) in [("health probe", probes), ("metrics", metrics)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server, error = %e, "server failed"),
            Err(e) => error!(server, error = %e, "server task panicked"),
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Cancel on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
        }
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}
