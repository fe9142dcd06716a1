//! stratus-operator: reconciles a cluster's cloud infrastructure.
//!
//! Loads the cluster specification and, on every tick:
//! - Uploads node bootstrap configuration to the storage container
//! - Scales and rolls the compute fleets one step at a time
//! - Keeps both sides of the host VPN connection consistent
//!
//! Runs against an in-process simulated cloud.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratus_operator::clients::{MemoryCloud, ProvisioningState, VpnGateway};
use stratus_operator::{ClusterSpec, Operator};

/// stratus cluster operator
#[derive(Parser, Debug)]
#[command(name = "stratus-operator", version, about)]
struct Args {
    /// Path to the cluster specification (JSON)
    #[arg(long, default_value = "cluster.json")]
    cluster_spec: PathBuf,

    /// Seconds between reconcile passes
    #[arg(long, default_value = "30")]
    resync_interval: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Remove the cluster's infrastructure instead of reconciling it
    #[arg(long)]
    teardown: bool,

    /// Maximum teardown passes before giving up
    #[arg(long, default_value = "10")]
    teardown_passes: usize,

    /// Latency of simulated provider operations in milliseconds
    #[arg(long, default_value = "0")]
    simulated_latency_ms: u64,
}

/// Simulated subscriptions with the cluster's VPN gateways provisioned.
fn simulated_clouds(cluster: &ClusterSpec, latency: Duration) -> (MemoryCloud, MemoryCloud) {
    let host = MemoryCloud::new().with_latency(latency);
    let guest = MemoryCloud::new().with_latency(latency);

    if let Some(vpn) = &cluster.vpn {
        for (cloud, endpoint) in [(&host, &vpn.host), (&guest, &vpn.guest)] {
            cloud.insert_gateway(
                &endpoint.resource_group,
                VpnGateway {
                    id: format!(
                        "/resourceGroups/{}/virtualNetworkGateways/{}",
                        endpoint.resource_group, endpoint.gateway_name
                    ),
                    name: endpoint.gateway_name.clone(),
                    provisioning_state: ProvisioningState::Succeeded,
                },
            );
        }
    }
    (host, guest)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_operator=info,audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let cluster = ClusterSpec::load(&args.cluster_spec).with_context(|| {
        format!(
            "Failed to load cluster spec {}",
            args.cluster_spec.display()
        )
    })?;

    info!(
        "Starting stratus-operator for cluster {} (release {})",
        cluster.id, cluster.version
    );

    let (host, guest) =
        simulated_clouds(&cluster, Duration::from_millis(args.simulated_latency_ms));
    let operator = Operator::simulated(cluster, &host, &guest);
    let resync = Duration::from_secs(args.resync_interval.max(1));

    if args.teardown {
        let report = operator.teardown_all(resync, args.teardown_passes).await;
        if !report.is_converged() {
            anyhow::bail!(
                "Teardown did not finish after {} passes ({} handler(s) failed)",
                args.teardown_passes,
                report.error_count()
            );
        }
        return Ok(());
    }

    if args.once {
        let report = operator.run_once().await;
        if report.error_count() > 0 {
            anyhow::bail!("{} handler(s) failed", report.error_count());
        }
        return Ok(());
    }

    tokio::select! {
        _ = operator.run(resync) => {}
        _ = signal::ctrl_c() => info!("Received SIGINT"),
    }

    info!("Shutdown complete");
    Ok(())
}
