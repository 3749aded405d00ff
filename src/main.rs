use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vxrouter::config::{Config, IPAM_DRIVER_NAME, NETWORK_DRIVER_NAME};
use vxrouter::docker::DockerClient;
use vxrouter::driver::Core;
use vxrouter::netlink::RtNetlink;
use vxrouter::plugin;

/// Docker VXLAN networking with route-table-backed address allocation.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Enable debug logging.
    #[clap(short, long, env = "VXR_DEBUG_LOGGING")]
    debug: bool,

    /// Scope of the network, local or global.
    #[clap(short, long, env = "VXR_NETWORK_SCOPE", default_value = "local")]
    scope: String,

    /// How long to wait for external route propagation.
    #[clap(long, env = "VXR_PROP_TIMEOUT", default_value = "100ms",
           value_parser = humantime::parse_duration)]
    prop_timeout: Duration,

    /// Maximum allowed response time, to prevent hanging the orchestrator.
    #[clap(long, env = "VXR_RESP_TIMEOUT", default_value = "10s",
           value_parser = humantime::parse_duration)]
    resp_timeout: Duration,

    /// Interval between reconcile sweeps of routes and containers.
    /// 0 disables the ticker; the startup sweep always runs.
    #[clap(long, env = "VXR_RECONCILE_INTERVAL", default_value = "30s",
           value_parser = humantime::parse_duration)]
    reconcile_interval: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "vxrouter=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config {
        scope: cli.scope.clone(),
        prop_timeout: cli.prop_timeout,
        resp_timeout: cli.resp_timeout,
        reconcile_interval: cli.reconcile_interval,
        ..Config::default()
    }
    .with_env();

    let nl = Arc::new(RtNetlink::new().context("failed to open netlink")?);
    let docker = Arc::new(DockerClient::from_env());
    let core = Core::new(docker, nl, config.clone());

    tokio::spawn(Arc::clone(&core).run_reconciler(config.reconcile_interval));

    let (network_listener, ipam_listener) = match plugin::activation_listeners()
        .context("socket activation")?
    {
        Some(listeners) => {
            tracing::debug!("using socket-activated listeners");
            listeners
        }
        None => {
            let network = plugin::bind_socket(NETWORK_DRIVER_NAME)
                .with_context(|| format!("failed to bind {NETWORK_DRIVER_NAME} socket"))?;
            let ipam = plugin::bind_socket(IPAM_DRIVER_NAME)
                .with_context(|| format!("failed to bind {IPAM_DRIVER_NAME} socket"))?;
            (network, ipam)
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!(%err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        });
    }

    tracing::info!(
        scope = %config.scope,
        route_proto = config.route_proto,
        "serving {} and {}",
        NETWORK_DRIVER_NAME,
        IPAM_DRIVER_NAME
    );

    let network_router = plugin::network::router(Arc::clone(&core), config.scope.clone());
    let ipam_router = plugin::ipam::router(Arc::clone(&core));

    let (network_result, ipam_result) = tokio::join!(
        plugin::serve(network_router, network_listener, shutdown.clone()),
        plugin::serve(ipam_router, ipam_listener, shutdown.clone()),
    );
    network_result.context("network driver server")?;
    ipam_result.context("ipam driver server")?;

    Ok(())
}
