//! # Keystone Operator
//!
//! Deploys OpenStack Keystone from `KeystoneAPI` objects and keeps the
//! service catalog in sync with `KeystoneService` objects.
//!
//! The manager binary wires the cluster store, the identity connector and
//! the HTTP server together, then runs both controllers until SIGINT/SIGTERM.

use anyhow::{Context as _, Result};
use clap::Parser;
use keystone_operator::admission::Defaulter;
use keystone_operator::cluster::KubeCluster;
use keystone_operator::config::ControllerConfig;
use keystone_operator::controller::Context;
use keystone_operator::identity::rest::KeystoneConnector;
use keystone_operator::observability;
use keystone_operator::runtime::watch_loop::run_watch_loop;
use keystone_operator::server::{start_server, ServerState};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};

/// Keystone operator manager
#[derive(Debug, Parser)]
#[command(name = "keystone-operator", version, about)]
struct Args {
    /// Port of the metrics, probe and admission server
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Only watch this namespace (all namespaces when omitted)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any TLS client is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|provider| {
            anyhow::anyhow!("a rustls crypto provider is already installed: {provider:?}")
        })?;

    let args = Args::parse();
    let mut config = ControllerConfig::from_env();
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    if let Some(namespace) = args.namespace {
        config.watch_namespace = namespace;
    }

    observability::logging::init(&config.log_level);

    info!("Starting Keystone Operator");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new(Defaulter::new(
        config.default_container_image.clone(),
    )));
    let server_port = config.metrics_port;
    let server_state_clone = server_state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let identity = KeystoneConnector::new(config.identity_request_timeout())
        .context("Failed to build identity client")?;
    let ctx = Arc::new(Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(identity),
        config,
    ));

    run_watch_loop(client, ctx, server_state).await
}
