#![doc = include_str!("../../README.md")]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lodestone_indexer::{cli::Cli, rpc::HttpDaemonRpc, services::StatusServer, sync::Controller};
use lodestone_storage::HeaderStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    create_tracing_subscriber();

    let opts = cli.sync_opts().map_err(anyhow::Error::msg)?;

    let metrics_addr: SocketAddr = format!("{}:{}", cli.server_ip, cli.metrics_port)
        .parse()
        .context("invalid metrics listen address")?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install metrics exporter")?;

    let storage = Arc::new(
        HeaderStore::open(&cli.data_dir)
            .await
            .context("opening header store")?,
    );
    let rpc = Arc::new(HttpDaemonRpc::new(&cli.daemon_url).context("constructing daemon client")?);

    let controller = Controller::new(opts, rpc, storage);
    let listener = StatusServer::new(&cli.server_ip, cli.server_port, controller.status());
    let controller = controller.with_listener(listener);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_task = tokio::spawn(controller.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        result = &mut controller_task => {
            // the controller only exits on its own when startup failed
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err).context("controller exited"),
                Err(err) => Err(err).context("controller task panicked"),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(30), controller_task).await {
        Ok(Ok(Ok(()))) => info!("controller drained"),
        Ok(Ok(Err(err))) => error!(%err, "controller exited with error"),
        Ok(Err(err)) => error!(%err, "controller task panicked"),
        Err(_) => warn!("controller did not drain in time"),
    }
    Ok(())
}

fn create_tracing_subscriber() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
