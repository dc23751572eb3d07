// # OJP Server
//
// Main entry point for the proxy server. Loads configuration from process
// properties and environment, sizes the worker runtime, publishes external
// drivers, and serves the wire protocol until interrupted.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use ojp::config::{PropertySource, ServerConfig};
use ojp::engine::ProxyEngine;
use ojp::server::ProxyServer;
use ojp::VERSION;
use tokio::net::TcpListener;
use tracing::{error, info};

fn main() -> ExitCode {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("OJP proxy server");
    info!("Version: {}", VERSION);

    let props = PropertySource::from_env();
    let config = match ServerConfig::from_source(&props) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        port = config.port,
        threads = config.thread_pool_size,
        "configuration loaded"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool_size)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot build worker runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, props)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "unrecoverable startup failure");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig, props: PropertySource) -> ojp::Result<()> {
    let libs_path = config.libs_path.clone();
    let port = config.port;
    let engine = ProxyEngine::with_default_providers(config, props);

    // Publish drivers shipped as external archives.
    let published =
        ojp::backend::load_external_drivers(Path::new(&libs_path), engine.drivers().as_ref())?;
    if !published.is_empty() {
        info!(count = published.len(), "external drivers published");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let server = Arc::new(ProxyServer::new(engine));

    let shutdown_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown_server.shutdown().await;
        }
    });

    server.serve(listener).await
}
