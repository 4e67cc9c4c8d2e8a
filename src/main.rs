use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

mod api;
mod builder;
mod cli;
mod config;
mod edge;
mod error;
mod logs;
mod model;
mod ports;
mod saga;
mod store;

use api::AppState;
use builder::{Builder, DockerBuilder};
use config::AppConfig;
use edge::{EdgeRouter, NginxCloudflareRouter, dns::EdgeDns, proxy::NginxProxy};
use logs::LogSink;
use ports::PortAllocator;
use saga::DeploymentSaga;
use store::StateStore;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = cli::get_cli_args();
    let config = AppConfig::from_env();

    let store = match StateStore::open(&args.state).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Unable to open state store at {}: {e}", args.state.display());
            return ExitCode::FAILURE;
        }
    };

    let logs = LogSink::new(store.clone());
    let ports = PortAllocator::new(store.clone(), config.min_port, config.max_port);

    let builder: Arc<dyn Builder> = Arc::new(DockerBuilder::new(
        logs.clone(),
        config.clone_timeout,
        config.build_timeout,
        config.external_timeout,
    ));
    let proxy = NginxProxy::new(
        config.proxy_available_dir.clone(),
        config.proxy_enabled_dir.clone(),
        config.base_domain.clone(),
        logs.clone(),
        config.external_timeout,
    );
    let dns = config.edge.clone().map(|edge_config| {
        EdgeDns::new(
            edge_config,
            config.base_domain.clone(),
            logs.clone(),
            config.external_timeout,
        )
    });
    let edge_router: Arc<dyn EdgeRouter> = Arc::new(NginxCloudflareRouter::new(proxy, dns));

    let saga = Arc::new(DeploymentSaga::new(
        store.clone(),
        logs.clone(),
        ports.clone(),
        builder,
        edge_router,
    ));

    let state = Arc::new(AppState {
        config,
        store,
        logs,
        ports,
        saga,
        tokens: tokio::sync::RwLock::new(HashSet::new()),
    });
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Unable to bind {}: {e}", args.bind);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Listening on {}", args.bind);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
    }
    log::info!("Shutting down");
}
