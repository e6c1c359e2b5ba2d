use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use container_store::{
    config::AppConfig,
    routes::{AppState, routes},
    services::{
        container_manager::ContainerManager,
        replication::{HttpPeerClient, ReplicationHandler},
        resync::ResyncManager,
        storage_service::StorageService,
        topology::Topology,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    tracing::info!("Starting container-store with config: {:?}", cfg);

    // --- Ensure data directory exists ---
    if !cfg.data_dir.exists() {
        std::fs::create_dir_all(&cfg.data_dir)?;
        tracing::info!("Created data directory at {}", cfg.data_dir.display());
    }

    // --- Topology + container registry ---
    let topology = Arc::new(cfg.topology()?);
    let local = topology.local_node();
    tracing::info!(
        node = local.id,
        name = %local.name,
        peers = topology.nodes().len() - 1,
        "topology loaded"
    );

    let containers = Arc::new(ContainerManager::new(&cfg.data_dir));
    let loaded = containers.load().await?;
    tracing::info!("Loaded {} containers from {}", loaded, cfg.data_dir.display());

    // --- Initialize core services ---
    let client = Arc::new(HttpPeerClient::new(local.id, cfg.sync_timeout)?);
    let replication = Arc::new(ReplicationHandler::new(
        topology.clone(),
        client,
        cfg.sync_timeout,
    ));
    let storage = StorageService::new(containers, topology.clone(), replication, cfg.lock_ttl);
    let resync = ResyncManager::new(storage.clone());

    spawn_topology_reload(cfg.clone(), topology);

    // --- Build router ---
    let app: Router = routes().with_state(AppState { storage, resync });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Re-read the topology file on SIGHUP.
#[cfg(unix)]
fn spawn_topology_reload(cfg: AppConfig, topology: Arc<Topology>) {
    use tokio::signal::unix::{SignalKind, signal};

    if cfg.topology_file.is_none() {
        return;
    }
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!("SIGHUP handler unavailable, topology reload disabled: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let result = cfg
                .topology_config()
                .and_then(|next| topology.reload(next).map_err(Into::into));
            if let Err(err) = result {
                tracing::warn!("topology reload failed: {:#}", err);
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_topology_reload(_cfg: AppConfig, _topology: Arc<Topology>) {}
