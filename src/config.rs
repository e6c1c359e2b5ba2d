use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    models::node::Node,
    services::topology::{Topology, TopologyConfig},
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub node_id: u32,
    pub topology_file: Option<PathBuf>,
    pub replication_factor: Option<usize>,
    pub sync_timeout: Duration,
    pub lock_ttl: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Replicated container and object storage node")]
pub struct Args {
    /// Host to bind to (overrides CONTAINER_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CONTAINER_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for containers (overrides CONTAINER_STORE_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// This node's id in the topology (overrides CONTAINER_STORE_NODE_ID)
    #[arg(long)]
    pub node_id: Option<u32>,

    /// JSON file listing cluster nodes (overrides CONTAINER_STORE_TOPOLOGY_FILE)
    #[arg(long)]
    pub topology_file: Option<PathBuf>,

    /// Copies kept of each container, owner included
    #[arg(long)]
    pub replication_factor: Option<usize>,

    /// How long sync replication waits for peers, in milliseconds
    #[arg(long)]
    pub sync_timeout_ms: Option<u64>,

    /// Lifetime of resource locks, in seconds
    #[arg(long)]
    pub lock_ttl_secs: Option<u64>,
}

/// On-disk topology description. The local node is picked by `node_id`.
#[derive(Debug, Deserialize)]
struct TopologyFile {
    nodes: Vec<Node>,
    #[serde(default)]
    replication_factor: Option<usize>,
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse())
    }

    fn merge(args: Args) -> Result<Self> {
        let host = match args.host {
            Some(host) => host,
            None => env::var("CONTAINER_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        };
        let port = match args.port {
            Some(port) => port,
            None => env_parse("CONTAINER_STORE_PORT")?.unwrap_or(3000),
        };
        let data_dir = match args.data_dir {
            Some(dir) => dir,
            None => env_parse("CONTAINER_STORE_DATA_DIR")?.unwrap_or_else(|| "./data".into()),
        };
        let node_id = match args.node_id {
            Some(id) => id,
            None => env_parse("CONTAINER_STORE_NODE_ID")?.unwrap_or(1),
        };
        let topology_file = match args.topology_file {
            Some(path) => Some(path),
            None => env_parse("CONTAINER_STORE_TOPOLOGY_FILE")?,
        };
        let replication_factor = match args.replication_factor {
            Some(factor) => Some(factor),
            None => env_parse("CONTAINER_STORE_REPLICATION_FACTOR")?,
        };
        let sync_timeout_ms = match args.sync_timeout_ms {
            Some(ms) => ms,
            None => env_parse("CONTAINER_STORE_SYNC_TIMEOUT_MS")?.unwrap_or(5_000),
        };
        let lock_ttl_secs = match args.lock_ttl_secs {
            Some(secs) => secs,
            None => env_parse("CONTAINER_STORE_LOCK_TTL_SECS")?.unwrap_or(60),
        };

        Ok(Self {
            host,
            port,
            data_dir,
            node_id,
            topology_file,
            replication_factor,
            sync_timeout: Duration::from_millis(sync_timeout_ms),
            lock_ttl: Duration::from_secs(lock_ttl_secs),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read the topology file, or describe a single-node cluster made of
    /// this process when none is configured.
    pub fn topology_config(&self) -> Result<TopologyConfig> {
        let Some(path) = &self.topology_file else {
            return Ok(TopologyConfig {
                local_node_id: self.node_id,
                nodes: vec![self.standalone_node()],
                replication_factor: 1,
            });
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading topology file {}", path.display()))?;
        let file: TopologyFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing topology file {}", path.display()))?;
        if !file.nodes.iter().any(|n| n.id == self.node_id) {
            bail!(
                "node id {} is not listed in {}",
                self.node_id,
                path.display()
            );
        }
        Ok(TopologyConfig {
            local_node_id: self.node_id,
            replication_factor: self
                .replication_factor
                .or(file.replication_factor)
                .unwrap_or(2),
            nodes: file.nodes,
        })
    }

    pub fn topology(&self) -> Result<Topology> {
        if self.topology_file.is_none() {
            return Ok(Topology::single(self.standalone_node()));
        }
        Ok(Topology::new(self.topology_config()?)?)
    }

    fn standalone_node(&self) -> Node {
        let hostname = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1".to_string(),
            host => host.to_string(),
        };
        Node {
            id: self.node_id,
            name: format!("node-{}", self.node_id),
            hostname,
            port: self.port,
            tls: false,
        }
    }
}
