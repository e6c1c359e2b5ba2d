//! In-process peers and fixtures shared by the service tests.

use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    models::{
        container::Container,
        message::ReplicationMessage,
        node::Node,
        object::{EnumerationQuery, ObjectMetadata},
    },
    services::{
        container_manager::ContainerManager,
        replication::{PeerClient, PeerError, ReplicationHandler},
        storage_service::{RequestContext, StorageService},
        topology::{Topology, TopologyConfig},
    },
};

pub fn node(id: u32) -> Node {
    Node {
        id,
        name: format!("node-{id}"),
        hostname: "127.0.0.1".into(),
        port: 7000 + id as u16,
        tls: false,
    }
}

/// Nodes `1..=count`, seen from `local`.
pub fn topology(local: u32, count: u32, replication_factor: usize) -> Arc<Topology> {
    Arc::new(
        Topology::new(TopologyConfig {
            local_node_id: local,
            nodes: (1..=count).map(node).collect(),
            replication_factor,
        })
        .unwrap(),
    )
}

pub async fn service(
    data_dir: &Path,
    topology: Arc<Topology>,
    client: Arc<dyn PeerClient>,
) -> StorageService {
    let containers = Arc::new(ContainerManager::new(data_dir));
    containers.load().await.unwrap();
    let replication = Arc::new(ReplicationHandler::new(
        topology.clone(),
        client,
        Duration::from_secs(2),
    ));
    StorageService::new(containers, topology, replication, Duration::from_secs(30))
}

/// First `user-N` whose namespace `node_id` owns.
pub fn user_owned_by(topology: &Topology, node_id: u32) -> String {
    (0..10_000)
        .map(|i| format!("user-{i}"))
        .find(|user| topology.find_owner(user).map(|n| n.id) == Some(node_id))
        .unwrap()
}

/// Records deliveries; nodes marked failing reject them.
#[derive(Default)]
pub struct RecordingPeer {
    failing: Mutex<HashSet<u32>>,
    delay: Option<Duration>,
    slow_ops: HashMap<&'static str, Duration>,
    delivered: Mutex<Vec<(u32, ReplicationMessage)>>,
    attempts: AtomicUsize,
}

impl RecordingPeer {
    pub fn failing(nodes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            failing: Mutex::new(nodes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay only messages whose payload carries `label`.
    pub fn with_slow_op(mut self, label: &'static str, delay: Duration) -> Self {
        self.slow_ops.insert(label, delay);
        self
    }

    pub fn fail_node(&self, id: u32) {
        self.failing.lock().unwrap().insert(id);
    }

    pub fn delivered_to(&self) -> Vec<u32> {
        self.delivered.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn delivered_ops(&self) -> Vec<&'static str> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.payload.label())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PeerClient for RecordingPeer {
    async fn deliver(&self, node: &Node, message: &ReplicationMessage) -> Result<(), PeerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .slow_ops
            .get(message.payload.label())
            .copied()
            .or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&node.id) {
            return Err(PeerError::Rejected {
                node: node.id,
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.delivered.lock().unwrap().push((node.id, message.clone()));
        Ok(())
    }

    async fn list_containers(
        &self,
        _node: &Node,
        _user: Option<&str>,
    ) -> Result<Vec<Container>, PeerError> {
        Ok(Vec::new())
    }

    async fn enumerate_objects(
        &self,
        _node: &Node,
        _user: &str,
        _container: &str,
        _index_start: u64,
        _max_results: u32,
    ) -> Result<Vec<ObjectMetadata>, PeerError> {
        Ok(Vec::new())
    }

    async fn fetch_object(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        key: &str,
    ) -> Result<Bytes, PeerError> {
        Err(PeerError::NotFound {
            node: node.id,
            resource: format!("{user}/{container}/{key}"),
        })
    }
}

/// Routes peer calls straight into other in-process services.
#[derive(Default)]
pub struct LoopbackPeer {
    nodes: RwLock<HashMap<u32, StorageService>>,
    fetches: AtomicUsize,
}

impl LoopbackPeer {
    pub fn register(&self, id: u32, service: StorageService) {
        self.nodes.write().unwrap().insert(id, service);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn target(&self, node: &Node) -> Result<StorageService, PeerError> {
        self.nodes
            .read()
            .unwrap()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| PeerError::Transport {
                node: node.id,
                message: "not registered".into(),
            })
    }
}

fn rejected(node: &Node, err: crate::errors::StorageError) -> PeerError {
    PeerError::Rejected {
        node: node.id,
        status: err.kind().status_code(),
        message: err.to_string(),
    }
}

#[async_trait::async_trait]
impl PeerClient for LoopbackPeer {
    async fn deliver(&self, node: &Node, message: &ReplicationMessage) -> Result<(), PeerError> {
        self.target(node)?
            .apply_replication(message.clone())
            .await
            .map_err(|err| rejected(node, err))
    }

    async fn list_containers(
        &self,
        node: &Node,
        user: Option<&str>,
    ) -> Result<Vec<Container>, PeerError> {
        let target = self.target(node)?;
        Ok(match user {
            Some(user) => target.list_containers(user).await,
            None => target.containers.list_all().await,
        })
    }

    async fn enumerate_objects(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        index_start: u64,
        max_results: u32,
    ) -> Result<Vec<ObjectMetadata>, PeerError> {
        self.target(node)?
            .enumerate_objects(
                &RequestContext::peer(0),
                user,
                container,
                &EnumerationQuery::page(index_start, max_results),
            )
            .await
            .map_err(|err| rejected(node, err))
    }

    async fn fetch_object(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        key: &str,
    ) -> Result<Bytes, PeerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (_, reader) = self
            .target(node)?
            .read_object(&RequestContext::peer(0), user, container, key)
            .await
            .map_err(|err| rejected(node, err))?;
        reader.into_bytes().await.map_err(|err| rejected(node, err))
    }
}
