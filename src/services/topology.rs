//! src/services/topology.rs
//!
//! Cluster membership and container ownership. Nodes are placed on a
//! consistent-hash ring of virtual nodes; a user's namespace is owned by the
//! first node clockwise from the user's position and replicated to the next
//! distinct nodes along the same walk.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard},
};
use tracing::info;

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, ReplicationMode},
        node::Node,
    },
};

/// Virtual nodes placed on the ring per physical node.
pub const VNODES_PER_NODE: u16 = 64;

/// Static topology, loaded at startup or on reload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TopologyConfig {
    /// Which entry in `nodes` is this process.
    pub local_node_id: u32,
    pub nodes: Vec<Node>,
    /// Total copies of a container, owner included.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
}

fn default_replication_factor() -> usize {
    2
}

/// Ring position derived from the first 8 bytes of an MD5 digest.
fn ring_position(input: &str) -> u64 {
    let digest = md5::compute(input.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Consistent hashing ring for deterministic ownership.
#[derive(Debug, Clone, Default)]
struct Ring {
    /// Virtual node positions: ring position -> node id.
    vnodes: BTreeMap<u64, u32>,
}

impl Ring {
    fn build(nodes: &[Node]) -> Self {
        let mut vnodes = BTreeMap::new();
        for node in nodes {
            for i in 0..VNODES_PER_NODE {
                vnodes.insert(ring_position(&format!("node-{}-{}", node.id, i)), node.id);
            }
        }
        Self { vnodes }
    }

    /// Walk clockwise from `key`'s position collecting up to `count`
    /// distinct node ids.
    fn walk(&self, key: &str, count: usize) -> Vec<u32> {
        let pos = ring_position(key);
        let mut owners = Vec::with_capacity(count);
        let after = self.vnodes.range(pos..);
        let before = self.vnodes.range(..pos);
        for (_, node_id) in after.chain(before) {
            if owners.len() == count {
                break;
            }
            if !owners.contains(node_id) {
                owners.push(*node_id);
            }
        }
        owners
    }
}

#[derive(Debug)]
struct TopologyState {
    local_node_id: u32,
    nodes: BTreeMap<u32, Node>,
    ring: Ring,
    replication_factor: usize,
}

impl TopologyState {
    fn build(config: TopologyConfig) -> StorageResult<Self> {
        let mut nodes = BTreeMap::new();
        for node in config.nodes {
            let id = node.id;
            if nodes.insert(id, node).is_some() {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate node id {id} in topology"
                )));
            }
        }
        if !nodes.contains_key(&config.local_node_id) {
            return Err(StorageError::InvalidArgument(format!(
                "local node {} missing from topology",
                config.local_node_id
            )));
        }
        let ordered: Vec<Node> = nodes.values().cloned().collect();
        Ok(Self {
            local_node_id: config.local_node_id,
            ring: Ring::build(&ordered),
            nodes,
            replication_factor: config.replication_factor.max(1),
        })
    }
}

/// Holds the set of cluster nodes and answers ownership questions.
#[derive(Debug)]
pub struct Topology {
    state: RwLock<TopologyState>,
}

impl Topology {
    pub fn new(config: TopologyConfig) -> StorageResult<Self> {
        Ok(Self {
            state: RwLock::new(TopologyState::build(config)?),
        })
    }

    /// One-node cluster, used when no topology file is configured.
    pub fn single(node: Node) -> Self {
        let ring = Ring::build(std::slice::from_ref(&node));
        Self {
            state: RwLock::new(TopologyState {
                local_node_id: node.id,
                nodes: BTreeMap::from([(node.id, node)]),
                ring,
                replication_factor: 1,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TopologyState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the node set and rebuild the ring.
    pub fn reload(&self, config: TopologyConfig) -> StorageResult<()> {
        let next = TopologyState::build(config)?;
        info!(nodes = next.nodes.len(), local = next.local_node_id, "topology reloaded");
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        Ok(())
    }

    pub fn local_node(&self) -> Node {
        let state = self.read();
        state.nodes[&state.local_node_id].clone()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn node(&self, id: u32) -> Option<Node> {
        self.read().nodes.get(&id).cloned()
    }

    /// The single node responsible for `user`'s namespace.
    pub fn find_owner(&self, user: &str) -> Option<Node> {
        let state = self.read();
        state
            .ring
            .walk(user, 1)
            .first()
            .and_then(|id| state.nodes.get(id))
            .cloned()
    }

    /// Peers that must receive replicated operations for `container`.
    ///
    /// Empty when the container does not replicate.
    pub fn replica_set_for(&self, container: &Container) -> Vec<Node> {
        if container.replication == ReplicationMode::None {
            return Vec::new();
        }
        let state = self.read();
        state
            .ring
            .walk(&container.user, state.replication_factor)
            .into_iter()
            .filter(|id| *id != state.local_node_id)
            .filter_map(|id| state.nodes.get(&id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn node(id: u32) -> Node {
        Node {
            id,
            name: format!("node-{id}"),
            hostname: format!("10.0.0.{id}"),
            port: 3000,
            tls: false,
        }
    }

    fn config(local: u32, count: u32, factor: usize) -> TopologyConfig {
        TopologyConfig {
            local_node_id: local,
            nodes: (1..=count).map(node).collect(),
            replication_factor: factor,
        }
    }

    fn container(user: &str, mode: ReplicationMode) -> Container {
        Container {
            id: Uuid::new_v4(),
            user: user.into(),
            name: "docs".into(),
            objects_dir: PathBuf::from("/tmp/x"),
            public_read: false,
            public_write: false,
            audit_logging: false,
            replication: mode,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn owner_is_deterministic() {
        let a = Topology::new(config(1, 5, 2)).unwrap();
        let b = Topology::new(config(3, 5, 2)).unwrap();
        for user in ["alice", "bob", "carol", "dave"] {
            let owner = a.find_owner(user).unwrap();
            assert_eq!(a.find_owner(user).unwrap(), owner);
            // Same node set, different local node: same answer.
            assert_eq!(b.find_owner(user).unwrap(), owner);
        }
    }

    #[test]
    fn owners_spread_across_nodes() {
        let topo = Topology::new(config(1, 4, 1)).unwrap();
        let owners: std::collections::HashSet<u32> = (0..200)
            .filter_map(|i| topo.find_owner(&format!("user-{i}")))
            .map(|n| n.id)
            .collect();
        assert!(owners.len() > 1);
    }

    #[test]
    fn replica_set_excludes_local_and_respects_mode() {
        let topo = Topology::new(config(1, 3, 3)).unwrap();
        let sync = container("alice", ReplicationMode::Sync);
        let replicas = topo.replica_set_for(&sync);
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|n| n.id != 1));

        let none = container("alice", ReplicationMode::None);
        assert!(topo.replica_set_for(&none).is_empty());
    }

    #[test]
    fn reload_replaces_nodes() {
        let topo = Topology::new(config(1, 1, 2)).unwrap();
        assert_eq!(topo.find_owner("alice").unwrap().id, 1);
        assert!(topo.replica_set_for(&container("alice", ReplicationMode::Async)).is_empty());

        topo.reload(config(1, 2, 2)).unwrap();
        assert_eq!(topo.nodes().len(), 2);
        let replicas = topo.replica_set_for(&container("alice", ReplicationMode::Async));
        assert_eq!(replicas, vec![node(2)]);
    }

    #[test]
    fn rejects_topology_without_local_node() {
        let err = Topology::new(config(9, 3, 2)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(Topology::new(TopologyConfig {
            local_node_id: 1,
            nodes: vec![node(1), node(1)],
            replication_factor: 1,
        })
        .is_err());
    }
}
