//! Cluster nodes and redirect descriptors.

use serde::{Deserialize, Serialize};

/// A peer in the cluster, loaded from static topology configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: u32,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

impl Node {
    /// Base URL for reaching this node, e.g. `http://10.0.0.4:3000`.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.hostname, self.port)
    }
}

/// Points a caller at the node that owns a container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub node: Node,
    /// Absolute URL of the original request on the owning node.
    pub location: String,
}
