//! src/services/replication.rs
//!
//! Outbound replication. Each mutating operation that succeeded locally is
//! turned into a [`ReplicationMessage`] and delivered to the container's
//! replica set: `Sync` containers wait for every peer (bounded by a timeout),
//! `Async` containers queue the message on a per-peer outbox that one
//! background task drains in order.

use bytes::Bytes;
use futures::future::join_all;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, ReplicationMode},
        message::{ReplicationMessage, ReplicationPayload},
        node::{Node, Redirect},
        object::ObjectMetadata,
    },
    services::topology::Topology,
};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("node {node}: request failed: {message}")]
    Transport { node: u32, message: String },
    #[error("node {node}: responded {status}: {message}")]
    Rejected {
        node: u32,
        status: u16,
        message: String,
    },
    #[error("node {node}: no response within {timeout_ms} ms")]
    Timeout { node: u32, timeout_ms: u128 },
    #[error("node {node}: `{resource}` not found")]
    NotFound { node: u32, resource: String },
}

impl From<PeerError> for StorageError {
    fn from(err: PeerError) -> Self {
        StorageError::Replication(err.to_string())
    }
}

/// Node-to-node calls. Abstracted so tests can run several nodes in-process.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// Apply a replicated mutation on `node`.
    async fn deliver(&self, node: &Node, message: &ReplicationMessage) -> Result<(), PeerError>;

    /// Containers on `node`, optionally limited to one user.
    async fn list_containers(
        &self,
        node: &Node,
        user: Option<&str>,
    ) -> Result<Vec<Container>, PeerError>;

    /// One page of a container's objects on `node`, newest first.
    async fn enumerate_objects(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        index_start: u64,
        max_results: u32,
    ) -> Result<Vec<ObjectMetadata>, PeerError>;

    /// Full content of one object on `node`.
    async fn fetch_object(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        key: &str,
    ) -> Result<Bytes, PeerError>;
}

/// Header carrying the calling node's id on internal requests.
pub const NODE_ID_HEADER: &str = "x-node-id";

/// [`PeerClient`] speaking JSON over HTTP to the internal routes.
#[derive(Clone, Debug)]
pub struct HttpPeerClient {
    client: Client,
    local_node_id: u32,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(local_node_id: u32, timeout: Duration) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StorageError::Server(format!("building peer client: {err}")))?;
        Ok(Self {
            client,
            local_node_id,
            timeout,
        })
    }

    fn url(node: &Node, segments: &[&str]) -> Result<Url, PeerError> {
        let transport = |message: String| PeerError::Transport {
            node: node.id,
            message,
        };
        let mut url = Url::parse(&node.base_url()).map_err(|err| transport(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| transport("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|s| s.split('/')));
        Ok(url)
    }

    async fn send(
        &self,
        node: &Node,
        resource: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PeerError> {
        let response = request
            .header(NODE_ID_HEADER, self.local_node_id)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PeerError::Timeout {
                        node: node.id,
                        timeout_ms: self.timeout.as_millis(),
                    }
                } else {
                    PeerError::Transport {
                        node: node.id,
                        message: err.to_string(),
                    }
                }
            })?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(PeerError::NotFound {
                node: node.id,
                resource: resource.to_string(),
            }),
            status => Err(PeerError::Rejected {
                node: node.id,
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    fn decode_err(node: &Node, err: reqwest::Error) -> PeerError {
        PeerError::Transport {
            node: node.id,
            message: format!("decoding response: {err}"),
        }
    }
}

/// Query string of the internal enumeration route.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
#[serde(default)]
pub struct PageParams {
    pub index_start: u64,
    pub max_results: Option<u32>,
}

#[async_trait::async_trait]
impl PeerClient for HttpPeerClient {
    async fn deliver(&self, node: &Node, message: &ReplicationMessage) -> Result<(), PeerError> {
        let url = Self::url(node, &["_internal", "replicate"])?;
        self.send(node, "replicate", self.client.post(url).json(message))
            .await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        node: &Node,
        user: Option<&str>,
    ) -> Result<Vec<Container>, PeerError> {
        let url = Self::url(node, &["_internal", "containers"])?;
        let mut request = self.client.get(url);
        if let Some(user) = user {
            request = request.query(&[("user", user)]);
        }
        self.send(node, "containers", request)
            .await?
            .json()
            .await
            .map_err(|err| Self::decode_err(node, err))
    }

    async fn enumerate_objects(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        index_start: u64,
        max_results: u32,
    ) -> Result<Vec<ObjectMetadata>, PeerError> {
        let url = Self::url(node, &["_internal", "objects", user, container])?;
        let request = self.client.get(url).query(&PageParams {
            index_start,
            max_results: Some(max_results),
        });
        self.send(node, &format!("{user}/{container}"), request)
            .await?
            .json()
            .await
            .map_err(|err| Self::decode_err(node, err))
    }

    async fn fetch_object(
        &self,
        node: &Node,
        user: &str,
        container: &str,
        key: &str,
    ) -> Result<Bytes, PeerError> {
        let url = Self::url(node, &["_internal", "objects", user, container, key])?;
        self.send(node, &format!("{user}/{container}/{key}"), self.client.get(url))
            .await?
            .bytes()
            .await
            .map_err(|err| Self::decode_err(node, err))
    }
}

type Outbound = (Node, Arc<ReplicationMessage>);

/// Delivers replication messages and builds redirects.
pub struct ReplicationHandler {
    topology: Arc<Topology>,
    client: Arc<dyn PeerClient>,
    sync_timeout: Duration,
    /// Async outboxes keyed by peer id.
    outboxes: Mutex<HashMap<u32, mpsc::UnboundedSender<Outbound>>>,
}

impl ReplicationHandler {
    pub fn new(topology: Arc<Topology>, client: Arc<dyn PeerClient>, sync_timeout: Duration) -> Self {
        Self {
            topology,
            client,
            sync_timeout,
            outboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Arc<dyn PeerClient> {
        self.client.clone()
    }

    /// Whether changes to `container` leave this node at all.
    pub fn replicates(&self, container: &Container) -> bool {
        !self.topology.replica_set_for(container).is_empty()
    }

    /// Send `payload` to every replica of `container`.
    ///
    /// `Sync` returns an error if any replica fails or times out; `Async`
    /// always returns `Ok`. Async messages reach each peer in the order they
    /// were propagated, and failures are logged by the outbox task.
    pub async fn propagate(
        &self,
        container: &Container,
        payload: ReplicationPayload,
    ) -> StorageResult<()> {
        let replicas = self.topology.replica_set_for(container);
        if replicas.is_empty() {
            return Ok(());
        }

        let local = self.topology.local_node();
        let message =
            ReplicationMessage::new(local.id, &container.user, &container.name, payload);
        debug!(
            user = %container.user,
            container = %container.name,
            op = message.payload.label(),
            replicas = replicas.len(),
            mode = ?container.replication,
            "propagating change"
        );

        match container.replication {
            ReplicationMode::None => Ok(()),
            ReplicationMode::Sync => {
                let failures = deliver_all(
                    self.client.as_ref(),
                    &replicas,
                    &message,
                    self.sync_timeout,
                )
                .await;
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(StorageError::Replication(
                        failures
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; "),
                    ))
                }
            }
            ReplicationMode::Async => {
                let message = Arc::new(message);
                for node in replicas {
                    self.enqueue(node, message.clone());
                }
                Ok(())
            }
        }
    }

    /// Queue `message` for `node`, starting its outbox task on first use or
    /// after the previous task has gone away.
    fn enqueue(&self, node: Node, message: Arc<ReplicationMessage>) {
        let mut outboxes = self
            .outboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = node.id;
        let mut item = (node, message);
        if let Some(outbox) = outboxes.get(&id) {
            match outbox.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        let (outbox, inbox) = mpsc::unbounded_channel();
        tokio::spawn(drain_outbox(self.client.clone(), self.sync_timeout, inbox));
        if outbox.send(item).is_err() {
            warn!(node = id, "replication outbox closed before first message");
        }
        outboxes.insert(id, outbox);
    }

    /// Point a caller at `owner` for the request originally sent to
    /// `original_path` (path and query, starting with `/`).
    pub fn build_redirect(&self, owner: &Node, original_path: &str) -> Redirect {
        Redirect {
            node: owner.clone(),
            location: format!("{}{}", owner.base_url(), original_path),
        }
    }
}

/// Deliver queued messages to one peer, one at a time.
async fn drain_outbox(
    client: Arc<dyn PeerClient>,
    timeout: Duration,
    mut inbox: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some((node, message)) = inbox.recv().await {
        if let Err(err) = deliver_one(client.as_ref(), &node, &message, timeout).await {
            warn!(
                message_id = %message.id,
                op = message.payload.label(),
                error = %err,
                "async replication failed"
            );
        }
    }
}

async fn deliver_one(
    client: &dyn PeerClient,
    node: &Node,
    message: &ReplicationMessage,
    timeout: Duration,
) -> Result<(), PeerError> {
    match tokio::time::timeout(timeout, client.deliver(node, message)).await {
        Ok(result) => result,
        Err(_) => Err(PeerError::Timeout {
            node: node.id,
            timeout_ms: timeout.as_millis(),
        }),
    }
}

async fn deliver_all(
    client: &dyn PeerClient,
    replicas: &[Node],
    message: &ReplicationMessage,
    timeout: Duration,
) -> Vec<PeerError> {
    let deliveries = replicas
        .iter()
        .map(|node| deliver_one(client, node, message, timeout));
    join_all(deliveries)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}
