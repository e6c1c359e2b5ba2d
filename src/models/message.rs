//! Messages carried between nodes by outbound replication.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::container::ContainerSettings;

/// One replicated mutation, addressed to a container.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReplicationMessage {
    pub id: Uuid,
    /// Node that applied the change first.
    pub source_node: u32,
    pub user: String,
    pub container: String,
    pub created_at: DateTime<Utc>,
    pub payload: ReplicationPayload,
}

impl ReplicationMessage {
    pub fn new(
        source_node: u32,
        user: impl Into<String>,
        container: impl Into<String>,
        payload: ReplicationPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_node,
            user: user.into(),
            container: container.into(),
            created_at: Utc::now(),
            payload,
        }
    }
}

/// Operation-specific body of a [`ReplicationMessage`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ReplicationPayload {
    ContainerCreate {
        settings: ContainerSettings,
    },
    ContainerUpdate {
        settings: ContainerSettings,
    },
    ContainerDelete {
        purge: bool,
    },
    ContainerClearAudit,
    ObjectCreate {
        key: String,
        content_type: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        key_values: BTreeMap<String, String>,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    ObjectDelete {
        key: String,
    },
    ObjectRename {
        from: String,
        to: String,
    },
    ObjectWriteRange {
        key: String,
        offset: u64,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    ObjectWriteTags {
        key: String,
        tags: Vec<String>,
    },
    ObjectWriteKeyValues {
        key: String,
        key_values: BTreeMap<String, String>,
    },
}

impl ReplicationPayload {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            ReplicationPayload::ContainerCreate { .. } => "container-create",
            ReplicationPayload::ContainerUpdate { .. } => "container-update",
            ReplicationPayload::ContainerDelete { .. } => "container-delete",
            ReplicationPayload::ContainerClearAudit => "container-clear-audit",
            ReplicationPayload::ObjectCreate { .. } => "object-create",
            ReplicationPayload::ObjectDelete { .. } => "object-delete",
            ReplicationPayload::ObjectRename { .. } => "object-rename",
            ReplicationPayload::ObjectWriteRange { .. } => "object-write-range",
            ReplicationPayload::ObjectWriteTags { .. } => "object-write-tags",
            ReplicationPayload::ObjectWriteKeyValues { .. } => "object-write-key-values",
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
