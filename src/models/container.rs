//! A named collection of objects owned by one user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Per-container replication policy.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Changes stay on this node.
    #[default]
    None,
    /// Block until every replica acknowledges.
    Sync,
    /// Deliver in the background and return immediately.
    Async,
}

/// Settings supplied when provisioning or updating a container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Owning user identifier.
    pub user: String,

    /// Container name, unique per user.
    pub name: String,

    #[serde(default)]
    pub public_read: bool,

    #[serde(default)]
    pub public_write: bool,

    /// Record every tracked operation in the audit log.
    #[serde(default)]
    pub audit_logging: bool,

    #[serde(default)]
    pub replication: ReplicationMode,
}

impl ContainerSettings {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
            public_read: false,
            public_write: false,
            audit_logging: false,
            replication: ReplicationMode::None,
        }
    }

    pub fn with_audit_logging(mut self, enabled: bool) -> Self {
        self.audit_logging = enabled;
        self
    }

    pub fn with_replication(mut self, mode: ReplicationMode) -> Self {
        self.replication = mode;
        self
    }
}

/// A provisioned container.
///
/// Persisted as `container.json` inside the container's directory so the
/// registry can be rebuilt at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub id: Uuid,

    /// ID of the user that owns this container.
    pub user: String,

    pub name: String,

    /// Directory holding this container's object files.
    pub objects_dir: PathBuf,

    pub public_read: bool,

    pub public_write: bool,

    pub audit_logging: bool,

    pub replication: ReplicationMode,

    /// When this container was created.
    pub created_at: DateTime<Utc>,
}

impl Container {
    /// Resource path prefix used for locks and redirects.
    pub fn resource_path(&self) -> String {
        format!("/{}/{}", self.user, self.name)
    }

    /// Settings that would provision an identical container elsewhere.
    pub fn settings(&self) -> ContainerSettings {
        ContainerSettings {
            user: self.user.clone(),
            name: self.name.clone(),
            public_read: self.public_read,
            public_write: self.public_write,
            audit_logging: self.audit_logging,
            replication: self.replication,
        }
    }
}
