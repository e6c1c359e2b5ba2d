//! Time-bounded resource locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

/// A lock held on a resource path such as `/user/container/key`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UrlLock {
    pub id: Uuid,
    pub lock_type: LockType,
    pub resource: String,
    /// Identity of the caller holding the lock.
    pub holder: String,
    /// Host that granted the lock.
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UrlLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
