//! Represents an object (byte blob) stored in a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default page size for enumeration.
pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Hard cap on objects returned by a single enumeration call.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Metadata for a single object within a container.
///
/// The struct describes the object's content, it never holds the bytes.
/// `content_length` and `content_hash` always reflect what is on disk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Internal identifier, also the name of the object's file on disk.
    pub id: Uuid,

    /// Parent container.
    pub container_id: Uuid,

    /// User-supplied object key.
    pub key: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Size in bytes.
    pub content_length: u64,

    /// Lowercase hex MD5 of the content.
    pub content_hash: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub key_values: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl ObjectMetadata {
    /// Derive the internal identifier for `key` inside `container_id`.
    ///
    /// The id is stable for a given key, so a renamed object gets a new id
    /// and its file moves with it.
    pub fn object_id(container_id: &Uuid, key: &str) -> Uuid {
        Uuid::new_v5(container_id, key.as_bytes())
    }
}

/// Predicates applied to an enumeration; all set fields must match.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct EnumerationFilter {
    pub prefix: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub accessed_before: Option<DateTime<Utc>>,
    pub accessed_after: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub content_type: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Every listed tag must be present on the object.
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnumerationOrder {
    #[default]
    CreatedDescending,
    CreatedAscending,
    UpdatedDescending,
    UpdatedAscending,
    KeyAscending,
    KeyDescending,
    SizeDescending,
    SizeAscending,
}

impl EnumerationOrder {
    pub(crate) fn order_clause(self) -> &'static str {
        match self {
            EnumerationOrder::CreatedDescending => " ORDER BY created_at DESC, object_key ASC",
            EnumerationOrder::CreatedAscending => " ORDER BY created_at ASC, object_key ASC",
            EnumerationOrder::UpdatedDescending => " ORDER BY updated_at DESC, object_key ASC",
            EnumerationOrder::UpdatedAscending => " ORDER BY updated_at ASC, object_key ASC",
            EnumerationOrder::KeyAscending => " ORDER BY object_key ASC",
            EnumerationOrder::KeyDescending => " ORDER BY object_key DESC",
            EnumerationOrder::SizeDescending => " ORDER BY content_length DESC, object_key ASC",
            EnumerationOrder::SizeAscending => " ORDER BY content_length ASC, object_key ASC",
        }
    }
}

/// One page request against a container's objects.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct EnumerationQuery {
    pub index_start: u64,
    pub max_results: Option<u32>,
    pub filter: EnumerationFilter,
    pub order_by: EnumerationOrder,
}

impl EnumerationQuery {
    pub fn page(index_start: u64, max_results: u32) -> Self {
        Self {
            index_start,
            max_results: Some(max_results),
            ..Self::default()
        }
    }

    /// Requested page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> u32 {
        self.max_results
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}
