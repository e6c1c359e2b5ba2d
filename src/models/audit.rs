//! Append-only audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Read,
    ReadRange,
    Write,
    WriteRange,
    Delete,
    Rename,
    Exists,
    WriteTags,
    DeleteTags,
    WriteKeyValue,
    DeleteKeyValue,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Read => "Read",
            AuditAction::ReadRange => "ReadRange",
            AuditAction::Write => "Write",
            AuditAction::WriteRange => "WriteRange",
            AuditAction::Delete => "Delete",
            AuditAction::Rename => "Rename",
            AuditAction::Exists => "Exists",
            AuditAction::WriteTags => "WriteTags",
            AuditAction::DeleteTags => "DeleteTags",
            AuditAction::WriteKeyValue => "WriteKeyValue",
            AuditAction::DeleteKeyValue => "DeleteKeyValue",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Read" => AuditAction::Read,
            "ReadRange" => AuditAction::ReadRange,
            "Write" => AuditAction::Write,
            "WriteRange" => AuditAction::WriteRange,
            "Delete" => AuditAction::Delete,
            "Rename" => AuditAction::Rename,
            "Exists" => AuditAction::Exists,
            "WriteTags" => AuditAction::WriteTags,
            "DeleteTags" => AuditAction::DeleteTags,
            "WriteKeyValue" => AuditAction::WriteKeyValue,
            "DeleteKeyValue" => AuditAction::DeleteKeyValue,
            other => return Err(format!("unknown audit action `{other}`")),
        })
    }
}

/// One tracked operation. Never mutated once written.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditLogEntry {
    /// Assigned by the store on insert; zero before that.
    pub id: i64,
    pub container_id: Uuid,
    pub object_id: Option<Uuid>,
    pub object_key: Option<String>,
    pub action: AuditAction,
    /// Free-form detail, e.g. the caller or a byte range.
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(container_id: Uuid, action: AuditAction) -> Self {
        Self {
            id: 0,
            container_id,
            object_id: None,
            object_key: None,
            action,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_object(mut self, object_id: Uuid, key: &str) -> Self {
        self.object_id = Some(object_id);
        self.object_key = Some(key.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Filters for reading back the audit log, oldest first.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AuditQuery {
    pub object_key: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub index_start: u64,
    pub max_results: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_from_their_names() {
        for action in [
            AuditAction::Read,
            AuditAction::WriteRange,
            AuditAction::DeleteKeyValue,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>(), Ok(action));
        }
        assert!("Bogus".parse::<AuditAction>().is_err());
    }
}
