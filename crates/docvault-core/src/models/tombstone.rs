//! Tombstone model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::document::SyncId;

/// Which kind of record a tombstone buries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Document,
    Attachment,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Attachment => "attachment",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "attachment" => Ok(Self::Attachment),
            other => Err(Error::Validation(format!("unknown record kind: {other}"))),
        }
    }
}

/// Durable marker that a record was deleted.
///
/// Written for every deletion, whether or not the record ever reached
/// `synced`, and retained long enough to outlive any in-flight pull from
/// another device. Its presence means a pull must never recreate a local
/// row with the same `sync_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Identifier of the deleted record
    pub sync_id: SyncId,
    /// Document or attachment
    pub kind: RecordKind,
    /// Deletion timestamp (Unix ms)
    pub deleted_at: i64,
    /// Identity that owned the record
    pub owner_identity: String,
}

impl Tombstone {
    #[must_use]
    pub fn new(sync_id: SyncId, kind: RecordKind, owner_identity: impl Into<String>) -> Self {
        Self {
            sync_id,
            kind,
            deleted_at: chrono::Utc::now().timestamp_millis(),
            owner_identity: owner_identity.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_round_trips() {
        for kind in [RecordKind::Document, RecordKind::Attachment] {
            let parsed: RecordKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("folder".parse::<RecordKind>().is_err());
    }

    #[test]
    fn tombstone_captures_owner_and_time() {
        let id = SyncId::new();
        let tombstone = Tombstone::new(id, RecordKind::Document, "identity-1");
        assert_eq!(tombstone.sync_id, id);
        assert_eq!(tombstone.owner_identity, "identity-1");
        assert!(tombstone.deleted_at > 0);
    }
}
