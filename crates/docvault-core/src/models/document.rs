//! Document model

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::sync_state::SyncState;

/// Globally unique, reinstall-durable record identifier, using UUID v7
/// (time-sortable).
///
/// Assigned once at creation and never regenerated for the life of the
/// record; it is the sole reconciliation key between local and remote
/// stores. Never infer anything from its textual shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncId(Uuid);

impl SyncId {
    /// Create a new unique sync ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A personal document: user metadata plus a list of attached files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier, immutable after creation
    pub sync_id: SyncId,
    /// User-facing title
    pub title: String,
    /// Free-form category
    pub category: Option<String>,
    /// Free-form notes
    pub notes: Option<String>,
    /// Optional user date (e.g. renewal date); never drives sync decisions
    pub date: Option<NaiveDate>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last mutation timestamp (Unix ms), monotonically increasing
    pub updated_at: i64,
    /// Synchronization state
    #[serde(default = "default_state")]
    pub sync_state: SyncState,
}

const fn default_state() -> SyncState {
    SyncState::Local
}

impl Document {
    /// Create a new local document with the given title.
    pub fn new(title: impl Into<String>) -> Result<Self> {
        let title = title.into().trim().to_string();
        if title.is_empty() {
            return Err(Error::Validation(
                "Document title cannot be empty".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            sync_id: SyncId::new(),
            title,
            category: None,
            notes: None,
            date: None,
            created_at: now,
            updated_at: now,
            sync_state: SyncState::Local,
        })
    }

    /// Bump `updated_at`, refusing ever to roll it back.
    pub fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.updated_at = self.updated_at.max(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_id_unique() {
        let id1 = SyncId::new();
        let id2 = SyncId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_sync_id_parse() {
        let id = SyncId::new();
        let parsed: SyncId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_sync_id_ordering_matches_string_form() {
        // The conflict resolver tie-break relies on this agreement.
        let a = SyncId::new();
        let b = SyncId::new();
        assert_eq!(a < b, a.as_str() < b.as_str());
    }

    #[test]
    fn test_document_new() {
        let doc = Document::new("Passport").unwrap();
        assert_eq!(doc.title, "Passport");
        assert_eq!(doc.sync_state, SyncState::Local);
        assert!(doc.created_at > 0);
        assert_eq!(doc.created_at, doc.updated_at);
    }

    #[test]
    fn test_document_rejects_empty_title() {
        assert!(Document::new("   ").is_err());
    }

    #[test]
    fn test_touch_never_rolls_back() {
        let mut doc = Document::new("Passport").unwrap();
        doc.updated_at = i64::MAX - 1;
        doc.touch();
        assert_eq!(doc.updated_at, i64::MAX - 1);
    }
}
