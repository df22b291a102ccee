//! File attachment model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::document::SyncId;
use super::sync_state::SyncState;

/// Metadata for a file attached to a document.
///
/// `blob_key` is the exact key returned by the blob store at upload time.
/// Once set it is the only valid handle for download and delete; it is
/// never recomputed from local metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    /// Unique attachment identifier, independent of the parent document's
    pub sync_id: SyncId,
    /// Explicit back-reference to the owning document
    pub document_sync_id: SyncId,
    /// Original file name
    pub file_name: String,
    /// Optional user annotation; edits must survive store reload
    pub label: Option<String>,
    /// Size in bytes captured at upload time
    pub size_bytes: i64,
    /// Content MIME type captured at upload time
    pub content_type: String,
    /// Remote object key, set exactly once after a successful blob write
    pub blob_key: Option<String>,
    /// Path to cached bytes on device, absent until downloaded
    pub local_path: Option<String>,
    /// Creation timestamp (Unix ms)
    pub added_at: i64,
    /// Last mutation timestamp (Unix ms)
    pub updated_at: i64,
    /// Synchronization state
    pub sync_state: SyncState,
}

impl FileAttachment {
    /// Create attachment metadata for a local file awaiting upload.
    pub fn new(
        document_sync_id: SyncId,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: i64,
        local_path: impl Into<String>,
    ) -> Result<Self> {
        let file_name = file_name.into().trim().to_string();
        let content_type = content_type.into().trim().to_string();
        let local_path = local_path.into().trim().to_string();

        if file_name.is_empty() {
            return Err(Error::Validation(
                "Attachment file_name cannot be empty".to_string(),
            ));
        }
        if content_type.is_empty() {
            return Err(Error::Validation(
                "Attachment content_type cannot be empty".to_string(),
            ));
        }
        if local_path.is_empty() {
            return Err(Error::Validation(
                "Attachment local_path cannot be empty".to_string(),
            ));
        }
        if size_bytes < 0 {
            return Err(Error::Validation(
                "Attachment size_bytes cannot be negative".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            sync_id: SyncId::new(),
            document_sync_id,
            file_name,
            label: None,
            size_bytes,
            content_type,
            blob_key: None,
            local_path: Some(local_path),
            added_at: now,
            updated_at: now,
            sync_state: SyncState::Local,
        })
    }

    /// Whether the attachment's bytes still need a blob write.
    #[must_use]
    pub const fn needs_blob_upload(&self) -> bool {
        self.blob_key.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_new() {
        let attachment = FileAttachment::new(
            SyncId::new(),
            "invoice.pdf",
            "application/pdf",
            1234,
            "/tmp/invoice.pdf",
        )
        .unwrap();

        assert_eq!(attachment.file_name, "invoice.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.size_bytes, 1234);
        assert_eq!(attachment.blob_key, None);
        assert!(attachment.needs_blob_upload());
        assert_eq!(attachment.sync_state, SyncState::Local);
    }

    #[test]
    fn test_attachment_id_independent_of_document() {
        let document_id = SyncId::new();
        let attachment = FileAttachment::new(
            document_id,
            "invoice.pdf",
            "application/pdf",
            1,
            "/tmp/invoice.pdf",
        )
        .unwrap();
        assert_ne!(attachment.sync_id, document_id);
        assert_eq!(attachment.document_sync_id, document_id);
    }

    #[test]
    fn test_attachment_validation() {
        let doc = SyncId::new();

        assert!(FileAttachment::new(doc, "", "application/pdf", 1, "/tmp/f").is_err());
        assert!(FileAttachment::new(doc, "f", "", 1, "/tmp/f").is_err());
        assert!(FileAttachment::new(doc, "f", "application/pdf", 1, "").is_err());
        assert!(FileAttachment::new(doc, "f", "application/pdf", -1, "/tmp/f").is_err());
    }
}
