//! Two-phase deletion.
//!
//! Phase one is synchronous: the record (and, for documents, every attached
//! file) is marked `pendingDeletion`, queued uploads for it are dropped,
//! and a delete job is enqueued. The UI stops showing the record
//! immediately. Phase two runs from the queue: remote metadata, remote
//! blobs, then tombstones on both sides, and only then the local rows.
//! A record in `pendingDeletion` never goes back to any other state; if
//! phase two fails hard, the record stays marked and the job retries.

use std::str::FromStr;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::models::{FileAttachment, RecordKind, SyncId, SyncState, Tombstone};
use crate::remote::{BlobStore, MetadataStore};
use crate::sync::queue::{OfflineQueue, QueueOperation};

/// Coordinates local marking and remote teardown for deletions.
///
/// Marking is a purely local operation; the remote clients are only needed
/// when a queued delete job actually runs.
#[derive(Clone)]
pub struct DeletionTracker {
    store: LocalStore,
    queue: OfflineQueue,
}

impl DeletionTracker {
    #[must_use]
    pub const fn new(store: LocalStore, queue: OfflineQueue) -> Self {
        Self { store, queue }
    }

    /// Mark a document and all of its attachments for deletion and enqueue
    /// the remote teardown. Idempotent: re-marking an already-marked
    /// document only ensures the delete job is queued.
    pub async fn mark_document_deleted(&self, id: &SyncId) -> Result<()> {
        let doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {id} does not exist")))?;

        if doc.sync_state != SyncState::PendingDeletion {
            self.store
                .set_document_state(id, SyncState::PendingDeletion)
                .await?;
        }
        for attachment in self.store.list_all_attachments_for(id).await? {
            if attachment.sync_state != SyncState::PendingDeletion {
                self.store
                    .set_attachment_state(&attachment.sync_id, SyncState::PendingDeletion)
                    .await?;
            }
        }

        // A deletion supersedes any queued upload for the same record.
        self.queue.remove_all_for(&id.as_str()).await?;
        self.queue
            .enqueue(&id.as_str(), QueueOperation::Delete)
            .await?;
        tracing::debug!(sync_id = %id, "document marked for deletion");
        Ok(())
    }

    /// Mark a single attachment for deletion and enqueue its teardown. The
    /// parent document is untouched.
    pub async fn mark_attachment_deleted(&self, id: &SyncId) -> Result<()> {
        let attachment = self
            .store
            .get_attachment(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment {id} does not exist")))?;

        if attachment.sync_state != SyncState::PendingDeletion {
            self.store
                .set_attachment_state(id, SyncState::PendingDeletion)
                .await?;
        }
        self.queue.remove_all_for(&id.as_str()).await?;
        self.queue
            .enqueue(&id.as_str(), QueueOperation::Delete)
            .await?;
        Ok(())
    }

    /// Execute a queued delete job.
    ///
    /// Remote teardown order is fixed: metadata record, blob objects (per
    /// their stored keys, never recomputed), remote tombstone, local
    /// tombstone, local row removal. `NotFound` from the remote side is
    /// success at every step, which makes the job safe to re-run after a
    /// partial failure and correct for records deleted before their first
    /// upload.
    pub async fn run(
        &self,
        identity: &Identity,
        metadata: &dyn MetadataStore,
        blobs: &dyn BlobStore,
        sync_id: &str,
    ) -> Result<()> {
        let id = SyncId::from_str(sync_id)
            .map_err(|_| Error::Validation(format!("malformed sync id in queue: {sync_id}")))?;

        if let Some(doc) = self.store.get_document(&id).await? {
            if doc.sync_state != SyncState::PendingDeletion {
                // Superseded job; the row was never marked.
                return Ok(());
            }
            return self.delete_document(identity, metadata, blobs, &id).await;
        }

        if let Some(attachment) = self.store.get_attachment(&id).await? {
            if attachment.sync_state != SyncState::PendingDeletion {
                return Ok(());
            }
            return self.delete_attachment(identity, metadata, blobs, &attachment).await;
        }

        // Local rows are gone. If a tombstone remains, the job was re-issued
        // because a pull saw the record alive remotely; tear down the remote
        // copy without touching local state. Otherwise a previous run
        // already finished.
        if let Some(tombstone) = self.store.get_tombstone(&id).await? {
            return self
                .reissue_remote_teardown(identity, metadata, blobs, &tombstone)
                .await;
        }
        Ok(())
    }

    async fn reissue_remote_teardown(
        &self,
        identity: &Identity,
        metadata: &dyn MetadataStore,
        blobs: &dyn BlobStore,
        tombstone: &Tombstone,
    ) -> Result<()> {
        match tombstone.kind {
            RecordKind::Document => {
                // Remote attachment records carry the stored blob keys.
                for attachment in metadata
                    .list_attachments(identity, &tombstone.sync_id)
                    .await?
                {
                    self.teardown_attachment_remote(identity, metadata, blobs, &attachment)
                        .await?;
                    metadata
                        .put_tombstone(
                            identity,
                            &Tombstone::new(
                                attachment.sync_id,
                                RecordKind::Attachment,
                                identity.as_str(),
                            ),
                        )
                        .await?;
                }
                tolerate_not_found(
                    metadata
                        .delete_document(identity, &tombstone.sync_id)
                        .await,
                )?;
            }
            RecordKind::Attachment => {
                tolerate_not_found(
                    metadata
                        .delete_attachment(identity, &tombstone.sync_id)
                        .await,
                )?;
            }
        }
        metadata.put_tombstone(identity, tombstone).await?;
        tracing::warn!(sync_id = %tombstone.sync_id, "re-issued remote deletion for tombstoned record");
        Ok(())
    }

    async fn delete_document(
        &self,
        identity: &Identity,
        metadata: &dyn MetadataStore,
        blobs: &dyn BlobStore,
        id: &SyncId,
    ) -> Result<()> {
        let attachments = self.store.list_all_attachments_for(id).await?;

        tolerate_not_found(metadata.delete_document(identity, id).await)?;
        for attachment in &attachments {
            self.teardown_attachment_remote(identity, metadata, blobs, attachment)
                .await?;
        }

        metadata
            .put_tombstone(
                identity,
                &Tombstone::new(*id, RecordKind::Document, identity.as_str()),
            )
            .await?;
        for attachment in &attachments {
            metadata
                .put_tombstone(
                    identity,
                    &Tombstone::new(
                        attachment.sync_id,
                        RecordKind::Attachment,
                        identity.as_str(),
                    ),
                )
                .await?;
        }

        self.store
            .insert_tombstone(&Tombstone::new(
                *id,
                RecordKind::Document,
                identity.as_str(),
            ))
            .await?;
        for attachment in &attachments {
            self.store
                .insert_tombstone(&Tombstone::new(
                    attachment.sync_id,
                    RecordKind::Attachment,
                    identity.as_str(),
                ))
                .await?;
        }

        // Cascades to the attachment rows.
        self.store.remove_document_row(id).await?;
        tracing::info!(sync_id = %id, attachments = attachments.len(), "document deleted");
        Ok(())
    }

    async fn delete_attachment(
        &self,
        identity: &Identity,
        metadata: &dyn MetadataStore,
        blobs: &dyn BlobStore,
        attachment: &FileAttachment,
    ) -> Result<()> {
        self.teardown_attachment_remote(identity, metadata, blobs, attachment)
            .await?;

        metadata
            .put_tombstone(
                identity,
                &Tombstone::new(
                    attachment.sync_id,
                    RecordKind::Attachment,
                    identity.as_str(),
                ),
            )
            .await?;
        self.store
            .insert_tombstone(&Tombstone::new(
                attachment.sync_id,
                RecordKind::Attachment,
                identity.as_str(),
            ))
            .await?;
        self.store.remove_attachment_row(&attachment.sync_id).await?;
        tracing::info!(sync_id = %attachment.sync_id, "attachment deleted");
        Ok(())
    }

    async fn teardown_attachment_remote(
        &self,
        identity: &Identity,
        metadata: &dyn MetadataStore,
        blobs: &dyn BlobStore,
        attachment: &FileAttachment,
    ) -> Result<()> {
        tolerate_not_found(
            metadata
                .delete_attachment(identity, &attachment.sync_id)
                .await,
        )?;
        // Only the stored key identifies the object; an attachment that
        // never finished a blob write has nothing to tear down.
        if let Some(key) = attachment.blob_key.as_deref() {
            tolerate_not_found(blobs.delete(key).await)?;
        }
        Ok(())
    }
}

fn tolerate_not_found(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(Error::NotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_counts_as_success() {
        assert!(tolerate_not_found(Ok(())).is_ok());
        assert!(tolerate_not_found(Err(Error::NotFound("gone".to_string()))).is_ok());
        assert!(tolerate_not_found(Err(Error::Network("reset".to_string()))).is_err());
    }
}
