//! Local store: documents, file attachments, and tombstones.
//!
//! All sync-state bookkeeping goes through here. Two rules are enforced at
//! this layer rather than trusted to callers: a tombstoned `sync_id` can
//! never be re-inserted, and a row in `pendingDeletion` admits no
//! transition other than removal.

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{Document, FileAttachment, RecordKind, SyncId, SyncState, Tombstone};

/// Async CRUD surface over the embedded database.
///
/// Cheap to clone; all clones share one connection. Single-row writes are
/// atomic, which together with the engine's per-`sync_id` locking is the
/// entire concurrency story at this layer.
#[derive(Clone)]
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    // -----------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------

    /// Insert a newly created local document.
    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        if self.has_tombstone(&doc.sync_id).await? {
            return Err(Error::Validation(format!(
                "sync id {} is tombstoned and cannot be reused",
                doc.sync_id
            )));
        }

        self.conn
            .execute(
                "INSERT INTO documents
                     (sync_id, title, category, notes, date, created_at, updated_at, sync_state)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    doc.sync_id.as_str(),
                    doc.title.clone(),
                    doc.category.clone(),
                    doc.notes.clone(),
                    doc.date.map(|d| d.to_string()),
                    doc.created_at,
                    doc.updated_at,
                    doc.sync_state.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    /// Get a document by sync id.
    pub async fn get_document(&self, id: &SyncId) -> Result<Option<Document>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, title, category, notes, date, created_at, updated_at, sync_state
                 FROM documents WHERE sync_id = ?",
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_document(&row)?)),
            None => Ok(None),
        }
    }

    /// List documents visible to the UI (excludes rows awaiting deletion),
    /// newest first.
    pub async fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, title, category, notes, date, created_at, updated_at, sync_state
                 FROM documents
                 WHERE sync_state != 'pendingDeletion'
                 ORDER BY updated_at DESC
                 LIMIT ? OFFSET ?",
                params![limit as i64, offset as i64],
            )
            .await?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(parse_document(&row)?);
        }
        Ok(documents)
    }

    /// List documents currently in the given state.
    pub async fn list_documents_in_state(&self, state: SyncState) -> Result<Vec<Document>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, title, category, notes, date, created_at, updated_at, sync_state
                 FROM documents WHERE sync_state = ? ORDER BY updated_at ASC",
                params![state.as_str()],
            )
            .await?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(parse_document(&row)?);
        }
        Ok(documents)
    }

    /// Update a document's user content fields.
    ///
    /// `updated_at` is guarded against rollback; the row must not be
    /// awaiting deletion.
    pub async fn update_document_content(&self, doc: &Document) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE documents
                 SET title = ?, category = ?, notes = ?, date = ?,
                     updated_at = MAX(updated_at, ?), sync_state = ?
                 WHERE sync_id = ? AND sync_state != 'pendingDeletion'",
                params![
                    doc.title.clone(),
                    doc.category.clone(),
                    doc.notes.clone(),
                    doc.date.map(|d| d.to_string()),
                    doc.updated_at,
                    doc.sync_state.as_str(),
                    doc.sync_id.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            return self.reject_missing_or_deleted(&doc.sync_id).await;
        }
        Ok(())
    }

    /// Transition a document's sync state.
    ///
    /// Marking `pendingDeletion` is allowed from every state; leaving it is
    /// not. `Err(Validation)` is returned for the forbidden revival.
    pub async fn set_document_state(&self, id: &SyncId, state: SyncState) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE documents SET sync_state = ?
                 WHERE sync_id = ? AND (sync_state != 'pendingDeletion' OR ? = 'pendingDeletion')",
                params![state.as_str(), id.as_str(), state.as_str()],
            )
            .await?;

        if rows == 0 {
            return self.reject_missing_or_deleted(id).await;
        }
        Ok(())
    }

    /// Transition a document's state only if it is still in `from`.
    ///
    /// Returns whether the row was updated. The upload job finishes through
    /// this: a row edited while its upload was in flight is no longer
    /// `uploading` and must keep the fresh mark.
    pub async fn transition_document_state(
        &self,
        id: &SyncId,
        from: SyncState,
        to: SyncState,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE documents SET sync_state = ?
                 WHERE sync_id = ? AND sync_state = ?",
                params![to.as_str(), id.as_str(), from.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    /// Overwrite a document from a remote record during a pull.
    ///
    /// The caller has already decided the remote copy wins; this write is
    /// guarded so a stale remote record can never roll `updated_at` back.
    pub async fn apply_remote_document(&self, doc: &Document) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO documents
                     (sync_id, title, category, notes, date, created_at, updated_at, sync_state)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'synced')
                 ON CONFLICT(sync_id) DO UPDATE SET
                     title = excluded.title,
                     category = excluded.category,
                     notes = excluded.notes,
                     date = excluded.date,
                     updated_at = excluded.updated_at,
                     sync_state = 'synced'
                 WHERE excluded.updated_at > documents.updated_at",
                params![
                    doc.sync_id.as_str(),
                    doc.title.clone(),
                    doc.category.clone(),
                    doc.notes.clone(),
                    doc.date.map(|d| d.to_string()),
                    doc.created_at,
                    doc.updated_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Remove a document row outright. Attachment rows cascade.
    ///
    /// Only the deletion job calls this, after the tombstone is durable.
    pub async fn remove_document_row(&self, id: &SyncId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM documents WHERE sync_id = ?",
                params![id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Rewrite a document's sync id and its attachments' back-references.
    ///
    /// Only used by the one-shot `DuplicateIdentifier` remediation; nothing
    /// else may ever change a sync id.
    pub async fn replace_document_id(&self, old: &SyncId, new: &SyncId) -> Result<()> {
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result: Result<()> = async {
            // The document row is renamed before its attachment rows are
            // repointed, so the FK check has to wait until commit.
            self.conn
                .execute("PRAGMA defer_foreign_keys = ON", ())
                .await?;
            self.conn
                .execute(
                    "UPDATE documents SET sync_id = ? WHERE sync_id = ?",
                    params![new.as_str(), old.as_str()],
                )
                .await?;
            self.conn
                .execute(
                    "UPDATE file_attachments SET document_sync_id = ? WHERE document_sync_id = ?",
                    params![new.as_str(), old.as_str()],
                )
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // File attachments
    // -----------------------------------------------------------------

    /// Insert attachment metadata. The parent document must exist and must
    /// not be tombstoned or awaiting deletion.
    pub async fn insert_attachment(&self, attachment: &FileAttachment) -> Result<()> {
        if self.has_tombstone(&attachment.sync_id).await? {
            return Err(Error::Validation(format!(
                "sync id {} is tombstoned and cannot be reused",
                attachment.sync_id
            )));
        }

        let parent = self
            .get_document(&attachment.document_sync_id)
            .await?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "attachment references missing document {}",
                    attachment.document_sync_id
                ))
            })?;
        if parent.sync_state.is_deletion() {
            return Err(Error::Validation(format!(
                "attachment references document {} awaiting deletion",
                attachment.document_sync_id
            )));
        }

        self.conn
            .execute(
                "INSERT INTO file_attachments
                     (sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                      blob_key, local_path, added_at, updated_at, sync_state)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    attachment.sync_id.as_str(),
                    attachment.document_sync_id.as_str(),
                    attachment.file_name.clone(),
                    attachment.label.clone(),
                    attachment.size_bytes,
                    attachment.content_type.clone(),
                    attachment.blob_key.clone(),
                    attachment.local_path.clone(),
                    attachment.added_at,
                    attachment.updated_at,
                    attachment.sync_state.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    /// Get an attachment by sync id.
    pub async fn get_attachment(&self, id: &SyncId) -> Result<Option<FileAttachment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                        blob_key, local_path, added_at, updated_at, sync_state
                 FROM file_attachments WHERE sync_id = ?",
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_attachment(&row)?)),
            None => Ok(None),
        }
    }

    /// List attachments for a document, oldest first (stable user ordering).
    pub async fn list_attachments_for(&self, document: &SyncId) -> Result<Vec<FileAttachment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                        blob_key, local_path, added_at, updated_at, sync_state
                 FROM file_attachments
                 WHERE document_sync_id = ? AND sync_state != 'pendingDeletion'
                 ORDER BY added_at ASC",
                params![document.as_str()],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(parse_attachment(&row)?);
        }
        Ok(attachments)
    }

    /// List every attachment row for a document, including rows awaiting
    /// deletion. Used by the deletion job, which must see stored blob keys
    /// for rows the UI no longer shows.
    pub async fn list_all_attachments_for(
        &self,
        document: &SyncId,
    ) -> Result<Vec<FileAttachment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                        blob_key, local_path, added_at, updated_at, sync_state
                 FROM file_attachments
                 WHERE document_sync_id = ?
                 ORDER BY added_at ASC",
                params![document.as_str()],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(parse_attachment(&row)?);
        }
        Ok(attachments)
    }

    /// List attachments in a given sync state, oldest change first.
    pub async fn list_attachments_in_state(
        &self,
        state: SyncState,
    ) -> Result<Vec<FileAttachment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                        blob_key, local_path, added_at, updated_at, sync_state
                 FROM file_attachments WHERE sync_state = ? ORDER BY updated_at ASC",
                params![state.as_str()],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(parse_attachment(&row)?);
        }
        Ok(attachments)
    }

    /// Update an attachment's label.
    ///
    /// Works for files attached in this session and for pre-existing ones
    /// alike; the write marks the row dirty so the edit is pushed.
    pub async fn update_attachment_label(&self, id: &SyncId, label: Option<&str>) -> Result<()> {
        let now = crate::util::unix_timestamp_ms();
        let rows = self
            .conn
            .execute(
                "UPDATE file_attachments
                 SET label = ?, updated_at = MAX(updated_at, ?),
                     sync_state = CASE sync_state WHEN 'synced' THEN 'pendingUpload'
                                                  ELSE sync_state END
                 WHERE sync_id = ? AND sync_state != 'pendingDeletion'",
                params![label.map(ToOwned::to_owned), now, id.as_str()],
            )
            .await?;

        if rows == 0 {
            return self.reject_missing_or_deleted(id).await;
        }
        Ok(())
    }

    /// Record the blob key returned by the blob store.
    ///
    /// Set-once: a different key for an already-keyed attachment is a bug
    /// (the stored key, not a recomputed path, is the only valid handle).
    pub async fn set_attachment_blob_key(&self, id: &SyncId, blob_key: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE file_attachments SET blob_key = ?
                 WHERE sync_id = ? AND (blob_key IS NULL OR blob_key = ?)",
                params![blob_key.to_owned(), id.as_str(), blob_key.to_owned()],
            )
            .await?;

        if rows == 0 {
            let existing = self.get_attachment(id).await?;
            return match existing {
                None => Err(Error::NotFound(id.to_string())),
                Some(attachment) => Err(Error::Validation(format!(
                    "attachment {} already has blob key {:?}; refusing to overwrite with {}",
                    id, attachment.blob_key, blob_key
                ))),
            };
        }
        Ok(())
    }

    /// Record where downloaded bytes were cached.
    pub async fn set_attachment_local_path(&self, id: &SyncId, local_path: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE file_attachments SET local_path = ?
                 WHERE sync_id = ? AND sync_state != 'pendingDeletion'",
                params![local_path.to_owned(), id.as_str()],
            )
            .await?;

        if rows == 0 {
            return self.reject_missing_or_deleted(id).await;
        }
        Ok(())
    }

    /// Transition an attachment's sync state (same rules as documents).
    pub async fn set_attachment_state(&self, id: &SyncId, state: SyncState) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE file_attachments SET sync_state = ?
                 WHERE sync_id = ? AND (sync_state != 'pendingDeletion' OR ? = 'pendingDeletion')",
                params![state.as_str(), id.as_str(), state.as_str()],
            )
            .await?;

        if rows == 0 {
            return self.reject_missing_or_deleted(id).await;
        }
        Ok(())
    }

    /// Mark an attachment `synced` only if it has not been touched since
    /// the given `updated_at` snapshot was read.
    ///
    /// Returns whether the row was updated; a row edited while its bytes
    /// were being pushed keeps the fresh mark.
    pub async fn mark_attachment_synced_if_unchanged(
        &self,
        id: &SyncId,
        observed_updated_at: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE file_attachments SET sync_state = 'synced'
                 WHERE sync_id = ? AND updated_at = ?
                   AND sync_state != 'pendingDeletion'",
                params![id.as_str(), observed_updated_at],
            )
            .await?;
        Ok(rows > 0)
    }

    /// Overwrite an attachment from a remote record during a pull.
    ///
    /// A locally cached copy of the bytes survives the metadata overwrite.
    pub async fn apply_remote_attachment(&self, attachment: &FileAttachment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO file_attachments
                     (sync_id, document_sync_id, file_name, label, size_bytes, content_type,
                      blob_key, local_path, added_at, updated_at, sync_state)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'synced')
                 ON CONFLICT(sync_id) DO UPDATE SET
                     document_sync_id = excluded.document_sync_id,
                     file_name = excluded.file_name,
                     label = excluded.label,
                     size_bytes = excluded.size_bytes,
                     content_type = excluded.content_type,
                     blob_key = COALESCE(excluded.blob_key, file_attachments.blob_key),
                     local_path = COALESCE(file_attachments.local_path, excluded.local_path),
                     updated_at = excluded.updated_at,
                     sync_state = 'synced'
                 WHERE excluded.updated_at > file_attachments.updated_at",
                params![
                    attachment.sync_id.as_str(),
                    attachment.document_sync_id.as_str(),
                    attachment.file_name.clone(),
                    attachment.label.clone(),
                    attachment.size_bytes,
                    attachment.content_type.clone(),
                    attachment.blob_key.clone(),
                    attachment.local_path.clone(),
                    attachment.added_at,
                    attachment.updated_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Remove an attachment row outright (deletion job only).
    pub async fn remove_attachment_row(&self, id: &SyncId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM file_attachments WHERE sync_id = ?",
                params![id.as_str()],
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tombstones
    // -----------------------------------------------------------------

    /// Record a tombstone. Idempotent.
    pub async fn insert_tombstone(&self, tombstone: &Tombstone) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tombstones (sync_id, kind, deleted_at, owner_identity)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(sync_id) DO NOTHING",
                params![
                    tombstone.sync_id.as_str(),
                    tombstone.kind.as_str(),
                    tombstone.deleted_at,
                    tombstone.owner_identity.clone()
                ],
            )
            .await?;
        Ok(())
    }

    /// Whether a tombstone exists for the given sync id.
    pub async fn has_tombstone(&self, id: &SyncId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM tombstones WHERE sync_id = ?)",
                params![id.as_str()],
            )
            .await?;

        Ok(match rows.next().await? {
            Some(row) => row.get::<i32>(0)? != 0,
            None => false,
        })
    }

    /// Fetch a tombstone by sync id.
    pub async fn get_tombstone(&self, id: &SyncId) -> Result<Option<Tombstone>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, kind, deleted_at, owner_identity
                 FROM tombstones WHERE sync_id = ?",
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_tombstone(&row)?)),
            None => Ok(None),
        }
    }

    /// List all tombstones.
    pub async fn list_tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, kind, deleted_at, owner_identity
                 FROM tombstones ORDER BY deleted_at ASC",
                (),
            )
            .await?;

        let mut tombstones = Vec::new();
        while let Some(row) = rows.next().await? {
            tombstones.push(parse_tombstone(&row)?);
        }
        Ok(tombstones)
    }

    /// Drop tombstones older than the cutoff. Retention policy is a
    /// deployment decision; nothing calls this automatically.
    pub async fn prune_tombstones(&self, older_than_ms: i64) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM tombstones WHERE deleted_at < ?",
                params![older_than_ms],
            )
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------

    async fn reject_missing_or_deleted(&self, id: &SyncId) -> Result<()> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM documents WHERE sync_id = ?
                 UNION ALL
                 SELECT 1 FROM file_attachments WHERE sync_id = ?",
                params![id.as_str(), id.as_str()],
            )
            .await?;

        if rows.next().await?.is_some() {
            Err(Error::Validation(format!(
                "record {id} is marked for deletion and cannot be modified"
            )))
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }
}

fn parse_document(row: &Row) -> Result<Document> {
    let sync_id: String = row.get(0)?;
    let date: Option<String> = row.get(4)?;
    let sync_state: String = row.get(7)?;

    Ok(Document {
        sync_id: sync_id
            .parse()
            .map_err(|_| Error::Validation(format!("invalid sync id in documents: {sync_id}")))?,
        title: row.get(1)?,
        category: row.get(2)?,
        notes: row.get(3)?,
        date: match date {
            Some(text) => Some(
                text.parse()
                    .map_err(|_| Error::Validation(format!("invalid date in documents: {text}")))?,
            ),
            None => None,
        },
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        sync_state: sync_state.parse()?,
    })
}

fn parse_attachment(row: &Row) -> Result<FileAttachment> {
    let sync_id: String = row.get(0)?;
    let document_sync_id: String = row.get(1)?;
    let sync_state: String = row.get(10)?;

    Ok(FileAttachment {
        sync_id: sync_id.parse().map_err(|_| {
            Error::Validation(format!("invalid sync id in file_attachments: {sync_id}"))
        })?,
        document_sync_id: document_sync_id.parse().map_err(|_| {
            Error::Validation(format!(
                "invalid document back-reference in file_attachments: {document_sync_id}"
            ))
        })?,
        file_name: row.get(2)?,
        label: row.get(3)?,
        size_bytes: row.get(4)?,
        content_type: row.get(5)?,
        blob_key: row.get(6)?,
        local_path: row.get(7)?,
        added_at: row.get(8)?,
        updated_at: row.get(9)?,
        sync_state: sync_state.parse()?,
    })
}

fn parse_tombstone(row: &Row) -> Result<Tombstone> {
    let sync_id: String = row.get(0)?;
    let kind: String = row.get(1)?;

    Ok(Tombstone {
        sync_id: sync_id
            .parse()
            .map_err(|_| Error::Validation(format!("invalid sync id in tombstones: {sync_id}")))?,
        kind: kind.parse()?,
        deleted_at: row.get(2)?,
        owner_identity: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    async fn setup() -> LocalStore {
        let db = Database::open_in_memory().await.unwrap();
        LocalStore::new(db.connection())
    }

    fn sample_document() -> Document {
        let mut doc = Document::new("Car insurance").unwrap();
        doc.category = Some("insurance".to_string());
        doc.notes = Some("renew early".to_string());
        doc.date = Some("2026-11-01".parse().unwrap());
        doc
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn document_roundtrip_preserves_all_fields() {
        let store = setup().await;
        let doc = sample_document();

        store.insert_document(&doc).await.unwrap();
        let fetched = store.get_document(&doc.sync_id).await.unwrap().unwrap();
        assert_eq!(fetched, doc);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstoned_id_cannot_be_reinserted() {
        let store = setup().await;
        let doc = sample_document();

        store
            .insert_tombstone(&Tombstone::new(
                doc.sync_id,
                RecordKind::Document,
                "identity-1",
            ))
            .await
            .unwrap();

        let err = store.insert_document(&doc).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_deletion_is_terminal() {
        let store = setup().await;
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();

        store
            .set_document_state(&doc.sync_id, SyncState::PendingDeletion)
            .await
            .unwrap();

        // Attempting to revive the row is rejected, not silently ignored.
        let err = store
            .set_document_state(&doc.sync_id, SyncState::Synced)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Re-marking for deletion stays idempotent.
        store
            .set_document_state(&doc.sync_id, SyncState::PendingDeletion)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_hides_rows_awaiting_deletion() {
        let store = setup().await;
        let keep = sample_document();
        let drop = Document::new("Old lease").unwrap();
        store.insert_document(&keep).await.unwrap();
        store.insert_document(&drop).await.unwrap();

        store
            .set_document_state(&drop.sync_id, SyncState::PendingDeletion)
            .await
            .unwrap();

        let listed = store.list_documents(10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sync_id, keep.sync_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attachment_requires_live_parent() {
        let store = setup().await;
        let orphan = FileAttachment::new(
            SyncId::new(),
            "scan.pdf",
            "application/pdf",
            10,
            "/tmp/scan.pdf",
        )
        .unwrap();
        assert!(matches!(
            store.insert_attachment(&orphan).await.unwrap_err(),
            Error::Validation(_)
        ));

        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        store
            .set_document_state(&doc.sync_id, SyncState::PendingDeletion)
            .await
            .unwrap();

        let late = FileAttachment::new(
            doc.sync_id,
            "scan.pdf",
            "application/pdf",
            10,
            "/tmp/scan.pdf",
        )
        .unwrap();
        assert!(matches!(
            store.insert_attachment(&late).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn label_edit_survives_store_reload() {
        // Regression for the dropped-update defect: editing the label of a
        // pre-existing, already-synced attachment must persist.
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("vault.db");

        let doc = sample_document();
        let mut attachment = FileAttachment::new(
            doc.sync_id,
            "invoice.pdf",
            "application/pdf",
            42,
            "/tmp/invoice.pdf",
        )
        .unwrap();
        attachment.label = Some("Invoice".to_string());

        {
            let db = Database::open(&path).await.unwrap();
            let store = LocalStore::new(db.connection());
            store.insert_document(&doc).await.unwrap();
            store.insert_attachment(&attachment).await.unwrap();
            store
                .set_attachment_state(&attachment.sync_id, SyncState::Synced)
                .await
                .unwrap();

            store
                .update_attachment_label(&attachment.sync_id, Some("Receipt"))
                .await
                .unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        let store = LocalStore::new(db.connection());
        let reloaded = store
            .get_attachment(&attachment.sync_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.label.as_deref(), Some("Receipt"));
        // The edit is dirty again so it will be pushed.
        assert_eq!(reloaded.sync_state, SyncState::PendingUpload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blob_key_is_set_once() {
        let store = setup().await;
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let attachment = FileAttachment::new(
            doc.sync_id,
            "scan.png",
            "image/png",
            7,
            "/tmp/scan.png",
        )
        .unwrap();
        store.insert_attachment(&attachment).await.unwrap();

        store
            .set_attachment_blob_key(&attachment.sync_id, "scope/id/documents/x/1-scan.png")
            .await
            .unwrap();
        // Same key again is an idempotent no-op.
        store
            .set_attachment_blob_key(&attachment.sync_id, "scope/id/documents/x/1-scan.png")
            .await
            .unwrap();
        // A different key is refused.
        let err = store
            .set_attachment_blob_key(&attachment.sync_id, "scope/id/documents/x/2-scan.png")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_remote_ignores_stale_records() {
        let store = setup().await;
        let mut doc = sample_document();
        doc.updated_at = 150;
        store.insert_document(&doc).await.unwrap();

        let mut stale = doc.clone();
        stale.title = "Older remote copy".to_string();
        stale.updated_at = 140;
        store.apply_remote_document(&stale).await.unwrap();

        let kept = store.get_document(&doc.sync_id).await.unwrap().unwrap();
        assert_eq!(kept.title, "Car insurance");
        assert_eq!(kept.updated_at, 150);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_remote_keeps_cached_local_path() {
        let store = setup().await;
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let mut attachment = FileAttachment::new(
            doc.sync_id,
            "scan.png",
            "image/png",
            7,
            "/cache/scan.png",
        )
        .unwrap();
        attachment.updated_at = 100;
        store.insert_attachment(&attachment).await.unwrap();

        let mut remote = attachment.clone();
        remote.label = Some("Scan".to_string());
        remote.local_path = None;
        remote.updated_at = 200;
        store.apply_remote_attachment(&remote).await.unwrap();

        let merged = store
            .get_attachment(&attachment.sync_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.label.as_deref(), Some("Scan"));
        assert_eq!(merged.local_path.as_deref(), Some("/cache/scan.png"));
        assert_eq!(merged.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replace_document_id_rewrites_back_references() {
        let store = setup().await;
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let attachment = FileAttachment::new(
            doc.sync_id,
            "scan.png",
            "image/png",
            7,
            "/tmp/scan.png",
        )
        .unwrap();
        store.insert_attachment(&attachment).await.unwrap();

        let fresh = SyncId::new();
        store.replace_document_id(&doc.sync_id, &fresh).await.unwrap();

        assert!(store.get_document(&doc.sync_id).await.unwrap().is_none());
        assert!(store.get_document(&fresh).await.unwrap().is_some());
        let moved = store
            .get_attachment(&attachment.sync_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.document_sync_id, fresh);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prune_tombstones_respects_cutoff() {
        let store = setup().await;
        let mut old = Tombstone::new(SyncId::new(), RecordKind::Document, "identity-1");
        old.deleted_at = 1_000;
        let recent = Tombstone::new(SyncId::new(), RecordKind::Document, "identity-1");

        store.insert_tombstone(&old).await.unwrap();
        store.insert_tombstone(&recent).await.unwrap();

        let removed = store.prune_tombstones(2_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.has_tombstone(&recent.sync_id).await.unwrap());
        assert!(!store.has_tombstone(&old.sync_id).await.unwrap());
    }
}
