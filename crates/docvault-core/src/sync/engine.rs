//! The synchronization engine.
//!
//! One engine instance per process, holding injected dependencies: local
//! store, offline queue, metadata client, blob client, identity resolver.
//! Nothing here is reachable through ambient globals.
//!
//! A sync pass drains the offline queue with a bounded worker pool. Each
//! record has at most one in-flight mutating operation at a time, enforced
//! by a per-`sync_id` lock; two concurrent uploads of the same record are
//! how duplicate-identifier collisions happen. Cancellation takes effect at
//! job boundaries: running jobs finish their current consistent step,
//! nothing new starts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityResolver};
use crate::models::{Document, SyncId, SyncState};
use crate::remote::{BlobStore, MetadataStore};
use crate::sync::conflict::{self, Winner};
use crate::sync::deletion::DeletionTracker;
use crate::sync::queue::{
    OfflineQueue, QueueJob, QueueOperation, RetryDecision, PULL_KEY,
};
use crate::sync::{DownloadPolicy, SyncOptions, SyncStatus, SyncSummary};
use crate::util::unix_timestamp_ms;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Read-only consistency report produced by [`SyncEngine::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Locally `synced` documents examined.
    pub checked: usize,
    /// Locally `synced` documents absent from the remote listing.
    pub missing_remote: Vec<String>,
    /// Locally `synced` documents the remote has a newer copy of.
    pub stale_local: Vec<String>,
    /// `synced` attachments with no stored blob key.
    pub attachments_missing_blob_key: Vec<String>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing_remote.is_empty()
            && self.stale_local.is_empty()
            && self.attachments_missing_blob_key.is_empty()
    }
}

enum JobOutcome {
    Uploaded,
    Deleted,
    Pulled(usize),
    Skipped,
    Deferred,
    Failed,
    AuthRequired(String),
}

pub struct SyncEngine {
    store: LocalStore,
    queue: OfflineQueue,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityResolver>,
    deletions: DeletionTracker,
    options: SyncOptions,
    online: AtomicBool,
    cancelled: AtomicBool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status_tx: broadcast::Sender<SyncStatus>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: LocalStore,
        queue: OfflineQueue,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityResolver>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let deletions = DeletionTracker::new(store.clone(), queue.clone());
        Arc::new(Self {
            store,
            queue,
            metadata,
            blobs,
            identity,
            deletions,
            options,
            online: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
            status_tx,
        })
    }

    /// Per-record status events. Every subscriber sees every event emitted
    /// after it subscribed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Feed the connectivity signal. The engine never probes the network
    /// itself; callers run [`Self::sync_pass`] when connectivity returns,
    /// on foreground, and on a periodic timer.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Stop the current pass at the next job boundary (sign-out, explicit
    /// user cancellation). Queued jobs stay queued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Collaborator surface
    // -----------------------------------------------------------------

    /// Mark a document dirty and queue its upload.
    pub async fn enqueue_upload(&self, id: &SyncId) -> Result<()> {
        let doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {id} does not exist")))?;

        match doc.sync_state {
            SyncState::PendingDeletion => Err(Error::Validation(format!(
                "document {id} is marked for deletion and cannot be uploaded"
            ))),
            SyncState::Local
            | SyncState::PendingUpload
            | SyncState::Uploading
            | SyncState::Synced
            | SyncState::PendingDownload
            | SyncState::Downloading
            | SyncState::Conflict
            | SyncState::Error => {
                self.store
                    .set_document_state(id, SyncState::PendingUpload)
                    .await?;
                self.queue
                    .enqueue(&id.as_str(), QueueOperation::Upload)
                    .await?;
                self.emit(&id.as_str(), SyncState::PendingUpload, None);
                Ok(())
            }
        }
    }

    /// Mark a document (and its attachments) deleted and queue the remote
    /// teardown. The marking is synchronous; the record disappears from
    /// listings before this returns.
    pub async fn enqueue_deletion(&self, id: &SyncId) -> Result<()> {
        self.deletions.mark_document_deleted(id).await?;
        self.emit(&id.as_str(), SyncState::PendingDeletion, None);
        Ok(())
    }

    /// Delete a single attachment without touching its parent document.
    pub async fn enqueue_attachment_deletion(&self, id: &SyncId) -> Result<()> {
        self.deletions.mark_attachment_deleted(id).await?;
        self.emit(&id.as_str(), SyncState::PendingDeletion, None);
        Ok(())
    }

    /// Queue an account-wide pull. Coalesces with an already-queued pull.
    pub async fn trigger_pull(&self) -> Result<()> {
        self.queue.enqueue(PULL_KEY, QueueOperation::Pull).await?;
        Ok(())
    }

    /// Move a record out of `error` after a user-initiated retry.
    pub async fn retry(&self, id: &SyncId) -> Result<()> {
        if let Some(doc) = self.store.get_document(id).await? {
            if doc.sync_state != SyncState::Error {
                return Err(Error::Validation(format!(
                    "document {id} is not in the error state"
                )));
            }
            let target = doc.sync_state.retry_target();
            self.store.set_document_state(id, target).await?;
            self.queue
                .enqueue(&id.as_str(), QueueOperation::Upload)
                .await?;
            self.emit(&id.as_str(), target, None);
            return Ok(());
        }

        let attachment = self
            .store
            .get_attachment(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("record {id} does not exist")))?;
        if attachment.sync_state != SyncState::Error {
            return Err(Error::Validation(format!(
                "attachment {id} is not in the error state"
            )));
        }
        let target = if attachment.blob_key.is_some() && attachment.local_path.is_none() {
            SyncState::PendingDownload
        } else {
            SyncState::PendingUpload
        };
        self.store.set_attachment_state(id, target).await?;
        // Attachments travel with their parent document's upload job.
        self.queue
            .enqueue(&attachment.document_sync_id.as_str(), QueueOperation::Upload)
            .await?;
        self.emit(&id.as_str(), target, None);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sync pass
    // -----------------------------------------------------------------

    /// Drain the offline queue once.
    ///
    /// Offline, the queue is left intact and the summary reports deferred
    /// work. `AuthRequired` from any job pauses the whole pass; everything
    /// still queued runs after re-authentication. Each due job is
    /// attempted at most once per pass; failed jobs come back on their
    /// backoff schedule in a later pass.
    pub async fn sync_pass(self: &Arc<Self>) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        if !self.is_online() {
            summary.deferred =
                usize::try_from(self.queue.pending_count().await?).unwrap_or(usize::MAX);
            tracing::debug!(deferred = summary.deferred, "offline; sync pass skipped");
            return Ok(summary);
        }

        self.cancelled.store(false, Ordering::SeqCst);
        let identity = self.identity.resolve().await?;
        self.requeue_stranded_deletions().await?;

        let mut seen: HashSet<(String, QueueOperation)> = HashSet::new();
        loop {
            if self.is_cancelled() {
                tracing::info!("sync pass cancelled");
                break;
            }

            let due = self
                .queue
                .due_jobs(unix_timestamp_ms(), self.options.batch_size.max(1))
                .await?;
            let batch: Vec<QueueJob> = due
                .into_iter()
                .filter(|job| seen.insert((job.sync_id.clone(), job.operation)))
                .collect();
            if batch.is_empty() {
                break;
            }

            let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
            let mut workers = JoinSet::new();
            for job in batch {
                let engine = Arc::clone(self);
                let identity = identity.clone();
                let semaphore = Arc::clone(&semaphore);
                workers.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    engine.process_job(&identity, job).await
                });
            }

            let mut auth_error = None;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => match outcome {
                        JobOutcome::Uploaded => summary.uploaded += 1,
                        JobOutcome::Deleted => summary.deleted += 1,
                        JobOutcome::Pulled(count) => summary.pulled += count,
                        JobOutcome::Skipped => {}
                        JobOutcome::Deferred => summary.deferred += 1,
                        JobOutcome::Failed => summary.failed += 1,
                        JobOutcome::AuthRequired(message) => auth_error = Some(message),
                    },
                    Ok(Err(error)) => return Err(error),
                    Err(join_error) => {
                        tracing::error!(%join_error, "sync worker panicked");
                        summary.failed += 1;
                    }
                }
            }

            if let Some(message) = auth_error {
                // Session went bad mid-pass; drop the cached identity so
                // the next pass re-resolves, and leave the rest queued.
                self.identity.invalidate().await;
                return Err(Error::AuthRequired(message));
            }
        }

        tracing::info!(
            uploaded = summary.uploaded,
            deleted = summary.deleted,
            pulled = summary.pulled,
            failed = summary.failed,
            deferred = summary.deferred,
            "sync pass finished"
        );
        Ok(summary)
    }

    /// Check every locally `synced` document against the remote listing
    /// without writing anything.
    pub async fn verify(&self) -> Result<VerifyReport> {
        let identity = self.identity.resolve().await?;
        let remote: HashMap<String, Document> = self
            .metadata
            .list_documents(&identity)
            .await?
            .into_iter()
            .map(|doc| (doc.sync_id.as_str(), doc))
            .collect();

        let mut report = VerifyReport::default();
        for local in self.store.list_documents_in_state(SyncState::Synced).await? {
            report.checked += 1;
            match remote.get(&local.sync_id.as_str()) {
                None => report.missing_remote.push(local.sync_id.as_str()),
                Some(remote_doc) if remote_doc.updated_at > local.updated_at => {
                    report.stale_local.push(local.sync_id.as_str());
                }
                Some(_) => {}
            }

            for attachment in self.store.list_attachments_for(&local.sync_id).await? {
                if attachment.sync_state == SyncState::Synced && attachment.blob_key.is_none() {
                    report
                        .attachments_missing_blob_key
                        .push(attachment.sync_id.as_str());
                }
            }
        }
        Ok(report)
    }

    /// Fetch an attachment's bytes into the cache directory. Used directly
    /// for lazy downloads and by the pull pass under the eager policy.
    pub async fn download_attachment(&self, id: &SyncId) -> Result<PathBuf> {
        let cache_dir = self.options.cache_dir.clone().ok_or_else(|| {
            Error::Validation("no cache directory configured for downloads".to_string())
        })?;

        let lock = self.record_lock(&id.as_str()).await;
        let _guard = lock.lock().await;

        let attachment = self
            .store
            .get_attachment(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment {id} does not exist")))?;
        if let Some(path) = &attachment.local_path {
            return Ok(PathBuf::from(path));
        }
        let Some(key) = attachment.blob_key.as_deref() else {
            return Err(Error::Validation(format!(
                "attachment {id} has no stored blob key to download from"
            )));
        };

        self.store
            .set_attachment_state(id, SyncState::Downloading)
            .await?;
        self.emit(&id.as_str(), SyncState::Downloading, None);

        match self.blobs.get(key).await {
            Ok(bytes) => {
                tokio::fs::create_dir_all(&cache_dir).await?;
                let path = cache_dir.join(format!("{id}-{}", attachment.file_name));
                tokio::fs::write(&path, &bytes).await?;
                self.store
                    .set_attachment_local_path(id, &path.to_string_lossy())
                    .await?;
                self.store
                    .set_attachment_state(id, SyncState::Synced)
                    .await?;
                self.emit(&id.as_str(), SyncState::Synced, None);
                Ok(path)
            }
            Err(error) => {
                if let Err(restore) = self
                    .store
                    .set_attachment_state(id, SyncState::PendingDownload)
                    .await
                {
                    tracing::warn!(sync_id = %id, %restore, "failed to restore download state");
                }
                self.emit(
                    &id.as_str(),
                    SyncState::PendingDownload,
                    Some(error.to_string()),
                );
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------
    // Job processing
    // -----------------------------------------------------------------

    async fn process_job(&self, identity: &Identity, job: QueueJob) -> Result<JobOutcome> {
        if self.is_cancelled() {
            return Ok(JobOutcome::Deferred);
        }

        let result = match job.operation {
            QueueOperation::Upload => self.run_upload(identity, &job).await,
            QueueOperation::Delete => {
                let lock = self.record_lock(&job.sync_id).await;
                let _guard = lock.lock().await;
                self.deletions
                    .run(identity, &*self.metadata, &*self.blobs, &job.sync_id)
                    .await
                    .map(|()| JobOutcome::Deleted)
            }
            QueueOperation::Pull => self.run_pull(identity).await.map(JobOutcome::Pulled),
        };

        match result {
            Ok(outcome) => {
                self.queue.complete(&job).await?;
                Ok(outcome)
            }
            // Leave the job queued; the pass pauses until re-auth.
            Err(Error::AuthRequired(message)) => Ok(JobOutcome::AuthRequired(message)),
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    sync_id = %job.sync_id,
                    operation = job.operation.as_str(),
                    %error,
                    "job failed; scheduling retry"
                );
                let decision = self
                    .queue
                    .reschedule(&job, &error.to_string(), &self.options.retry)
                    .await?;
                if decision == RetryDecision::Exhausted {
                    self.park_record(&job, &error.to_string()).await;
                }
                Ok(JobOutcome::Failed)
            }
            Err(error) => {
                tracing::error!(
                    sync_id = %job.sync_id,
                    operation = job.operation.as_str(),
                    %error,
                    "job failed permanently"
                );
                self.queue.complete(&job).await?;
                self.park_record(&job, &error.to_string()).await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Surface a dead job on its record. Deletion-marked rows keep their
    /// state; only the status event carries the error.
    async fn park_record(&self, job: &QueueJob, message: &str) {
        if job.operation == QueueOperation::Pull {
            self.emit(PULL_KEY, SyncState::Error, Some(message.to_string()));
            return;
        }
        let Ok(id) = SyncId::from_str(&job.sync_id) else {
            return;
        };

        if job.operation == QueueOperation::Upload {
            let parked = if matches!(self.store.get_document(&id).await, Ok(Some(_))) {
                self.store.set_document_state(&id, SyncState::Error).await
            } else if matches!(self.store.get_attachment(&id).await, Ok(Some(_))) {
                self.store.set_attachment_state(&id, SyncState::Error).await
            } else {
                Ok(())
            };
            if let Err(error) = parked {
                tracing::warn!(sync_id = %id, %error, "failed to park record in error state");
            }
        }
        self.emit(&job.sync_id, SyncState::Error, Some(message.to_string()));
    }

    async fn requeue_stranded_deletions(&self) -> Result<()> {
        for doc in self
            .store
            .list_documents_in_state(SyncState::PendingDeletion)
            .await?
        {
            self.queue
                .enqueue(&doc.sync_id.as_str(), QueueOperation::Delete)
                .await?;
        }
        for attachment in self
            .store
            .list_attachments_in_state(SyncState::PendingDeletion)
            .await?
        {
            // Attachments under a deletion-marked document ride along with
            // the document's job.
            let parent_marked = matches!(
                self.store.get_document(&attachment.document_sync_id).await?,
                Some(parent) if parent.sync_state == SyncState::PendingDeletion
            );
            if !parent_marked {
                self.queue
                    .enqueue(&attachment.sync_id.as_str(), QueueOperation::Delete)
                    .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------

    async fn run_upload(&self, identity: &Identity, job: &QueueJob) -> Result<JobOutcome> {
        let mut id = parse_sync_id(&job.sync_id)?;
        let lock = self.record_lock(&job.sync_id).await;
        let _guard = lock.lock().await;

        let Some(doc) = self.store.get_document(&id).await? else {
            // Deleted or remediated away since enqueueing.
            return Ok(JobOutcome::Skipped);
        };
        match doc.sync_state {
            SyncState::PendingDeletion => return Ok(JobOutcome::Skipped),
            SyncState::Local
            | SyncState::PendingUpload
            | SyncState::Uploading
            | SyncState::Synced
            | SyncState::PendingDownload
            | SyncState::Downloading
            | SyncState::Conflict
            | SyncState::Error => {}
        }

        self.store
            .set_document_state(&id, SyncState::Uploading)
            .await?;
        self.emit(&id.as_str(), SyncState::Uploading, None);

        match self.push_document(identity, doc, &mut id).await {
            Ok(()) => {
                // Only an untouched row finishes as `synced`; a row edited
                // while the upload was in flight keeps its fresh mark and
                // its queue entry pushes the edit in a later pass.
                if self
                    .store
                    .transition_document_state(&id, SyncState::Uploading, SyncState::Synced)
                    .await?
                {
                    self.emit(&id.as_str(), SyncState::Synced, None);
                } else {
                    tracing::debug!(sync_id = %id, "document changed during upload; keeping its state");
                }
                Ok(JobOutcome::Uploaded)
            }
            Err(error) => {
                // Blob keys persisted so far stay; the retry skips them.
                if let Err(restore) = self
                    .store
                    .set_document_state(&id, SyncState::PendingUpload)
                    .await
                {
                    tracing::warn!(sync_id = %id, %restore, "failed to restore upload state");
                }
                self.emit(&id.as_str(), SyncState::PendingUpload, Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Upload one document: blobs first, metadata second.
    ///
    /// Metadata referencing a blob key is only ever written after the blob
    /// write that produced that exact key succeeded. Reversing this order
    /// publishes dangling references.
    async fn push_document(
        &self,
        identity: &Identity,
        mut doc: Document,
        id: &mut SyncId,
    ) -> Result<()> {
        for attachment in self.store.list_attachments_for(id).await? {
            if !attachment.needs_blob_upload() {
                continue;
            }
            let Some(path) = attachment.local_path.as_deref() else {
                return Err(Error::Validation(format!(
                    "attachment {} has neither local bytes nor a stored blob key",
                    attachment.sync_id
                )));
            };
            let bytes = tokio::fs::read(path).await?;
            let key = self.blobs.build_key(identity, id, &attachment.file_name)?;
            self.blobs
                .put(&key, &bytes, Some(&attachment.content_type))
                .await?;
            // Persist immediately so a later failure cannot lose the key.
            self.store
                .set_attachment_blob_key(&attachment.sync_id, &key)
                .await?;
        }

        match self.metadata.put_document(identity, &doc).await {
            Ok(()) => {}
            Err(Error::DuplicateIdentifier(detail)) => {
                // Collision with a record we do not own: mint a fresh id,
                // rewrite the local row and its back-references atomically,
                // retry exactly once.
                let fresh = SyncId::new();
                tracing::warn!(
                    old = %id,
                    new = %fresh,
                    detail,
                    "duplicate identifier; retrying with a fresh id"
                );
                self.store.replace_document_id(id, &fresh).await?;
                doc.sync_id = fresh;
                *id = fresh;
                self.metadata.put_document(identity, &doc).await?;
            }
            Err(error) => return Err(error),
        }

        for attachment in self.store.list_attachments_for(id).await? {
            let dirty = match attachment.sync_state {
                SyncState::Local
                | SyncState::PendingUpload
                | SyncState::Uploading
                | SyncState::Conflict
                | SyncState::Error => true,
                SyncState::Synced
                | SyncState::PendingDeletion
                | SyncState::PendingDownload
                | SyncState::Downloading => false,
            };
            if !dirty {
                continue;
            }
            self.metadata.put_attachment(identity, &attachment).await?;
            if self
                .store
                .mark_attachment_synced_if_unchanged(&attachment.sync_id, attachment.updated_at)
                .await?
            {
                self.emit(&attachment.sync_id.as_str(), SyncState::Synced, None);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------

    async fn run_pull(&self, identity: &Identity) -> Result<usize> {
        let mut applied = self.apply_remote_tombstones(identity).await?;

        let remote_docs = self.metadata.list_documents(identity).await?;
        for chunk in remote_docs.chunks(self.options.batch_size.max(1)) {
            for remote in chunk {
                if self.is_cancelled() {
                    return Ok(applied);
                }
                if self.pull_document(identity, remote).await? {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Remote tombstones win over any local copy except one already headed
    /// for deletion, whose own job owns the teardown.
    async fn apply_remote_tombstones(&self, identity: &Identity) -> Result<usize> {
        let mut applied = 0;
        for tombstone in self.metadata.list_tombstones(identity).await? {
            let id = tombstone.sync_id;
            // One in-flight mutating operation per record; an upload of the
            // same id finishes its consistent step before the row goes.
            let lock = self.record_lock(&id.as_str()).await;
            let _guard = lock.lock().await;

            if let Some(doc) = self.store.get_document(&id).await? {
                if doc.sync_state == SyncState::PendingDeletion {
                    continue;
                }
                self.store.insert_tombstone(&tombstone).await?;
                self.store.remove_document_row(&id).await?;
                self.emit(&id.as_str(), SyncState::PendingDeletion, None);
                applied += 1;
                continue;
            }

            if let Some(attachment) = self.store.get_attachment(&id).await? {
                if attachment.sync_state == SyncState::PendingDeletion {
                    continue;
                }
                self.store.insert_tombstone(&tombstone).await?;
                self.store.remove_attachment_row(&id).await?;
                self.emit(&id.as_str(), SyncState::PendingDeletion, None);
                applied += 1;
                continue;
            }

            // Nothing local; record it so this id can never be recreated.
            self.store.insert_tombstone(&tombstone).await?;
        }
        Ok(applied)
    }

    async fn pull_document(&self, identity: &Identity, remote: &Document) -> Result<bool> {
        let id = remote.sync_id;

        if self.store.has_tombstone(&id).await? {
            // Local deletion always wins; tell the remote side again.
            self.queue
                .enqueue(&id.as_str(), QueueOperation::Delete)
                .await?;
            return Ok(false);
        }

        let lock = self.record_lock(&id.as_str()).await;
        let _guard = lock.lock().await;

        match self.store.get_document(&id).await? {
            None => {
                self.store.apply_remote_document(remote).await?;
                self.pull_attachments(identity, &id).await?;
                self.emit(&id.as_str(), SyncState::Synced, None);
                Ok(true)
            }
            Some(local) => {
                if local.sync_state == SyncState::Conflict {
                    return self.settle_conflict(identity, &local, remote).await;
                }
                if local.sync_state.protects_local() {
                    // Pending local work pushes later; never overwrite it.
                    return Ok(false);
                }
                if remote.updated_at > local.updated_at {
                    self.store.apply_remote_document(remote).await?;
                    self.pull_attachments(identity, &id).await?;
                    self.emit(&id.as_str(), SyncState::Synced, None);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Merge the remote attachment listing into the local one through
    /// [`conflict::merge_attachments`]: union keyed by `sync_id`, per-entry
    /// last-writer-wins, never a wholesale replace. Local-only attachments
    /// survive a metadata update pushed from another device.
    async fn pull_attachments(&self, identity: &Identity, document: &SyncId) -> Result<()> {
        let remote_listing = self.metadata.list_attachments(identity, document).await?;

        let mut tombstoned = HashSet::new();
        for attachment in &remote_listing {
            if self.store.has_tombstone(&attachment.sync_id).await? {
                // Local deletion wins; tell the remote side again.
                self.queue
                    .enqueue(&attachment.sync_id.as_str(), QueueOperation::Delete)
                    .await?;
                tombstoned.insert(attachment.sync_id);
            }
        }

        let local_listing = self.store.list_all_attachments_for(document).await?;
        let merged = conflict::merge_attachments(&local_listing, &remote_listing, |id| {
            tombstoned.contains(id)
        });

        for entry in merged {
            let local = local_listing.iter().find(|a| a.sync_id == entry.sync_id);
            match local {
                // Pending local work pushes later; never overwrite it.
                Some(row) if row.sync_state.protects_local() => continue,
                // Unchanged by the merge; idempotent pass writes nothing.
                Some(row) if *row == entry => continue,
                Some(_) | None => {}
            }
            self.store.apply_remote_attachment(&entry).await?;

            if entry.blob_key.is_none() {
                continue;
            }
            match self.options.download_policy {
                DownloadPolicy::Eager => {
                    if let Err(error) = self.download_attachment(&entry.sync_id).await {
                        // Bytes can be fetched later; the metadata applied.
                        tracing::warn!(
                            sync_id = %entry.sync_id,
                            %error,
                            "eager download failed"
                        );
                    }
                }
                DownloadPolicy::Lazy => {
                    let stored = self.store.get_attachment(&entry.sync_id).await?;
                    if let Some(stored) = stored {
                        if stored.local_path.is_none() {
                            self.store
                                .set_attachment_state(&entry.sync_id, SyncState::PendingDownload)
                                .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a `conflict` row synchronously during the pull. The mark
    /// itself comes from an outer collaborator; see [`SyncState::Conflict`].
    async fn settle_conflict(
        &self,
        identity: &Identity,
        local: &Document,
        remote: &Document,
    ) -> Result<bool> {
        match conflict::resolve(local, remote) {
            Winner::Local => {
                self.store
                    .set_document_state(&local.sync_id, SyncState::PendingUpload)
                    .await?;
                self.queue
                    .enqueue(&local.sync_id.as_str(), QueueOperation::Upload)
                    .await?;
                self.emit(&local.sync_id.as_str(), SyncState::PendingUpload, None);
                Ok(false)
            }
            Winner::Remote => {
                self.store.apply_remote_document(remote).await?;
                self.pull_attachments(identity, &remote.sync_id).await?;
                self.emit(&remote.sync_id.as_str(), SyncState::Synced, None);
                Ok(true)
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn record_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn emit(&self, sync_id: &str, state: SyncState, error: Option<String>) {
        self.status_tx
            .send(SyncStatus {
                sync_id: sync_id.to_string(),
                state,
                error,
            })
            .ok();
    }
}

fn parse_sync_id(raw: &str) -> Result<SyncId> {
    SyncId::from_str(raw)
        .map_err(|_| Error::Validation(format!("malformed sync id in queue: {raw}")))
}
