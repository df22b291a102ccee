//! Synchronization engine: offline queue, conflict resolution, deletion,
//! and the push/pull passes that tie the local store to the remote backend.

pub mod conflict;
pub mod deletion;
pub mod engine;
pub mod queue;

pub use deletion::DeletionTracker;
pub use engine::SyncEngine;
pub use queue::{OfflineQueue, QueueJob, QueueOperation, RetryPolicy};

use crate::models::SyncState;

/// Tuning knobs for a sync pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Concurrent in-flight record transfers.
    pub concurrency: usize,
    /// Records processed per pull batch and queue drain round.
    pub batch_size: usize,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
    /// When to fetch attachment bytes discovered during a pull.
    pub download_policy: DownloadPolicy,
    /// Directory for downloaded attachment bytes.
    pub cache_dir: Option<std::path::PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_size: 25,
            retry: RetryPolicy::default(),
            download_policy: DownloadPolicy::Lazy,
            cache_dir: None,
        }
    }
}

/// Attachment byte download strategy.
///
/// Metadata always syncs eagerly; bytes are large and optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPolicy {
    /// Record the blob key and fetch bytes on first access.
    Lazy,
    /// Fetch bytes as soon as the attachment is discovered.
    Eager,
}

/// Per-record progress event, broadcast to UI collaborators.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub sync_id: String,
    pub state: SyncState,
    pub error: Option<String>,
}

/// Aggregate outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub deleted: usize,
    pub pulled: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl SyncSummary {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
