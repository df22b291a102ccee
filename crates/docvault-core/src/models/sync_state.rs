//! Sync state machine for documents and file attachments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Per-record synchronization state.
///
/// Local-origin flow: `Local` -> `PendingUpload` -> `Uploading` -> `Synced`,
/// then back to `PendingUpload` on edit or to `PendingDeletion` on delete.
/// Remote-origin flow: `PendingDownload` -> `Downloading` -> `Synced`.
/// `Conflict` is resolved synchronously into one of the pending states;
/// `Error` is terminal until a retry moves the record back into a pending
/// state. The only exit from `PendingDeletion` is row removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Created locally, never pushed
    Local,
    /// Local changes awaiting upload
    PendingUpload,
    /// Upload in flight
    Uploading,
    /// Local and remote copies agree
    Synced,
    /// Marked for deletion; the row may only be removed, never revived
    PendingDeletion,
    /// Discovered remotely, bytes not yet fetched
    PendingDownload,
    /// Download in flight
    Downloading,
    /// Both sides changed; resolver decides the winner.
    ///
    /// The engine never assigns this state itself (a pull leaves dirty
    /// rows for the push instead of flagging them). It is set by an outer
    /// collaborator that detects concurrent edits, and the next pull
    /// settles the row through the resolver.
    Conflict,
    /// Retries exhausted; surfaced to the UI collaborator
    Error,
}

impl SyncState {
    /// Stable string form used in the persisted schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PendingUpload => "pendingUpload",
            Self::Uploading => "uploading",
            Self::Synced => "synced",
            Self::PendingDeletion => "pendingDeletion",
            Self::PendingDownload => "pendingDownload",
            Self::Downloading => "downloading",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Whether local content is ahead of (or absent from) the remote copy.
    #[must_use]
    pub const fn needs_upload(self) -> bool {
        match self {
            Self::Local | Self::PendingUpload | Self::Uploading | Self::Conflict => true,
            Self::Synced
            | Self::PendingDeletion
            | Self::PendingDownload
            | Self::Downloading
            | Self::Error => false,
        }
    }

    /// Whether an incoming pull may overwrite this record.
    ///
    /// Pending local work always wins over a pull; the conflict resolver is
    /// consulted separately for `Conflict`.
    #[must_use]
    pub const fn protects_local(self) -> bool {
        match self {
            Self::Local
            | Self::PendingUpload
            | Self::Uploading
            | Self::PendingDeletion
            | Self::Conflict => true,
            Self::Synced | Self::PendingDownload | Self::Downloading | Self::Error => false,
        }
    }

    /// Whether the record has been marked for deletion.
    #[must_use]
    pub const fn is_deletion(self) -> bool {
        match self {
            Self::PendingDeletion => true,
            Self::Local
            | Self::PendingUpload
            | Self::Uploading
            | Self::Synced
            | Self::PendingDownload
            | Self::Downloading
            | Self::Conflict
            | Self::Error => false,
        }
    }

    /// State to re-enter after a user-initiated retry out of `Error`.
    #[must_use]
    pub const fn retry_target(self) -> Self {
        match self {
            Self::PendingDownload | Self::Downloading => Self::PendingDownload,
            Self::Local
            | Self::PendingUpload
            | Self::Uploading
            | Self::Synced
            | Self::PendingDeletion
            | Self::Conflict
            | Self::Error => Self::PendingUpload,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "pendingUpload" => Ok(Self::PendingUpload),
            "uploading" => Ok(Self::Uploading),
            "synced" => Ok(Self::Synced),
            "pendingDeletion" => Ok(Self::PendingDeletion),
            "pendingDownload" => Ok(Self::PendingDownload),
            "downloading" => Ok(Self::Downloading),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::Validation(format!("unknown sync state: {other}"))),
        }
    }
}

impl SyncState {
    /// Every state, in declaration order. Used by tests to enforce that
    /// state-dependent code paths stay total.
    pub const ALL: [Self; 9] = [
        Self::Local,
        Self::PendingUpload,
        Self::Uploading,
        Self::Synced,
        Self::PendingDeletion,
        Self::PendingDownload,
        Self::Downloading,
        Self::Conflict,
        Self::Error,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string_form() {
        for state in SyncState::ALL {
            let parsed: SyncState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn rejects_unknown_state_strings() {
        assert!("uploaded".parse::<SyncState>().is_err());
        assert!("".parse::<SyncState>().is_err());
    }

    #[test]
    fn pending_deletion_is_never_revivable() {
        assert!(SyncState::PendingDeletion.protects_local());
        assert!(!SyncState::PendingDeletion.needs_upload());
        assert!(SyncState::PendingDeletion.is_deletion());
    }

    #[test]
    fn dirty_states_protect_local_content() {
        assert!(SyncState::PendingUpload.protects_local());
        assert!(SyncState::Local.protects_local());
        assert!(!SyncState::Synced.protects_local());
        assert!(!SyncState::PendingDownload.protects_local());
    }

    #[test]
    fn retry_targets_match_record_origin() {
        assert_eq!(
            SyncState::PendingDownload.retry_target(),
            SyncState::PendingDownload
        );
        assert_eq!(SyncState::Error.retry_target(), SyncState::PendingUpload);
    }
}
