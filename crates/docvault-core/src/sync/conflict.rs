//! Deterministic conflict resolution.
//!
//! Last-writer-wins on `updated_at`, with the lexicographically smaller
//! `sync_id` breaking exact ties. Both inputs are available on every device
//! that observes the conflict, so every device resolves it the same way
//! without coordination.

use std::collections::BTreeMap;

use crate::models::{Document, FileAttachment, SyncId};

/// Which side a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Resolve a document conflict.
///
/// Strictly later `updated_at` wins. On an exact tie the record with the
/// lexicographically smaller `sync_id` wins; since both sides carry the
/// same record the tie-break only matters when a duplicate-id remediation
/// left two distinct records racing, and any deterministic pick is correct.
#[must_use]
pub fn resolve(local: &Document, remote: &Document) -> Winner {
    resolve_by(
        local.updated_at,
        &local.sync_id,
        remote.updated_at,
        &remote.sync_id,
    )
}

/// Resolve an attachment conflict under the same rule as documents.
#[must_use]
pub fn resolve_attachment(local: &FileAttachment, remote: &FileAttachment) -> Winner {
    resolve_by(
        local.updated_at,
        &local.sync_id,
        remote.updated_at,
        &remote.sync_id,
    )
}

fn resolve_by(
    local_updated: i64,
    local_id: &SyncId,
    remote_updated: i64,
    remote_id: &SyncId,
) -> Winner {
    if local_updated > remote_updated {
        return Winner::Local;
    }
    if remote_updated > local_updated {
        return Winner::Remote;
    }
    if local_id <= remote_id {
        Winner::Local
    } else {
        Winner::Remote
    }
}

/// Merge two attachment listings for the same document.
///
/// The result is the union of entries keyed by `sync_id`, excluding ids the
/// caller reports as tombstoned. When an id appears on both sides the entry
/// is chosen per-id by [`resolve_attachment`], except that a stored
/// `blob_key` and a known `local_path` are never discarded: whichever side
/// carries them, they survive the merge. An attachment added on one device
/// is therefore never lost because the other device edited the document.
pub fn merge_attachments(
    local: &[FileAttachment],
    remote: &[FileAttachment],
    mut is_tombstoned: impl FnMut(&SyncId) -> bool,
) -> Vec<FileAttachment> {
    let mut merged: BTreeMap<SyncId, FileAttachment> = BTreeMap::new();

    for attachment in local {
        if !is_tombstoned(&attachment.sync_id) {
            merged.insert(attachment.sync_id, attachment.clone());
        }
    }

    for remote_entry in remote {
        if is_tombstoned(&remote_entry.sync_id) {
            continue;
        }
        match merged.get_mut(&remote_entry.sync_id) {
            None => {
                merged.insert(remote_entry.sync_id, remote_entry.clone());
            }
            Some(local_entry) => {
                let mut winner = match resolve_attachment(local_entry, remote_entry) {
                    Winner::Local => local_entry.clone(),
                    Winner::Remote => remote_entry.clone(),
                };
                if winner.blob_key.is_none() {
                    winner.blob_key = local_entry
                        .blob_key
                        .clone()
                        .or_else(|| remote_entry.blob_key.clone());
                }
                if winner.local_path.is_none() {
                    winner.local_path = local_entry.local_path.clone();
                }
                *local_entry = winner;
            }
        }
    }

    let mut result: Vec<FileAttachment> = merged.into_values().collect();
    result.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.sync_id.cmp(&b.sync_id)));
    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::SyncState;

    fn doc(title: &str, updated_at: i64) -> Document {
        let mut doc = Document::new(title).unwrap();
        doc.updated_at = updated_at;
        doc
    }

    fn attachment(document: &SyncId, file_name: &str, updated_at: i64) -> FileAttachment {
        let mut att = FileAttachment::new(
            *document,
            file_name,
            "application/pdf",
            10,
            "/tmp/attachment",
        )
        .unwrap();
        att.updated_at = updated_at;
        att
    }

    #[test]
    fn later_update_wins() {
        let local = doc("Passport", 150);
        let remote = doc("Passport", 140);
        assert_eq!(resolve(&local, &remote), Winner::Local);
        assert_eq!(resolve(&remote, &local), Winner::Remote);
    }

    #[test]
    fn exact_tie_breaks_on_smaller_sync_id() {
        let a = doc("Passport", 100);
        let b = doc("Passport", 100);
        let expected = if a.sync_id <= b.sync_id {
            Winner::Local
        } else {
            Winner::Remote
        };
        assert_eq!(resolve(&a, &b), expected);

        // The same pair seen from the other device picks the same record.
        let kept_here = if resolve(&a, &b) == Winner::Local { &a } else { &b };
        let kept_there = if resolve(&b, &a) == Winner::Local { &b } else { &a };
        assert_eq!(kept_here.sync_id, kept_there.sync_id);
    }

    #[test]
    fn same_record_on_both_sides_ties_to_local() {
        let local = doc("Passport", 100);
        let remote = local.clone();
        assert_eq!(resolve(&local, &remote), Winner::Local);
    }

    #[test]
    fn merge_is_additive_union() {
        let parent = SyncId::new();
        let only_local = attachment(&parent, "front.jpg", 10);
        let only_remote = attachment(&parent, "back.jpg", 20);

        let merged = merge_attachments(
            &[only_local.clone()],
            &[only_remote.clone()],
            |_| false,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|a| a.sync_id == only_local.sync_id));
        assert!(merged.iter().any(|a| a.sync_id == only_remote.sync_id));
    }

    #[test]
    fn merge_resolves_shared_entries_per_id() {
        let parent = SyncId::new();
        let mut local = attachment(&parent, "scan.pdf", 50);
        local.label = Some("Old label".to_string());
        let mut remote = local.clone();
        remote.label = Some("New label".to_string());
        remote.updated_at = 60;

        let merged = merge_attachments(&[local], &[remote], |_| false);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].label.as_deref(), Some("New label"));
    }

    #[test]
    fn merge_never_discards_blob_key_or_local_path() {
        let parent = SyncId::new();
        let mut local = attachment(&parent, "scan.pdf", 70);
        local.blob_key = None;
        local.local_path = Some("/cache/scan.pdf".to_string());
        local.sync_state = SyncState::PendingUpload;

        let mut remote = local.clone();
        remote.blob_key = Some("protected/id/documents/x/scan.pdf".to_string());
        remote.local_path = None;
        remote.updated_at = 60; // local wins, remote still holds the key

        let merged = merge_attachments(&[local], &[remote], |_| false);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].blob_key.as_deref(),
            Some("protected/id/documents/x/scan.pdf")
        );
        assert_eq!(merged[0].local_path.as_deref(), Some("/cache/scan.pdf"));
    }

    #[test]
    fn merge_excludes_tombstoned_ids_from_either_side() {
        let parent = SyncId::new();
        let deleted = attachment(&parent, "old.pdf", 10);
        let kept = attachment(&parent, "new.pdf", 20);
        let dead_id = deleted.sync_id;

        let merged = merge_attachments(
            &[deleted.clone(), kept.clone()],
            &[deleted],
            move |id| *id == dead_id,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sync_id, kept.sync_id);
    }

    #[test]
    fn merge_orders_by_added_at() {
        let parent = SyncId::new();
        let mut first = attachment(&parent, "a.pdf", 5);
        first.added_at = 1;
        let mut second = attachment(&parent, "b.pdf", 5);
        second.added_at = 2;

        let merged = merge_attachments(&[second], &[first.clone()], |_| false);
        assert_eq!(merged[0].sync_id, first.sync_id);
    }
}
