//! Data models shared across the library.

pub mod attachment;
pub mod document;
pub mod sync_state;
pub mod tombstone;

pub use attachment::FileAttachment;
pub use document::{Document, SyncId};
pub use sync_state::SyncState;
pub use tombstone::{RecordKind, Tombstone};
