//! docvault-core - Document vault synchronization engine
//!
//! This crate contains the models, local database layer, remote clients,
//! and the sync engine that keeps a device's document vault converged with
//! the remote backend. Presentation layers (CLI, app shells) consume the
//! engine through its queue/status surface.

pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod remote;
pub mod sync;
pub mod util;

pub use db::{Database, LocalStore};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityResolver};
pub use models::{Document, FileAttachment, SyncId, SyncState};
pub use sync::{OfflineQueue, SyncEngine, SyncOptions};
