//! Clients for the remote backend: metadata service and blob store.

pub mod blob;
pub mod metadata;

pub use blob::{BlobConfig, BlobStore, S3BlobStore};
pub use metadata::{HttpMetadataStore, MetadataStore};
