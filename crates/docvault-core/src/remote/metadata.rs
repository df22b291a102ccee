//! Remote metadata service client.
//!
//! The metadata service owns the authoritative record listings; this module
//! only consumes it. Every call is scoped by the resolved storage identity.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::models::{Document, FileAttachment, SyncId, Tombstone};
use crate::util::{compact_text, is_http_url};

const METADATA_HTTP_TIMEOUT_SECS: u64 = 30;

/// Port to the remote metadata service.
///
/// `put_*` calls are idempotent create-or-replace writes; the service
/// answers 409 only when the id collides with a record the caller does not
/// own, which surfaces here as `DuplicateIdentifier`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_document(&self, identity: &Identity, doc: &Document) -> Result<()>;
    async fn get_document(&self, identity: &Identity, id: &SyncId) -> Result<Option<Document>>;
    async fn list_documents(&self, identity: &Identity) -> Result<Vec<Document>>;
    async fn delete_document(&self, identity: &Identity, id: &SyncId) -> Result<()>;

    async fn put_attachment(&self, identity: &Identity, attachment: &FileAttachment)
        -> Result<()>;
    async fn list_attachments(
        &self,
        identity: &Identity,
        document: &SyncId,
    ) -> Result<Vec<FileAttachment>>;
    async fn delete_attachment(&self, identity: &Identity, id: &SyncId) -> Result<()>;

    async fn put_tombstone(&self, identity: &Identity, tombstone: &Tombstone) -> Result<()>;
    async fn list_tombstones(&self, identity: &Identity) -> Result<Vec<Tombstone>>;
}

/// JSON/HTTP implementation of [`MetadataStore`].
#[derive(Clone)]
pub struct HttpMetadataStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMetadataStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::Validation(
                "metadata base URL must include http:// or https://".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(METADATA_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|error| Error::Network(error.to_string()))?;

        Ok(Self { base_url, client })
    }

    fn url(&self, identity: &Identity, path: &str) -> String {
        format!("{}/v1/owners/{}/{path}", self.base_url, identity.as_str())
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, url: String, body: &T) -> Result<()> {
        let response = self
            .client
            .put(url)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        expect_success(response).await.map(|_| ())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<Option<T>> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response).await?;
        let payload = response.json().await.map_err(request_error)?;
        Ok(Some(payload))
    }

    async fn list_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<Vec<T>> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let response = expect_success(response).await?;
        response.json().await.map_err(request_error)
    }

    async fn delete(&self, url: String) -> Result<()> {
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(request_error)?;
        expect_success(response).await.map(|_| ())
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn put_document(&self, identity: &Identity, doc: &Document) -> Result<()> {
        self.put_json(self.url(identity, &format!("documents/{}", doc.sync_id)), doc)
            .await
    }

    async fn get_document(&self, identity: &Identity, id: &SyncId) -> Result<Option<Document>> {
        self.get_json(self.url(identity, &format!("documents/{id}")))
            .await
    }

    async fn list_documents(&self, identity: &Identity) -> Result<Vec<Document>> {
        self.list_json(self.url(identity, "documents")).await
    }

    async fn delete_document(&self, identity: &Identity, id: &SyncId) -> Result<()> {
        self.delete(self.url(identity, &format!("documents/{id}")))
            .await
    }

    async fn put_attachment(
        &self,
        identity: &Identity,
        attachment: &FileAttachment,
    ) -> Result<()> {
        self.put_json(
            self.url(identity, &format!("attachments/{}", attachment.sync_id)),
            attachment,
        )
        .await
    }

    async fn list_attachments(
        &self,
        identity: &Identity,
        document: &SyncId,
    ) -> Result<Vec<FileAttachment>> {
        self.list_json(self.url(identity, &format!("documents/{document}/attachments")))
            .await
    }

    async fn delete_attachment(&self, identity: &Identity, id: &SyncId) -> Result<()> {
        self.delete(self.url(identity, &format!("attachments/{id}")))
            .await
    }

    async fn put_tombstone(&self, identity: &Identity, tombstone: &Tombstone) -> Result<()> {
        self.put_json(
            self.url(identity, &format!("tombstones/{}", tombstone.sync_id)),
            tombstone,
        )
        .await
    }

    async fn list_tombstones(&self, identity: &Identity) -> Result<Vec<Tombstone>> {
        self.list_json(self.url(identity, "tombstones")).await
    }
}

fn request_error(error: reqwest::Error) -> Error {
    // Timeouts are indistinguishable from any other transient failure for
    // retry purposes.
    Error::Network(error.to_string())
}

async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(map_status(status, &body))
}

/// Map an HTTP status to the sync error taxonomy.
fn map_status(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::AuthRequired(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT => Error::DuplicateIdentifier(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(message),
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            Error::QuotaExceeded(message)
        }
        _ => Error::Network(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_base_url() {
        assert!(HttpMetadataStore::new("metadata.example.com").is_err());
        assert!(HttpMetadataStore::new("https://metadata.example.com/").is_ok());
    }

    #[test]
    fn urls_are_identity_scoped() {
        let store = HttpMetadataStore::new("https://metadata.example.com").unwrap();
        let identity = Identity::new("us-east-1:abc").unwrap();
        assert_eq!(
            store.url(&identity, "documents"),
            "https://metadata.example.com/v1/owners/us-east-1:abc/documents"
        );
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            Error::AuthRequired(_)
        ));
        assert!(matches!(
            map_status(StatusCode::CONFLICT, ""),
            Error::DuplicateIdentifier(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            Error::Validation(_)
        ));
        assert!(matches!(
            map_status(StatusCode::INSUFFICIENT_STORAGE, ""),
            Error::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            Error::Network(_)
        ));
        assert!(matches!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            Error::Network(_)
        ));
    }

    #[test]
    fn parse_api_error_prefers_structured_message() {
        let body = r#"{"message": "owner mismatch"}"#;
        let rendered = parse_api_error(StatusCode::FORBIDDEN, body);
        assert_eq!(rendered, "owner mismatch (403)");
    }
}
