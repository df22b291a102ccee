//! Content-addressed blob storage for attachment bytes.
//!
//! Keys are computed exactly once, at upload time, and persisted on the
//! attachment row. Every later download or delete uses that stored key;
//! recomputing a key from current local metadata is how deletions silently
//! miss their target.

use std::env;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::models::SyncId;

const ENV_ENDPOINT: &str = "DOCVAULT_BLOB_ENDPOINT";
const ENV_BUCKET: &str = "DOCVAULT_BLOB_BUCKET";
const ENV_ACCESS_KEY_ID: &str = "DOCVAULT_BLOB_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "DOCVAULT_BLOB_SECRET_ACCESS_KEY";
const ENV_REGION: &str = "DOCVAULT_BLOB_REGION";
const ENV_ACCESS_SCOPE: &str = "DOCVAULT_BLOB_ACCESS_SCOPE";

const DEFAULT_REGION: &str = "auto";
const DEFAULT_ACCESS_SCOPE: &str = "protected";

/// Port to the remote blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Build the object key for an attachment about to be uploaded.
    ///
    /// Called once per attachment; the returned key is persisted and is the
    /// only valid handle from then on.
    fn build_key(&self, identity: &Identity, document: &SyncId, file_name: &str)
        -> Result<String>;

    /// Upload object bytes under the given key.
    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<()>;

    /// Download object bytes. `NotFound` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete the object. Missing objects are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3-compatible blob store configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobConfig {
    /// Endpoint URL of the S3-compatible service.
    pub endpoint: String,
    /// Bucket name.
    pub bucket: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Region; `auto` for most S3-compatible services.
    pub region: String,
    /// Leading key segment encoding the access level (e.g. `protected`).
    pub access_scope: String,
}

impl BlobConfig {
    /// Load blob configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no blob variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }
}

/// S3-backed [`BlobStore`].
#[derive(Clone, Debug)]
pub struct S3BlobStore {
    config: BlobConfig,
    client: Client,
}

impl S3BlobStore {
    #[must_use]
    pub fn new(config: BlobConfig) -> Self {
        let client = build_s3_client(&config);
        Self { config, client }
    }

    #[must_use]
    pub const fn config(&self) -> &BlobConfig {
        &self.config
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn build_key(
        &self,
        identity: &Identity,
        document: &SyncId,
        file_name: &str,
    ) -> Result<String> {
        build_blob_key(&self.config.access_scope, identity, document, file_name)
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<()> {
        let key = normalize_object_key(key)?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()));

        if let Some(content_type) = normalize_content_type(content_type) {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .map_err(|error| storage_error("put_object", &self.config.bucket, &key, error))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = normalize_object_key(key)?;

        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    Error::NotFound(format!("{}/{key}", self.config.bucket))
                } else {
                    storage_error("get_object", &self.config.bucket, &key, error)
                }
            })?;

        let payload = response
            .body
            .collect()
            .await
            .map_err(|error| storage_error("get_object_body", &self.config.bucket, &key, error))?;

        Ok(payload.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_object_key(key)?;

        // S3 delete is already tolerant of missing keys.
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| storage_error("delete_object", &self.config.bucket, &key, error))?;

        Ok(())
    }
}

/// Build the canonical object key:
/// `{accessScope}/{identity}/documents/{syncId}/{timestamp}-{fileName}`.
pub fn build_blob_key(
    access_scope: &str,
    identity: &Identity,
    document: &SyncId,
    file_name: &str,
) -> Result<String> {
    let scope = access_scope.trim().trim_matches('/');
    if scope.is_empty() {
        return Err(Error::Validation(
            "blob access scope cannot be empty".to_string(),
        ));
    }

    let file_name = sanitize_file_name(file_name);
    let ts = Utc::now().timestamp_millis();

    Ok(format!(
        "{scope}/{}/documents/{document}/{ts}-{file_name}",
        identity.as_str()
    ))
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<BlobConfig>> {
    let endpoint = lookup(ENV_ENDPOINT).map(|value| value.trim().to_string());
    let bucket = lookup(ENV_BUCKET).map(|value| value.trim().to_string());
    let access_key_id = lookup(ENV_ACCESS_KEY_ID).map(|value| value.trim().to_string());
    let secret_access_key = lookup(ENV_SECRET_ACCESS_KEY).map(|value| value.trim().to_string());
    let region = lookup(ENV_REGION).map(|value| value.trim().to_string());
    let access_scope = lookup(ENV_ACCESS_SCOPE).map(|value| value.trim().to_string());

    let any_present = endpoint.is_some()
        || bucket.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some();

    if !any_present {
        return Ok(None);
    }

    let mut missing = Vec::new();
    if endpoint.as_ref().map_or(true, String::is_empty) {
        missing.push(ENV_ENDPOINT);
    }
    if bucket.as_ref().map_or(true, String::is_empty) {
        missing.push(ENV_BUCKET);
    }
    if access_key_id.as_ref().map_or(true, String::is_empty) {
        missing.push(ENV_ACCESS_KEY_ID);
    }
    if secret_access_key.as_ref().map_or(true, String::is_empty) {
        missing.push(ENV_SECRET_ACCESS_KEY);
    }

    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Blob storage configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    }

    let endpoint = endpoint.expect("validated above");
    if !crate::util::is_http_url(&endpoint) {
        return Err(Error::Validation(format!(
            "{ENV_ENDPOINT} must include http:// or https://"
        )));
    }

    Ok(Some(BlobConfig {
        endpoint: endpoint.trim_end_matches('/').to_string(),
        bucket: bucket.expect("validated above"),
        access_key_id: access_key_id.expect("validated above"),
        secret_access_key: secret_access_key.expect("validated above"),
        region: region
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_scope: access_scope
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ACCESS_SCOPE.to_string()),
    }))
}

fn build_s3_client(config: &BlobConfig) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "docvault-blob-storage",
    );

    let sdk_config = aws_sdk_s3::config::Builder::new()
        .region(Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint.clone())
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

fn storage_error(
    operation: &str,
    bucket: &str,
    object_key: &str,
    error: impl std::fmt::Display,
) -> Error {
    Error::Storage(format!(
        "blob {operation} failed for {bucket}/{object_key}: {error}"
    ))
}

fn normalize_object_key(object_key: &str) -> Result<String> {
    let object_key = object_key.trim().trim_matches('/').to_string();
    if object_key.is_empty() {
        return Err(Error::Validation(
            "blob object key cannot be empty".to_string(),
        ));
    }
    Ok(object_key)
}

fn normalize_content_type(content_type: Option<&str>) -> Option<String> {
    content_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn sanitize_file_name(file_name: &str) -> String {
    let trimmed = file_name.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "file".to_string();
    }

    let (stem, ext) = trimmed
        .rsplit_once('.')
        .map_or((trimmed, ""), |parts| parts);
    let stem = sanitize_token(stem);
    let stem = if stem.is_empty() {
        "file".to_string()
    } else {
        stem
    };
    let ext = sanitize_token(ext);

    if ext.is_empty() {
        stem
    } else {
        format!("{stem}.{ext}")
    }
}

fn sanitize_token(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;

    for ch in input.chars().flat_map(char::to_lowercase) {
        let keep = ch.is_ascii_alphanumeric();
        if keep {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<BlobConfig>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn parse_config_none_returns_none() {
        let map = HashMap::new();
        assert!(parse_from_map(&map).unwrap().is_none());
    }

    #[test]
    fn parse_config_requires_all_required_values() {
        let mut map = HashMap::new();
        map.insert(ENV_ENDPOINT, "https://blobs.example.com");
        map.insert(ENV_BUCKET, "vault");

        let err = parse_from_map(&map).unwrap_err();
        match err {
            Error::Validation(message) => {
                assert!(message.contains(ENV_ACCESS_KEY_ID));
                assert!(message.contains(ENV_SECRET_ACCESS_KEY));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_applies_defaults() {
        let mut map = HashMap::new();
        map.insert(ENV_ENDPOINT, "https://blobs.example.com/");
        map.insert(ENV_BUCKET, "vault");
        map.insert(ENV_ACCESS_KEY_ID, "AKID123");
        map.insert(ENV_SECRET_ACCESS_KEY, "SECRET123");

        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config.endpoint, "https://blobs.example.com");
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.access_scope, DEFAULT_ACCESS_SCOPE);
    }

    #[test]
    fn parse_config_rejects_non_http_endpoint() {
        let mut map = HashMap::new();
        map.insert(ENV_ENDPOINT, "blobs.example.com");
        map.insert(ENV_BUCKET, "vault");
        map.insert(ENV_ACCESS_KEY_ID, "AKID123");
        map.insert(ENV_SECRET_ACCESS_KEY, "SECRET123");

        assert!(parse_from_map(&map).is_err());
    }

    #[test]
    fn build_blob_key_has_canonical_shape() {
        let identity = Identity::new("us-east-1:abc").unwrap();
        let document = SyncId::new();

        let key =
            build_blob_key("protected", &identity, &document, "My Invoice (1).PDF").unwrap();
        assert!(key.starts_with(&format!("protected/us-east-1:abc/documents/{document}/")));
        assert!(key.ends_with("-my-invoice-1.pdf"));
    }

    #[test]
    fn build_blob_key_rejects_empty_scope() {
        let identity = Identity::new("us-east-1:abc").unwrap();
        assert!(build_blob_key("  ", &identity, &SyncId::new(), "f.pdf").is_err());
    }

    #[test]
    fn normalize_object_key_rejects_empty() {
        assert!(normalize_object_key("   ").is_err());
        assert_eq!(normalize_object_key("/a/b/").unwrap(), "a/b");
    }

    #[test]
    fn sanitize_file_name_keeps_extension() {
        assert_eq!(sanitize_file_name("Tax Return 2025.pdf"), "tax-return-2025.pdf");
        assert_eq!(sanitize_file_name("   "), "file");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires DOCVAULT_BLOB_* env vars plus network access"]
    async fn blob_roundtrip_put_get_delete() {
        let _ = dotenvy::dotenv();

        let config = BlobConfig::from_env()
            .expect("blob env parsing should not error")
            .expect("blob config should be present");
        let store = S3BlobStore::new(config);

        let identity = Identity::new("integration-identity").unwrap();
        let key = store
            .build_key(&identity, &SyncId::new(), "roundtrip.txt")
            .unwrap();
        let bytes = b"blob-roundtrip-test";

        store.put(&key, bytes, Some("text/plain")).await.unwrap();
        let fetched = store.get(&key).await.unwrap();
        assert_eq!(fetched, bytes);

        store.delete(&key).await.unwrap();
        assert!(matches!(
            store.get(&key).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
