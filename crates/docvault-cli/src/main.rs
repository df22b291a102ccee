//! docvault CLI - Manage and synchronize a personal document vault
//!
//! Local commands (add, attach, list, delete, ...) work entirely offline;
//! `sync`, `fetch`, and `verify` talk to the configured remote backend.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use docvault_core::db::migrations;
use docvault_core::identity::{
    HttpIdentityResolver, IdentityResolver, SessionTokenSource, StaticIdentity,
};
use docvault_core::remote::{BlobConfig, BlobStore, HttpMetadataStore, MetadataStore, S3BlobStore};
use docvault_core::sync::{DeletionTracker, OfflineQueue, SyncEngine, SyncOptions};
use docvault_core::{Database, Document, FileAttachment, LocalStore, SyncId, SyncState};
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "docvault")]
#[command(about = "Keep personal documents synchronized across devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new document
    #[command(alias = "new")]
    Add {
        /// Document title
        title: Vec<String>,
        /// Free-form category
        #[arg(long)]
        category: Option<String>,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Document date (YYYY-MM-DD), e.g. a renewal date
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },
    /// Attach a file to a document
    Attach {
        /// Document ID or unique ID prefix
        document: String,
        /// File to attach
        file: PathBuf,
        /// Optional label for the attachment
        #[arg(long)]
        label: Option<String>,
    },
    /// Set or clear an attachment's label
    Label {
        /// Attachment ID or unique ID prefix
        attachment: String,
        /// New label; omit to clear
        label: Option<String>,
    },
    /// List documents
    List {
        /// Number of documents to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one document and its attachments
    Show {
        /// Document ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a document and its attachments
    Delete {
        /// Document ID or unique ID prefix
        id: String,
    },
    /// Remove a single attachment
    Detach {
        /// Attachment ID or unique ID prefix
        id: String,
    },
    /// Download an attachment's bytes into the cache
    Fetch {
        /// Attachment ID or unique ID prefix
        id: String,
    },
    /// Retry a record stuck in the error state
    Retry {
        /// Document or attachment ID, or unique ID prefix
        id: String,
    },
    /// Push and pull pending changes
    Sync,
    /// Show per-state record counts and queued work
    Status,
    /// Check local records against the remote listing
    Verify,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] docvault_core::Error),
    #[error(transparent)]
    LibSql(#[from] libsql::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No document title provided")]
    EmptyTitle,
    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Document not found for id/prefix: {0}")]
    DocumentNotFound(String),
    #[error("Attachment not found for id/prefix: {0}")]
    AttachmentNotFound(String),
    #[error("{0}")]
    AmbiguousId(String),
    #[error(
        "Sync is not configured. Set DOCVAULT_METADATA_URL, DOCVAULT_IDENTITY (or \
         DOCVAULT_IDENTITY_URL and DOCVAULT_SESSION_TOKEN), and the DOCVAULT_BLOB_* variables."
    )]
    SyncNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docvault=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Add {
            title,
            category,
            notes,
            date,
        }) => {
            run_add(
                &title,
                category.as_deref(),
                notes.as_deref(),
                date.as_deref(),
                &db_path,
            )
            .await?;
        }
        Some(Commands::Attach {
            document,
            file,
            label,
        }) => run_attach(&document, &file, label.as_deref(), &db_path).await?,
        Some(Commands::Label { attachment, label }) => {
            run_label(&attachment, label.as_deref(), &db_path).await?;
        }
        Some(Commands::List { limit, json }) => run_list(limit, json, &db_path).await?,
        Some(Commands::Show { id, json }) => run_show(&id, json, &db_path).await?,
        Some(Commands::Delete { id }) => run_delete(&id, &db_path).await?,
        Some(Commands::Detach { id }) => run_detach(&id, &db_path).await?,
        Some(Commands::Fetch { id }) => run_fetch(&id, &db_path).await?,
        Some(Commands::Retry { id }) => run_retry(&id, &db_path).await?,
        Some(Commands::Sync) => run_sync(&db_path).await?,
        Some(Commands::Status) => run_status(&db_path).await?,
        Some(Commands::Verify) => run_verify(&db_path).await?,
        None => {
            Cli::command().print_help().map_err(CliError::Io)?;
            println!();
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------
// Local commands
// ---------------------------------------------------------------------

async fn run_add(
    title_parts: &[String],
    category: Option<&str>,
    notes: Option<&str>,
    date: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let title = title_parts.join(" ");
    if title.trim().is_empty() {
        return Err(CliError::EmptyTitle);
    }

    let mut doc = Document::new(title)?;
    doc.category = category.map(str::to_string);
    doc.notes = notes.map(str::to_string);
    doc.date = date.map(parse_date).transpose()?;

    let db = open_database(db_path).await?;
    let store = LocalStore::new(db.connection());
    store.insert_document(&doc).await?;

    // Queue the first upload so the next sync pushes it.
    mark_for_upload(&db, &doc.sync_id).await?;

    println!("{}", doc.sync_id);
    Ok(())
}

async fn run_attach(
    document_query: &str,
    file: &Path,
    label: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let doc = resolve_document(&db, document_query).await?;

    let file_meta = std::fs::metadata(file)?;
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut attachment = FileAttachment::new(
        doc.sync_id,
        file_name,
        guess_content_type(file),
        i64::try_from(file_meta.len()).unwrap_or(i64::MAX),
        file.to_string_lossy(),
    )?;
    attachment.label = label.map(str::to_string);

    let store = LocalStore::new(db.connection());
    store.insert_attachment(&attachment).await?;
    mark_for_upload(&db, &doc.sync_id).await?;

    println!("{}", attachment.sync_id);
    Ok(())
}

async fn run_label(
    attachment_query: &str,
    label: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let attachment = resolve_attachment(&db, attachment_query).await?;

    let store = LocalStore::new(db.connection());
    store
        .update_attachment_label(&attachment.sync_id, label)
        .await?;
    mark_for_upload(&db, &attachment.document_sync_id).await?;

    println!("{}", attachment.sync_id);
    Ok(())
}

#[derive(Debug, Serialize)]
struct DocumentListItem {
    id: String,
    title: String,
    category: Option<String>,
    date: Option<String>,
    state: String,
    updated_at: i64,
    relative_time: String,
}

async fn run_list(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let store = LocalStore::new(db.connection());
    let docs = store.list_documents(limit, 0).await?;

    if as_json {
        let items: Vec<DocumentListItem> = docs.iter().map(document_to_list_item).collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for doc in &docs {
            println!("{}", format_document_line(doc));
        }
    }
    Ok(())
}

async fn run_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let doc = resolve_document(&db, id).await?;
    let store = LocalStore::new(db.connection());
    let attachments = store.list_attachments_for(&doc.sync_id).await?;

    if as_json {
        #[derive(Serialize)]
        struct DocumentDetail {
            #[serde(flatten)]
            document: Document,
            attachments: Vec<FileAttachment>,
        }
        let detail = DocumentDetail {
            document: doc,
            attachments,
        };
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    println!("{}", format_document_line(&doc));
    if let Some(notes) = &doc.notes {
        println!("  notes: {notes}");
    }
    for attachment in &attachments {
        let label = attachment
            .label
            .as_deref()
            .map(|l| format!(" ({l})"))
            .unwrap_or_default();
        let cached = if attachment.local_path.is_some() {
            "cached"
        } else {
            "remote"
        };
        println!(
            "  {}  {}{}  {}  {}",
            short_id(&attachment.sync_id.as_str()),
            attachment.file_name,
            label,
            attachment.sync_state,
            cached
        );
    }
    Ok(())
}

async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let doc = resolve_document(&db, id).await?;

    let store = LocalStore::new(db.connection());
    let queue = OfflineQueue::new(db.connection());
    let deletions = DeletionTracker::new(store, queue);
    deletions.mark_document_deleted(&doc.sync_id).await?;

    println!("{}", doc.sync_id);
    Ok(())
}

async fn run_detach(id: &str, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let attachment = resolve_attachment(&db, id).await?;

    let store = LocalStore::new(db.connection());
    let queue = OfflineQueue::new(db.connection());
    let deletions = DeletionTracker::new(store, queue);
    deletions.mark_attachment_deleted(&attachment.sync_id).await?;

    println!("{}", attachment.sync_id);
    Ok(())
}

async fn run_status(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let store = LocalStore::new(db.connection());
    let queue = OfflineQueue::new(db.connection());

    for state in SyncState::ALL {
        let count = store.list_documents_in_state(state).await?.len();
        if count > 0 {
            println!("{:<16} {count}", state.as_str());
        }
    }
    println!("queued jobs      {}", queue.pending_count().await?);
    Ok(())
}

// ---------------------------------------------------------------------
// Remote commands
// ---------------------------------------------------------------------

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let engine = build_engine(&db)?;

    engine.trigger_pull().await?;
    tracing::info!("starting sync pass");
    let summary = engine.sync_pass().await?;
    println!(
        "uploaded {}, deleted {}, pulled {}, failed {}, deferred {}",
        summary.uploaded, summary.deleted, summary.pulled, summary.failed, summary.deferred
    );
    Ok(())
}

async fn run_fetch(id: &str, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let attachment = resolve_attachment(&db, id).await?;
    let engine = build_engine(&db)?;

    let path = engine.download_attachment(&attachment.sync_id).await?;
    println!("{}", path.display());
    Ok(())
}

async fn run_retry(id: &str, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let engine = build_engine(&db)?;

    let sync_id = match resolve_document(&db, id).await {
        Ok(doc) => doc.sync_id,
        Err(CliError::DocumentNotFound(_)) => resolve_attachment(&db, id).await?.sync_id,
        Err(error) => return Err(error),
    };
    engine.retry(&sync_id).await?;
    println!("{sync_id}");
    Ok(())
}

async fn run_verify(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let engine = build_engine(&db)?;

    let report = engine.verify().await?;
    if report.is_consistent() {
        println!("{} documents consistent", report.checked);
        return Ok(());
    }

    for id in &report.missing_remote {
        println!("missing remote    {id}");
    }
    for id in &report.stale_local {
        println!("stale local       {id}");
    }
    for id in &report.attachments_missing_blob_key {
        println!("missing blob key  {id}");
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------

async fn open_database(db_path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(db_path).await?;
    migrations::run(&db.connection()).await?;
    Ok(db)
}

async fn mark_for_upload(db: &Database, id: &SyncId) -> Result<(), CliError> {
    let store = LocalStore::new(db.connection());
    let queue = OfflineQueue::new(db.connection());
    store
        .set_document_state(id, SyncState::PendingUpload)
        .await?;
    queue
        .enqueue(&id.as_str(), docvault_core::sync::QueueOperation::Upload)
        .await?;
    Ok(())
}

struct EnvSessionToken;

impl SessionTokenSource for EnvSessionToken {
    fn session_token(&self) -> Option<String> {
        env::var("DOCVAULT_SESSION_TOKEN").ok()
    }
}

fn build_engine(db: &Database) -> Result<Arc<SyncEngine>, CliError> {
    let metadata_url = env::var("DOCVAULT_METADATA_URL").ok();
    let blob_config = BlobConfig::from_env()?;
    let (Some(metadata_url), Some(blob_config)) = (metadata_url, blob_config) else {
        return Err(CliError::SyncNotConfigured);
    };

    let identity: Arc<dyn IdentityResolver> = if let Ok(id) = env::var("DOCVAULT_IDENTITY") {
        Arc::new(StaticIdentity::new(id)?)
    } else if let Ok(endpoint) = env::var("DOCVAULT_IDENTITY_URL") {
        Arc::new(HttpIdentityResolver::new(endpoint, EnvSessionToken)?)
    } else {
        return Err(CliError::SyncNotConfigured);
    };

    let metadata: Arc<dyn MetadataStore> = Arc::new(HttpMetadataStore::new(metadata_url)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(blob_config));

    let store = LocalStore::new(db.connection());
    let queue = OfflineQueue::new(db.connection());
    let options = SyncOptions {
        cache_dir: Some(resolve_cache_dir()),
        ..SyncOptions::default()
    };
    Ok(SyncEngine::new(store, queue, metadata, blobs, identity, options))
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("DOCVAULT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docvault")
        .join("docvault.db")
}

fn resolve_cache_dir() -> PathBuf {
    env::var_os("DOCVAULT_CACHE_DIR").map_or_else(
        || {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docvault")
        },
        PathBuf::from,
    )
}

// ---------------------------------------------------------------------
// ID resolution and formatting
// ---------------------------------------------------------------------

async fn resolve_document(db: &Database, query: &str) -> Result<Document, CliError> {
    let store = LocalStore::new(db.connection());
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CliError::DocumentNotFound(query.to_string()));
    }

    if let Ok(id) = trimmed.parse::<SyncId>() {
        if let Some(doc) = store.get_document(&id).await? {
            return Ok(doc);
        }
    }

    let matches = prefix_matches(db, "documents", trimmed).await?;
    let id = resolve_single(matches, trimmed, CliError::DocumentNotFound)?
        .parse::<SyncId>()
        .map_err(|_| CliError::DocumentNotFound(trimmed.to_string()))?;
    store
        .get_document(&id)
        .await?
        .ok_or_else(|| CliError::DocumentNotFound(trimmed.to_string()))
}

async fn resolve_attachment(db: &Database, query: &str) -> Result<FileAttachment, CliError> {
    let store = LocalStore::new(db.connection());
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CliError::AttachmentNotFound(query.to_string()));
    }

    if let Ok(id) = trimmed.parse::<SyncId>() {
        if let Some(attachment) = store.get_attachment(&id).await? {
            return Ok(attachment);
        }
    }

    let matches = prefix_matches(db, "file_attachments", trimmed).await?;
    let id = resolve_single(matches, trimmed, CliError::AttachmentNotFound)?
        .parse::<SyncId>()
        .map_err(|_| CliError::AttachmentNotFound(trimmed.to_string()))?;
    store
        .get_attachment(&id)
        .await?
        .ok_or_else(|| CliError::AttachmentNotFound(trimmed.to_string()))
}

async fn prefix_matches(db: &Database, table: &str, prefix: &str) -> Result<Vec<String>, CliError> {
    let sql = format!(
        "SELECT sync_id FROM {table}
         WHERE sync_state != 'pendingDeletion' AND sync_id LIKE ?
         ORDER BY updated_at DESC
         LIMIT 3"
    );
    let mut rows = db
        .connection()
        .query(&sql, libsql::params![format!("{prefix}%")])
        .await?;

    let mut ids = Vec::new();
    while let Some(row) = rows.next().await? {
        let id: String = row.get(0)?;
        ids.push(id);
    }
    Ok(ids)
}

fn resolve_single(
    matches: Vec<String>,
    query: &str,
    not_found: fn(String) -> CliError,
) -> Result<String, CliError> {
    match matches.len() {
        0 => Err(not_found(query.to_string())),
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        _ => {
            let options = matches
                .iter()
                .map(|id| id.chars().take(8).collect::<String>())
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

fn document_to_list_item(doc: &Document) -> DocumentListItem {
    let now_ms = Utc::now().timestamp_millis();
    DocumentListItem {
        id: doc.sync_id.as_str(),
        title: doc.title.clone(),
        category: doc.category.clone(),
        date: doc.date.map(|d| d.to_string()),
        state: doc.sync_state.to_string(),
        updated_at: doc.updated_at,
        relative_time: format_relative_time(doc.updated_at, now_ms),
    }
}

fn format_document_line(doc: &Document) -> String {
    let now_ms = Utc::now().timestamp_millis();
    let id = short_id(&doc.sync_id.as_str());
    let relative_time = format_relative_time(doc.updated_at, now_ms);
    let category = doc
        .category
        .as_deref()
        .map(|c| format!("  [{c}]"))
        .unwrap_or_default();
    format!(
        "{id}  {:<30}  {:<15}  {relative_time}{category}",
        truncate(&doc.title, 30),
        doc.sync_state.as_str()
    )
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = text.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| CliError::InvalidDate(raw.to_string()))
}

fn guess_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("txt" | "md") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use docvault_core::{Document, LocalStore};

    use super::{
        format_relative_time, guess_content_type, mark_for_upload, open_database, parse_date,
        resolve_document, resolve_single, truncate, CliError,
    };

    #[test]
    fn parse_date_accepts_iso_and_rejects_garbage() {
        assert_eq!(parse_date("2026-03-14").unwrap().to_string(), "2026-03-14");
        assert_eq!(parse_date(" 2026-03-14 ").unwrap().to_string(), "2026-03-14");
        assert!(matches!(parse_date("14/03/2026"), Err(CliError::InvalidDate(_))));
        assert!(matches!(parse_date("soon"), Err(CliError::InvalidDate(_))));
    }

    #[test]
    fn format_relative_time_units() {
        let now = 10_000_000_000;
        assert_eq!(format_relative_time(now - 30_000, now), "just now");
        assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
        assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
        assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
        assert_eq!(format_relative_time(now - 15 * 24 * 60 * 60_000, now), "2w ago");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate("short", 30), "short");
        assert_eq!(truncate("a very long document title here", 20), "a very long docum...");
    }

    #[test]
    fn guess_content_type_by_extension() {
        assert_eq!(guess_content_type(Path::new("scan.pdf")), "application/pdf");
        assert_eq!(guess_content_type(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(guess_content_type(Path::new("notes.md")), "text/plain");
        assert_eq!(guess_content_type(Path::new("mystery")), "application/octet-stream");
    }

    #[test]
    fn resolve_single_reports_ambiguity() {
        let matches = vec![
            "aaaaaaaa-0000-7000-8000-000000000001".to_string(),
            "aaaaaaaa-0000-7000-8000-000000000002".to_string(),
        ];
        assert!(matches!(
            resolve_single(matches, "aaaaaaaa", CliError::DocumentNotFound),
            Err(CliError::AmbiguousId(_))
        ));
        assert!(matches!(
            resolve_single(Vec::new(), "zzz", CliError::DocumentNotFound),
            Err(CliError::DocumentNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_document_supports_exact_and_prefix_id() {
        let db_path = unique_test_db_path();
        let db = open_database(&db_path).await.unwrap();
        let store = LocalStore::new(db.connection());

        let mut doc_a = Document::new("Passport").unwrap();
        doc_a.sync_id = "11111111-1111-7111-8111-111111111111".parse().unwrap();
        let mut doc_b = Document::new("Lease").unwrap();
        doc_b.sync_id = "11111111-1111-7111-8111-222222222222".parse().unwrap();
        store.insert_document(&doc_a).await.unwrap();
        store.insert_document(&doc_b).await.unwrap();

        let by_exact = resolve_document(&db, "11111111-1111-7111-8111-111111111111")
            .await
            .unwrap();
        assert_eq!(by_exact.title, "Passport");

        let by_prefix = resolve_document(&db, "11111111-1111-7111-8111-2").await.unwrap();
        assert_eq!(by_prefix.title, "Lease");

        let error = resolve_document(&db, "11111111-1111-7111-8111").await.unwrap_err();
        assert!(matches!(error, CliError::AmbiguousId(_)));

        let error = resolve_document(&db, "ffffffff").await.unwrap_err();
        assert!(matches!(error, CliError::DocumentNotFound(_)));

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_for_upload_queues_exactly_one_job() {
        let db_path = unique_test_db_path();
        let db = open_database(&db_path).await.unwrap();
        let store = LocalStore::new(db.connection());

        let doc = Document::new("Insurance policy").unwrap();
        store.insert_document(&doc).await.unwrap();

        mark_for_upload(&db, &doc.sync_id).await.unwrap();
        mark_for_upload(&db, &doc.sync_id).await.unwrap();

        let queue = docvault_core::OfflineQueue::new(db.connection());
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        let reloaded = store.get_document(&doc.sync_id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.sync_state,
            docvault_core::SyncState::PendingUpload
        );

        cleanup_db_files(&db_path);
    }

    fn unique_test_db_path() -> PathBuf {
        static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        let sequence = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("docvault-cli-test-{timestamp}-{sequence}.db"))
    }

    fn cleanup_db_files(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
    }
}
