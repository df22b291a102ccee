//! Database migrations

use libsql::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Migration to version 1: documents, attachments, tombstones, sync queue.
///
/// `sync_id` uniqueness is enforced here as the primary key; nothing else
/// in the system may infer remote existence from an id's shape.
async fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS documents (
            sync_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            category TEXT,
            notes TEXT,
            date TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sync_state TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(sync_state)",
        "CREATE TABLE IF NOT EXISTS file_attachments (
            sync_id TEXT PRIMARY KEY,
            document_sync_id TEXT NOT NULL REFERENCES documents(sync_id) ON DELETE CASCADE,
            file_name TEXT NOT NULL,
            label TEXT,
            size_bytes INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            blob_key TEXT,
            local_path TEXT,
            added_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sync_state TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_attachments_document
            ON file_attachments(document_sync_id)",
        "CREATE INDEX IF NOT EXISTS idx_attachments_state ON file_attachments(sync_state)",
        "CREATE TABLE IF NOT EXISTS tombstones (
            sync_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            deleted_at INTEGER NOT NULL,
            owner_identity TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at)",
        "CREATE TABLE IF NOT EXISTS sync_queue (
            sync_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            last_error TEXT,
            PRIMARY KEY (sync_id, operation)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_due ON sync_queue(next_attempt_at)",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_id_is_primary_key() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO documents (sync_id, title, created_at, updated_at, sync_state)
             VALUES ('dup', 'a', 1, 1, 'local')",
            (),
        )
        .await
        .unwrap();

        let duplicate = conn
            .execute(
                "INSERT INTO documents (sync_id, title, created_at, updated_at, sync_state)
                 VALUES ('dup', 'b', 2, 2, 'local')",
                (),
            )
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_coalesces_on_primary_key() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for _ in 0..2 {
            conn.execute(
                "INSERT INTO sync_queue (sync_id, operation, next_attempt_at, enqueued_at)
                 VALUES ('id-1', 'upload', 0, 0)
                 ON CONFLICT(sync_id, operation) DO NOTHING",
                (),
            )
            .await
            .unwrap();
        }

        let mut rows = conn
            .query("SELECT COUNT(*) FROM sync_queue", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);
    }
}
