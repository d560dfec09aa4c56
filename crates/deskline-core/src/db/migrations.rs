//! Local replica migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_REPLICA_AND_OUTBOX).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_STALE_DISCARD_GUARD).await?;
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

/// Version 1: generic replica rows, the mutation outbox, and local metadata
const V1_REPLICA_AND_OUTBOX: [&str; 9] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // One row per (table, id); `data` holds the full JSON row
    "CREATE TABLE IF NOT EXISTS replica_rows (
        table_name TEXT NOT NULL,
        id TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER,
        origin TEXT NOT NULL CHECK (origin IN ('local', 'server')),
        data TEXT NOT NULL,
        PRIMARY KEY (table_name, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_replica_rows_watermark
        ON replica_rows(table_name, origin, updated_at DESC)",
    "CREATE TABLE IF NOT EXISTS mutations (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        operation TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        synced_at INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_mutations_pending ON mutations(synced, enqueued_at)",
    // Local-only key/value metadata (signed-in user, last pull time)
    "CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS stale_discards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        row_id TEXT NOT NULL,
        local_updated_at INTEGER NOT NULL,
        incoming_updated_at INTEGER NOT NULL,
        discarded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_stale_discards_discarded_at
        ON stale_discards(discarded_at DESC)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: keep the newer server copy when two server payloads race.
///
/// Optimistic local rows never trigger the guard, and a canonical row always
/// replaces a local one.
const V2_STALE_DISCARD_GUARD: [&str; 2] = [
    "CREATE TRIGGER IF NOT EXISTS replica_rows_stale_guard BEFORE UPDATE ON replica_rows
     FOR EACH ROW
     WHEN NEW.origin = 'server'
      AND OLD.origin = 'server'
      AND NEW.updated_at < OLD.updated_at
     BEGIN
         INSERT INTO stale_discards (
             table_name,
             row_id,
             local_updated_at,
             incoming_updated_at,
             discarded_at
         ) VALUES (
             OLD.table_name,
             OLD.id,
             OLD.updated_at,
             NEW.updated_at,
             CAST(strftime('%s','now') AS INTEGER) * 1000
         );
         SELECT RAISE(IGNORE);
     END",
    "INSERT INTO schema_version (version) VALUES (2)",
];

/// Run one migration's statements inside a transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

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

    tracing::info!("Migrated local replica to version {version} (target {CURRENT_VERSION})");
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
    async fn test_stale_guard_discards_older_server_copy() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO replica_rows (table_name, id, updated_at, origin, data)
             VALUES ('tickets', 'a', 20, 'server', '{}')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "UPDATE replica_rows SET updated_at = 10, data = '{\"old\":true}'
             WHERE table_name = 'tickets' AND id = 'a'",
            (),
        )
        .await
        .unwrap();

        let mut rows = conn
            .query(
                "SELECT updated_at, (SELECT COUNT(*) FROM stale_discards) FROM replica_rows",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 20);
        assert_eq!(row.get::<i64>(1).unwrap(), 1);
    }
}
