//! Local replica repository: cached copies of every synchronized row

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{RowHeader, StaleDiscard, Table};
use libsql::{Connection, Value};
use uuid::Uuid;

/// Where a replica row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrigin {
    /// Optimistic write not yet confirmed by the server
    Local,
    /// Canonical copy delivered by sync, pull or realtime
    Server,
}

impl RowOrigin {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Server => "server",
        }
    }
}

/// Trait for replica storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ReplicaRepository {
    /// Upsert a row by id.
    ///
    /// A server row older than the server row already held is discarded and
    /// logged; local rows always apply.
    async fn upsert(&self, table: Table, row: &serde_json::Value, origin: RowOrigin)
        -> Result<()>;

    /// Get a row by id, tombstones included
    async fn get(&self, table: Table, id: Uuid) -> Result<Option<serde_json::Value>>;

    /// List rows of a table, newest first
    async fn list(&self, table: Table, include_deleted: bool) -> Result<Vec<serde_json::Value>>;

    /// Physically remove a row; returns whether it existed
    async fn remove(&self, table: Table, id: Uuid) -> Result<bool>;

    /// Highest server `updated_at` held for a table (0 when empty)
    async fn watermark(&self, table: Table) -> Result<i64>;

    /// Recently discarded stale server rows
    async fn list_stale_discards(&self, limit: usize) -> Result<Vec<StaleDiscard>>;

    /// Drop every row, outbox record and discard log entry
    async fn clear(&self) -> Result<()>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// libSQL implementation of `ReplicaRepository`
pub struct LibSqlReplicaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlReplicaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_data(raw: &str) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl ReplicaRepository for LibSqlReplicaRepository<'_> {
    async fn upsert(
        &self,
        table: Table,
        row: &serde_json::Value,
        origin: RowOrigin,
    ) -> Result<()> {
        let header = RowHeader::read(row)
            .map_err(|error| Error::InvalidInput(format!("row without lifecycle fields: {error}")))?;

        self.conn
            .execute(
                "INSERT INTO replica_rows (table_name, id, updated_at, deleted_at, origin, data)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(table_name, id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    deleted_at = excluded.deleted_at,
                    origin = excluded.origin,
                    data = excluded.data",
                libsql::params![
                    table.as_str(),
                    header.id.to_string(),
                    header.updated_at,
                    header.deleted_at.map_or(Value::Null, Value::Integer),
                    origin.as_str(),
                    serde_json::to_string(row)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, table: Table, id: Uuid) -> Result<Option<serde_json::Value>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data FROM replica_rows WHERE table_name = ? AND id = ?",
                [table.as_str().to_string(), id.to_string()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            Ok(Some(Self::parse_data(&raw)?))
        } else {
            Ok(None)
        }
    }

    async fn list(&self, table: Table, include_deleted: bool) -> Result<Vec<serde_json::Value>> {
        let sql = if include_deleted {
            "SELECT data FROM replica_rows WHERE table_name = ? ORDER BY updated_at DESC"
        } else {
            "SELECT data FROM replica_rows
             WHERE table_name = ? AND deleted_at IS NULL
             ORDER BY updated_at DESC"
        };
        let mut rows = self.conn.query(sql, [table.as_str()]).await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            out.push(Self::parse_data(&raw)?);
        }
        Ok(out)
    }

    async fn remove(&self, table: Table, id: Uuid) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM replica_rows WHERE table_name = ? AND id = ?",
                [table.as_str().to_string(), id.to_string()],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn watermark(&self, table: Table) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(updated_at), 0) FROM replica_rows
                 WHERE table_name = ? AND origin = 'server'",
                [table.as_str()],
            )
            .await?;

        let watermark = if let Some(row) = rows.next().await? {
            row.get::<i64>(0)?
        } else {
            0
        };
        Ok(watermark)
    }

    async fn list_stale_discards(&self, limit: usize) -> Result<Vec<StaleDiscard>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, table_name, row_id, local_updated_at, incoming_updated_at, discarded_at
                 FROM stale_discards
                 ORDER BY discarded_at DESC, id DESC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(StaleDiscard {
                id: row.get(0)?,
                table_name: row.get(1)?,
                row_id: row.get(2)?,
                local_updated_at: row.get(3)?,
                incoming_updated_at: row.get(4)?,
                discarded_at: row.get(5)?,
            });
        }
        Ok(out)
    }

    async fn clear(&self) -> Result<()> {
        for stmt in [
            "DELETE FROM replica_rows",
            "DELETE FROM mutations",
            "DELETE FROM stale_discards",
        ] {
            self.conn.execute(stmt, ()).await?;
        }
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_meta WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn row(id: Uuid, title: &str, updated_at: i64) -> serde_json::Value {
        json!({"id": id, "title": title, "updated_at": updated_at, "deleted_at": null})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_get() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());
        let id = Uuid::now_v7();

        repo.upsert(Table::Tickets, &row(id, "a", 10), RowOrigin::Server)
            .await
            .unwrap();
        repo.upsert(Table::Tickets, &row(id, "b", 11), RowOrigin::Server)
            .await
            .unwrap();

        let fetched = repo.get(Table::Tickets, id).await.unwrap().unwrap();
        assert_eq!(fetched["title"], "b");
        assert_eq!(repo.list(Table::Tickets, false).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_older_server_row_is_discarded() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());
        let id = Uuid::now_v7();

        repo.upsert(Table::Tickets, &row(id, "newer", 20), RowOrigin::Server)
            .await
            .unwrap();
        repo.upsert(Table::Tickets, &row(id, "older", 10), RowOrigin::Server)
            .await
            .unwrap();

        let fetched = repo.get(Table::Tickets, id).await.unwrap().unwrap();
        assert_eq!(fetched["title"], "newer");

        let discards = repo.list_stale_discards(10).await.unwrap();
        assert_eq!(discards.len(), 1);
        assert_eq!(discards[0].row_id, id.to_string());
        assert_eq!(discards[0].incoming_updated_at, 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_canonical_row_replaces_local_row_regardless_of_clock() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());
        let id = Uuid::now_v7();

        // Client clock ahead of the server
        repo.upsert(Table::Tickets, &row(id, "optimistic", 99), RowOrigin::Local)
            .await
            .unwrap();
        repo.upsert(Table::Tickets, &row(id, "canonical", 50), RowOrigin::Server)
            .await
            .unwrap();

        let fetched = repo.get(Table::Tickets, id).await.unwrap().unwrap();
        assert_eq!(fetched["title"], "canonical");
        assert!(repo.list_stale_discards(10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermark_ignores_local_rows() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());

        assert_eq!(repo.watermark(Table::Tickets).await.unwrap(), 0);

        repo.upsert(Table::Tickets, &row(Uuid::now_v7(), "s", 40), RowOrigin::Server)
            .await
            .unwrap();
        repo.upsert(Table::Tickets, &row(Uuid::now_v7(), "l", 90), RowOrigin::Local)
            .await
            .unwrap();

        assert_eq!(repo.watermark(Table::Tickets).await.unwrap(), 40);
        assert_eq!(repo.watermark(Table::TagKeys).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_hides_tombstones_unless_requested() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());
        let id = Uuid::now_v7();

        let tombstone = json!({"id": id, "updated_at": 5, "deleted_at": 5});
        repo.upsert(Table::MacroChains, &tombstone, RowOrigin::Server)
            .await
            .unwrap();

        assert!(repo.list(Table::MacroChains, false).await.unwrap().is_empty());
        assert_eq!(repo.list(Table::MacroChains, true).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_and_meta() {
        let db = setup().await;
        let repo = LibSqlReplicaRepository::new(db.connection());
        let id = Uuid::now_v7();

        repo.upsert(Table::Tickets, &row(id, "x", 1), RowOrigin::Server)
            .await
            .unwrap();
        assert!(repo.remove(Table::Tickets, id).await.unwrap());
        assert!(!repo.remove(Table::Tickets, id).await.unwrap());

        assert_eq!(repo.get_meta("user_id").await.unwrap(), None);
        repo.set_meta("user_id", "u-1").await.unwrap();
        assert_eq!(repo.get_meta("user_id").await.unwrap().as_deref(), Some("u-1"));
    }
}
