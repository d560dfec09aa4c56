//! Shared replica service wrapper used by the sync engine, pull, realtime and the CLI.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::optimistic;
use crate::db::{
    Database, LibSqlOutboxRepository, LibSqlReplicaRepository, OutboxRepository,
    ReplicaRepository, RowOrigin,
};
use crate::models::{MutationRecord, OrganizationId, StaleDiscard, SyncRow, Table};
use crate::protocol::{ChangeEvent, Operation, SyncResponse, TableRows};
use crate::util::now_millis;
use crate::Result;

const META_USER_ID: &str = "user_id";

/// Thread-safe service over the local replica and its outbox.
///
/// Every method takes the connection lock for its whole duration, so a local
/// mutation's optimistic write and its outbox record land together.
#[derive(Clone)]
pub struct ReplicaService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl ReplicaService {
    /// Open a replica at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened local replica at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory replica (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// Apply `operation` optimistically and append it to the outbox.
    ///
    /// Both writes share one transaction; the operation is validated first so
    /// nothing malformed is ever recorded.
    pub async fn apply_local(&self, operation: Operation, actor: &str) -> Result<MutationRecord> {
        operation.validate()?;
        let now = now_millis();

        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let (table, id) = operation.target();
        {
            let replica = LibSqlReplicaRepository::new(&tx);
            let existing = replica.get(table, id).await?;
            if let Some(row) = optimistic::project(&operation, existing.as_ref(), actor, now)? {
                replica.upsert(table, &row, RowOrigin::Local).await?;
            }
        }
        let record = LibSqlOutboxRepository::new(&tx)
            .enqueue(&operation, now)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// Oldest unsynced outbox records, at most `limit`.
    pub async fn pending_batch(&self, limit: usize) -> Result<Vec<MutationRecord>> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .pending_batch(limit)
            .await
    }

    /// Overwrite the replica with a sync response and mark the delivered
    /// records synced, atomically.
    pub async fn apply_sync_response(
        &self,
        response: &SyncResponse,
        delivered: &[i64],
    ) -> Result<usize> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let applied = Self::upsert_server_rows(&tx, response).await?;
        LibSqlOutboxRepository::new(&tx)
            .mark_synced(delivered, now_millis())
            .await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Upsert pulled rows.
    pub async fn apply_pull(&self, rows: &TableRows) -> Result<usize> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let applied = Self::upsert_server_rows(&tx, rows).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn upsert_server_rows(conn: &libsql::Connection, rows: &TableRows) -> Result<usize> {
        let replica = LibSqlReplicaRepository::new(conn);
        let mut applied = 0;
        for (table, row) in rows.iter() {
            replica.upsert(table, row, RowOrigin::Server).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply one realtime event. Deletes remove the row outright.
    pub async fn apply_change_event(&self, event: &ChangeEvent) -> Result<()> {
        let db = self.db.lock().await;
        let replica = LibSqlReplicaRepository::new(db.connection());
        match event {
            ChangeEvent::Insert { table, row } | ChangeEvent::Update { table, row } => {
                replica.upsert(*table, row, RowOrigin::Server).await
            }
            ChangeEvent::Delete { table, id } => {
                replica.remove(*table, *id).await?;
                Ok(())
            }
        }
    }

    /// Record a failed delivery attempt for each record.
    pub async fn record_failure(&self, local_ids: &[i64], error: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .record_failure(local_ids, error)
            .await
    }

    /// Per-table watermark over server-delivered rows.
    pub async fn watermarks(&self, tables: &[Table]) -> Result<BTreeMap<Table, i64>> {
        let db = self.db.lock().await;
        let replica = LibSqlReplicaRepository::new(db.connection());
        let mut watermarks = BTreeMap::new();
        for table in tables {
            watermarks.insert(*table, replica.watermark(*table).await?);
        }
        Ok(watermarks)
    }

    /// Fetch a typed row by id, tombstones included.
    pub async fn get<T: SyncRow>(&self, id: impl Into<Uuid>) -> Result<Option<T>> {
        let db = self.db.lock().await;
        let replica = LibSqlReplicaRepository::new(db.connection());
        replica
            .get(T::TABLE, id.into())
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// List typed rows newest-first.
    pub async fn list<T: SyncRow>(&self, include_deleted: bool) -> Result<Vec<T>> {
        let db = self.db.lock().await;
        let replica = LibSqlReplicaRepository::new(db.connection());
        replica
            .list(T::TABLE, include_deleted)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .pending_count()
            .await
    }

    /// Physically delete outbox records synced before `before` (Unix ms).
    pub async fn prune_synced(&self, before: i64) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlOutboxRepository::new(db.connection())
            .prune_synced(before)
            .await
    }

    /// List recently discarded stale server rows.
    pub async fn list_stale_discards(&self, limit: usize) -> Result<Vec<StaleDiscard>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .list_stale_discards(limit)
            .await
    }

    /// Drop every cached row and outbox record.
    pub async fn reset(&self) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        LibSqlReplicaRepository::new(&tx).clear().await?;
        tx.commit().await?;
        tracing::info!("Cleared local replica");
        Ok(())
    }

    /// User the replica was last populated for.
    pub async fn user_id(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .get_meta(META_USER_ID)
            .await
    }

    pub async fn set_user_id(&self, user_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .set_meta(META_USER_ID, user_id)
            .await
    }

    /// Organizations `table` was last pulled for, if recorded.
    pub async fn pulled_organizations(
        &self,
        table: Table,
    ) -> Result<Option<BTreeSet<OrganizationId>>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .get_meta(&organizations_key(table))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(crate::Error::from))
            .transpose()
    }

    pub async fn set_pulled_organizations(
        &self,
        table: Table,
        organizations: &BTreeSet<OrganizationId>,
    ) -> Result<()> {
        let raw = serde_json::to_string(organizations)?;
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .set_meta(&organizations_key(table), &raw)
            .await
    }
}

fn organizations_key(table: Table) -> String {
    format!("organizations:{table}")
}
