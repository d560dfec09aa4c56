//! Mutation outbox repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::Result;
use crate::models::MutationRecord;
use crate::protocol::Operation;
use libsql::Connection;

/// Trait for outbox storage operations (async)
#[allow(async_fn_in_trait)]
pub trait OutboxRepository {
    /// Append an unsynced record; `enqueued_at` is kept strictly increasing
    async fn enqueue(&self, operation: &Operation, now: i64) -> Result<MutationRecord>;

    /// Unsynced records in delivery order, at most `limit`
    async fn pending_batch(&self, limit: usize) -> Result<Vec<MutationRecord>>;

    /// Flip matching records to synced. Unknown or already-synced ids are ignored.
    async fn mark_synced(&self, local_ids: &[i64], now: i64) -> Result<u64>;

    /// Count a failed delivery attempt against each record
    async fn record_failure(&self, local_ids: &[i64], error: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;

    /// Housekeeping: physically delete records synced before `before`
    async fn prune_synced(&self, before: i64) -> Result<u64>;
}

/// libSQL implementation of `OutboxRepository`
pub struct LibSqlOutboxRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &libsql::Row) -> Result<MutationRecord> {
        let raw: String = row.get(1)?;
        Ok(MutationRecord {
            local_id: row.get(0)?,
            operation: serde_json::from_str(&raw)?,
            enqueued_at: row.get(2)?,
            synced: row.get::<i32>(3)? != 0,
            attempts: row.get(4)?,
        })
    }
}

impl OutboxRepository for LibSqlOutboxRepository<'_> {
    async fn enqueue(&self, operation: &Operation, now: i64) -> Result<MutationRecord> {
        let payload = serde_json::to_string(operation)?;

        let mut rows = self
            .conn
            .query(
                "INSERT INTO mutations (kind, operation, enqueued_at)
                 VALUES (?, ?, MAX(?, (SELECT COALESCE(MAX(enqueued_at) + 1, 0) FROM mutations)))
                 RETURNING local_id, operation, enqueued_at, synced, attempts",
                libsql::params![operation.kind(), payload, now],
            )
            .await?;

        let row = rows.next().await?.ok_or_else(|| {
            crate::error::Error::Database("outbox insert returned no row".to_string())
        })?;
        let record = Self::parse_record(&row)?;
        tracing::debug!(
            local_id = record.local_id,
            kind = operation.kind(),
            "Enqueued mutation"
        );
        Ok(record)
    }

    async fn pending_batch(&self, limit: usize) -> Result<Vec<MutationRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT local_id, operation, enqueued_at, synced, attempts
                 FROM mutations
                 WHERE synced = 0
                 ORDER BY enqueued_at ASC, local_id ASC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn mark_synced(&self, local_ids: &[i64], now: i64) -> Result<u64> {
        let mut flipped = 0;
        for local_id in local_ids {
            flipped += self
                .conn
                .execute(
                    "UPDATE mutations SET synced = 1, synced_at = ?
                     WHERE local_id = ? AND synced = 0",
                    [now, *local_id],
                )
                .await?;
        }
        Ok(flipped)
    }

    async fn record_failure(&self, local_ids: &[i64], error: &str) -> Result<()> {
        for local_id in local_ids {
            self.conn
                .execute(
                    "UPDATE mutations SET attempts = attempts + 1, last_error = ?
                     WHERE local_id = ? AND synced = 0",
                    libsql::params![error, *local_id],
                )
                .await?;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM mutations WHERE synced = 0", ())
            .await?;
        let count = if let Some(row) = rows.next().await? {
            row.get::<u64>(0)?
        } else {
            0
        };
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    async fn prune_synced(&self, before: i64) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM mutations WHERE synced = 1 AND synced_at < ?",
                [before],
            )
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{OrganizationId, TicketId, TicketStatus};
    use crate::protocol::{CreateTicket, DeleteRow, UpdateTicket};

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn create_ticket(id: TicketId) -> Operation {
        Operation::CreateTicket(CreateTicket {
            id,
            organization_id: OrganizationId::new(),
            title: "Laptop won't boot".to_string(),
            body: String::new(),
            status: TicketStatus::Open,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_orders_by_enqueued_at() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        let id = TicketId::new();

        // Same wall-clock millisecond for every write
        repo.enqueue(&create_ticket(id), 1_000).await.unwrap();
        repo.enqueue(
            &Operation::UpdateTicket(UpdateTicket {
                id,
                title: Some("Laptop boots slowly".to_string()),
                ..UpdateTicket::default()
            }),
            1_000,
        )
        .await
        .unwrap();
        repo.enqueue(&Operation::DeleteTicket(DeleteRow { id }), 1_000)
            .await
            .unwrap();

        let batch = repo.pending_batch(10).await.unwrap();
        let kinds: Vec<_> = batch.iter().map(|r| r.operation.kind()).collect();
        assert_eq!(kinds, ["create_ticket", "update_ticket", "delete_ticket"]);
        assert!(batch.windows(2).all(|w| w[0].enqueued_at < w[1].enqueued_at));
        assert!(batch.iter().all(|r| !r.synced && r.attempts == 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_synced_is_idempotent() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let first = repo.enqueue(&create_ticket(TicketId::new()), 1).await.unwrap();
        let second = repo.enqueue(&create_ticket(TicketId::new()), 2).await.unwrap();

        assert_eq!(repo.mark_synced(&[], 10).await.unwrap(), 0);
        assert_eq!(repo.mark_synced(&[first.local_id], 10).await.unwrap(), 1);
        // Partially overlapping and unknown ids
        assert_eq!(
            repo.mark_synced(&[first.local_id, second.local_id, 999], 11)
                .await
                .unwrap(),
            1
        );
        assert_eq!(repo.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_failure_keeps_records_pending() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let record = repo.enqueue(&create_ticket(TicketId::new()), 1).await.unwrap();
        repo.record_failure(&[record.local_id], "connection refused")
            .await
            .unwrap();
        repo.record_failure(&[record.local_id], "connection refused")
            .await
            .unwrap();

        let batch = repo.pending_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prune_only_removes_old_synced_records() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let synced = repo.enqueue(&create_ticket(TicketId::new()), 1).await.unwrap();
        repo.enqueue(&create_ticket(TicketId::new()), 2).await.unwrap();
        repo.mark_synced(&[synced.local_id], 100).await.unwrap();

        assert_eq!(repo.prune_synced(50).await.unwrap(), 0);
        assert_eq!(repo.prune_synced(101).await.unwrap(), 1);
        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }
}
