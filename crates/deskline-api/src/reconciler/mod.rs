//! Server reconciler: authorizes and applies each operation against the
//! authoritative store and returns the canonical rows.
//!
//! Storage failures never escape a single operation. They are logged and
//! turned into a fallback result, so one bad operation cannot abort the
//! rest of a batch.

mod macro_chain;
mod organization;
mod tag;
mod tag_value;
mod ticket;

use deskline_core::models::{AnyRow, OrganizationId, Role, SyncRow, Table};
use deskline_core::protocol::{ChangeEvent, Operation, SyncResponse};
use deskline_core::session::fingerprint;
use libsql::Connection;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::AppError;
use crate::realtime::ChangeFeed;
use crate::store::rows::{fetch_any, organization_of, StoredRow};
use crate::store::{Store, StoreResult};

/// Result of reconciling one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Caller cannot see the entity, or a create was rejected
    NotFound,
    /// Visible, but the caller's role may not change it; the row is echoed
    Forbidden(AnyRow),
    /// Tombstone echo, rejected reference or storage fallback
    Unchanged(AnyRow),
    /// Written; the primary row first, then any cascaded rows
    Applied(Vec<AnyRow>),
}

impl Reconciled {
    pub fn rows(&self) -> &[AnyRow] {
        match self {
            Self::NotFound => &[],
            Self::Forbidden(row) | Self::Unchanged(row) => std::slice::from_ref(row),
            Self::Applied(rows) => rows,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Unchanged(_) => "unchanged",
            Self::Applied(_) => "applied",
        }
    }

    fn applied(row: impl Into<AnyRow>) -> Self {
        Self::Applied(vec![row.into()])
    }

    fn unchanged(row: impl Into<AnyRow>) -> Self {
        Self::Unchanged(row.into())
    }

    fn forbidden(row: impl Into<AnyRow>) -> Self {
        Self::Forbidden(row.into())
    }
}

/// Per-batch tallies, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub response: SyncResponse,
    pub applied: usize,
    pub unchanged: usize,
    pub forbidden: usize,
    pub not_found: usize,
}

impl BatchReport {
    fn record(&mut self, result: &Reconciled) -> Result<(), AppError> {
        match result {
            Reconciled::NotFound => self.not_found += 1,
            Reconciled::Forbidden(_) => self.forbidden += 1,
            Reconciled::Unchanged(_) => self.unchanged += 1,
            Reconciled::Applied(_) => self.applied += 1,
        }
        for row in result.rows() {
            self.response.insert(row)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    feed: ChangeFeed,
}

impl Reconciler {
    pub const fn new(store: Store, feed: ChangeFeed) -> Self {
        Self { store, feed }
    }

    /// Apply operations in order and merge every returned row into one
    /// response, keeping the newest copy of each row.
    pub async fn apply_batch(
        &self,
        caller: &Caller,
        operations: &[Operation],
    ) -> Result<BatchReport, AppError> {
        let mut report = BatchReport::default();
        for operation in operations {
            let result = self.apply(caller, operation).await;
            report.record(&result)?;
        }
        Ok(report)
    }

    /// Like [`Self::apply_batch`], decoding each operation on its own. An
    /// operation that does not decode yields no row and the rest of the
    /// batch still runs.
    pub async fn apply_encoded_batch(
        &self,
        caller: &Caller,
        operations: &[serde_json::Value],
    ) -> Result<BatchReport, AppError> {
        let mut report = BatchReport::default();
        for (index, encoded) in operations.iter().enumerate() {
            let result = match Operation::deserialize(encoded) {
                Ok(operation) => self.apply(caller, &operation).await,
                Err(error) => {
                    tracing::debug!(index, error = %error, "Rejected undecodable operation");
                    Reconciled::NotFound
                }
            };
            report.record(&result)?;
        }
        Ok(report)
    }

    /// Authorize and apply one operation
    pub async fn apply(&self, caller: &Caller, operation: &Operation) -> Reconciled {
        if let Err(error) = operation.validate() {
            tracing::debug!(kind = operation.kind(), error = %error, "Rejected invalid operation");
            if operation.is_create() {
                return Reconciled::NotFound;
            }
            let db = self.store.lock().await;
            return read_visible(db.connection(), caller, operation).await;
        }

        let mut db = self.store.lock().await;
        let now = db.next_stamp();
        let conn = db.connection();

        let tx = match conn.transaction().await {
            Ok(tx) => tx,
            Err(error) => {
                tracing::warn!(kind = operation.kind(), error = %error, "Could not open transaction");
                return Reconciled::NotFound;
            }
        };

        let result = match dispatch(&tx, caller, operation, now).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(
                    kind = operation.kind(),
                    user = %fingerprint(&caller.user_id),
                    error = %error,
                    "Operation failed in storage; returning prior state"
                );
                tx.rollback().await.ok();
                return read_visible(conn, caller, operation).await;
            }
        };

        if let Err(error) = tx.commit().await {
            tracing::warn!(kind = operation.kind(), error = %error, "Commit failed; returning prior state");
            return read_visible(conn, caller, operation).await;
        }

        tracing::debug!(
            kind = operation.kind(),
            result = result.label(),
            rows = result.rows().len(),
            "Reconciled operation"
        );

        if let Reconciled::Applied(rows) = &result {
            self.publish(conn, operation, rows).await;
        }
        result
    }

    async fn publish(&self, conn: &Connection, operation: &Operation, rows: &[AnyRow]) {
        let Some(primary) = rows.first() else {
            return;
        };
        // Cascaded rows always share the primary row's organization
        let organization_id = match organization_of(conn, primary).await {
            Ok(Some(organization_id)) => organization_id,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(error = %error, "Could not resolve organization for realtime publish");
                return;
            }
        };

        for (index, row) in rows.iter().enumerate() {
            let value = match row.to_value() {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(error = %error, "Could not encode row for realtime publish");
                    continue;
                }
            };
            let event = if index == 0 && operation.is_create() {
                ChangeEvent::Insert {
                    table: row.table(),
                    row: value,
                }
            } else {
                ChangeEvent::Update {
                    table: row.table(),
                    row: value,
                }
            };
            self.feed.publish(organization_id, event);
        }
    }
}

async fn dispatch(
    conn: &Connection,
    caller: &Caller,
    operation: &Operation,
    now: i64,
) -> StoreResult<Reconciled> {
    match operation {
        Operation::UpdateOrganization(op) => organization::rename(conn, caller, op, now).await,
        Operation::CreateTicket(op) => ticket::create(conn, caller, op, now).await,
        Operation::UpdateTicket(op) => ticket::update(conn, caller, op, now).await,
        Operation::DeleteTicket(op) => ticket::delete(conn, caller, op.id, now).await,
        Operation::CreateTagKey(op) => tag::create_key(conn, caller, op, now).await,
        Operation::UpdateTagKey(op) => tag::rename_key(conn, caller, op, now).await,
        Operation::DeleteTagKey(op) => tag::delete_key(conn, caller, op.id, now).await,
        Operation::CreateTagEnumOption(op) => tag::create_option(conn, caller, op, now).await,
        Operation::UpdateTagEnumOption(op) => tag::update_option(conn, caller, op, now).await,
        Operation::DeleteTagEnumOption(op) => tag::delete_option(conn, caller, op.id, now).await,
        Operation::CreateTicketTagEnumValue(op) => tag_value::create(conn, caller, op, now).await,
        Operation::UpdateTicketTagEnumValue(op) => tag_value::update(conn, caller, op, now).await,
        Operation::DeleteTicketTagEnumValue(op) => {
            tag_value::delete(conn, caller, op.id, now).await
        }
        Operation::CreateMacroChain(op) => macro_chain::create(conn, caller, op, now).await,
        Operation::UpdateMacroChain(op) => macro_chain::update(conn, caller, op, now).await,
        Operation::DeleteMacroChain(op) => macro_chain::delete(conn, caller, op.id, now).await,
    }
}

/// The caller's role in `organization_id`, if any
fn role_in(caller: &Caller, organization_id: OrganizationId) -> Option<Role> {
    caller.memberships.role_in(&organization_id)
}

/// The operation's target row as it stands, if the caller can see it
async fn read_visible(conn: &Connection, caller: &Caller, operation: &Operation) -> Reconciled {
    let (table, id) = operation.target();
    match visible_row(conn, caller, table, id).await {
        Ok(Some(row)) => Reconciled::Unchanged(row),
        Ok(None) => Reconciled::NotFound,
        Err(error) => {
            tracing::warn!(kind = operation.kind(), error = %error, "Fallback read failed");
            Reconciled::NotFound
        }
    }
}

async fn visible_row(
    conn: &Connection,
    caller: &Caller,
    table: Table,
    id: Uuid,
) -> StoreResult<Option<AnyRow>> {
    let Some(row) = fetch_any(conn, table, id).await? else {
        return Ok(None);
    };
    let organization_id = organization_of(conn, &row).await?;
    let visible = organization_id.is_some_and(|org| role_in(caller, org).is_some());
    Ok(visible.then_some(row))
}

/// Finish a create whose insert used `ON CONFLICT(id) DO NOTHING RETURNING`.
///
/// No returned row means the id already exists: the existing row is echoed
/// when the caller can see it. Any other insert failure yields a tombstone
/// carrying the submitted fields, so the caller never loses track of its id
/// and never mistakes the failed write for a live row.
async fn finish_create<T: StoredRow>(
    conn: &Connection,
    caller: &Caller,
    id: Uuid,
    inserted: StoreResult<Option<T>>,
    submitted: impl FnOnce() -> T,
    now: i64,
) -> StoreResult<Reconciled> {
    match inserted {
        Ok(Some(row)) => Ok(Reconciled::applied(row)),
        Ok(None) => match visible_row(conn, caller, T::TABLE, id).await? {
            Some(existing) => {
                tracing::debug!(table = %T::TABLE, id = %id, "Duplicate create; echoing existing row");
                Ok(Reconciled::Unchanged(existing))
            }
            None => Ok(Reconciled::NotFound),
        },
        Err(error) => {
            tracing::warn!(table = %T::TABLE, id = %id, error = %error, "Insert failed; returning tombstone");
            let row: AnyRow = submitted().into();
            let mut value = row.to_value()?;
            value["created_at"] = now.into();
            value["updated_at"] = now.into();
            value["deleted_at"] = now.into();
            Ok(Reconciled::Unchanged(AnyRow::from_value(T::TABLE, value)?))
        }
    }
}

/// Finish an update/delete issued as one conditional statement.
///
/// Zero affected rows or a failed statement fall back to the row as read.
fn finish_update<T: StoredRow>(existing: T, updated: StoreResult<Option<T>>) -> Reconciled {
    match updated {
        Ok(Some(row)) => Reconciled::applied(row),
        Ok(None) => Reconciled::unchanged(existing),
        Err(error) => {
            tracing::warn!(
                table = %T::TABLE,
                id = %existing.row_id(),
                error = %error,
                "Conditional write failed; returning prior state"
            );
            Reconciled::unchanged(existing)
        }
    }
}

/// `SET` fragment that tombstones a row and advances its stamp; `?1` is now
const TOMBSTONE_SET: &str =
    "deleted_at = MAX(?1, updated_at + 1), updated_at = MAX(?1, updated_at + 1)";
