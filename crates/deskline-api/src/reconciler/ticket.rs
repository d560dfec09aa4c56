use deskline_core::models::{Role, SyncRow, Ticket, TicketId};
use deskline_core::protocol::{CreateTicket, UpdateTicket};
use libsql::Connection;

use super::{finish_create, finish_update, role_in, Reconciled, TOMBSTONE_SET};
use crate::auth::Caller;
use crate::store::rows::{fetch, optional_text, query_optional, StoredRow};
use crate::store::StoreResult;

/// Staff may edit any ticket; customers only their own
pub(super) fn can_edit(caller: &Caller, role: Role, ticket: &Ticket) -> bool {
    role.is_staff() || ticket.created_by == caller.user_id
}

pub(super) async fn create(
    conn: &Connection,
    caller: &Caller,
    op: &CreateTicket,
    now: i64,
) -> StoreResult<Reconciled> {
    if role_in(caller, op.organization_id).is_none() {
        return Ok(Reconciled::NotFound);
    }

    let title = op.title.trim();
    let inserted = query_optional::<Ticket>(
        conn,
        &format!(
            "INSERT INTO tickets (id, organization_id, title, body, status, created_by, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, NULL)
             ON CONFLICT(id) DO NOTHING
             RETURNING {}",
            Ticket::COLUMNS
        ),
        libsql::params![
            op.id.to_string(),
            op.organization_id.to_string(),
            title,
            op.body.as_str(),
            op.status.as_str(),
            caller.user_id.as_str(),
            now,
        ],
    )
    .await;

    let submitted = || Ticket {
        id: op.id,
        organization_id: op.organization_id,
        title: title.to_string(),
        body: op.body.clone(),
        status: op.status,
        created_by: caller.user_id.clone(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    finish_create(conn, caller, op.id.as_uuid(), inserted, submitted, now).await
}

pub(super) async fn update(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateTicket,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(ticket) = fetch::<Ticket>(conn, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, ticket.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if ticket.is_deleted() {
        return Ok(Reconciled::unchanged(ticket));
    }
    if !can_edit(caller, role, &ticket) {
        return Ok(Reconciled::forbidden(ticket));
    }

    let updated = query_optional::<Ticket>(
        conn,
        &format!(
            "UPDATE tickets
             SET title = COALESCE(?3, title),
                 body = COALESCE(?4, body),
                 status = COALESCE(?5, status),
                 updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            Ticket::COLUMNS
        ),
        libsql::params![
            now,
            op.id.to_string(),
            optional_text(op.title.as_deref().map(str::trim)),
            optional_text(op.body.as_deref()),
            optional_text(op.status.map(|status| status.as_str())),
        ],
    )
    .await;
    Ok(finish_update(ticket, updated))
}

/// Soft delete. Enum values on the ticket are left as they are; they stay
/// reachable only through a live ticket.
pub(super) async fn delete(
    conn: &Connection,
    caller: &Caller,
    id: TicketId,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(ticket) = fetch::<Ticket>(conn, id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, ticket.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if ticket.is_deleted() {
        return Ok(Reconciled::unchanged(ticket));
    }
    if !can_edit(caller, role, &ticket) {
        return Ok(Reconciled::forbidden(ticket));
    }

    let deleted = query_optional::<Ticket>(
        conn,
        &format!(
            "UPDATE tickets SET {TOMBSTONE_SET}
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            Ticket::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await;
    Ok(finish_update(ticket, deleted))
}
