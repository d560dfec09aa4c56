//! Enum tag values on tickets.
//!
//! Permission follows the owning ticket. The referenced option must be live
//! and belong to the value's tag key, and the key must be a live enum key in
//! the ticket's organization.

use deskline_core::models::{
    Role, SyncRow, TagEnumOption, TagEnumOptionId, TagKey, TagKeyId, TagKind, Ticket,
    TicketTagEnumValue, TicketTagEnumValueId,
};
use deskline_core::protocol::{CreateTicketTagEnumValue, UpdateTicketTagEnumValue};
use libsql::Connection;

use super::{finish_create, finish_update, role_in, ticket, Reconciled, TOMBSTONE_SET};
use crate::auth::Caller;
use crate::store::rows::{fetch, query_optional, StoredRow};
use crate::store::StoreResult;

/// Whether `option_id` is a live option of the live enum key `tag_key_id`
/// inside `ticket`'s organization
async fn reference_is_valid(
    conn: &Connection,
    ticket: &Ticket,
    tag_key_id: TagKeyId,
    option_id: TagEnumOptionId,
) -> StoreResult<bool> {
    let Some(key) = fetch::<TagKey>(conn, tag_key_id).await? else {
        return Ok(false);
    };
    if key.is_deleted() || key.kind != TagKind::Enum || key.organization_id != ticket.organization_id
    {
        return Ok(false);
    }
    let Some(option) = fetch::<TagEnumOption>(conn, option_id).await? else {
        return Ok(false);
    };
    Ok(!option.is_deleted() && option.tag_key_id == tag_key_id)
}

pub(super) async fn create(
    conn: &Connection,
    caller: &Caller,
    op: &CreateTicketTagEnumValue,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(owner) = fetch::<Ticket>(conn, op.ticket_id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, owner.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if owner.is_deleted() || !ticket::can_edit(caller, role, &owner) {
        return Ok(Reconciled::NotFound);
    }
    if !reference_is_valid(conn, &owner, op.tag_key_id, op.enum_option_id).await? {
        tracing::debug!(ticket = %owner.id, tag_key = %op.tag_key_id, "Rejected dangling tag value");
        return Ok(Reconciled::NotFound);
    }

    let inserted = query_optional::<TicketTagEnumValue>(
        conn,
        &format!(
            "INSERT INTO ticket_tag_enum_values (id, ticket_id, tag_key_id, enum_option_id, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL)
             ON CONFLICT(id) DO NOTHING
             RETURNING {}",
            TicketTagEnumValue::COLUMNS
        ),
        libsql::params![
            op.id.to_string(),
            op.ticket_id.to_string(),
            op.tag_key_id.to_string(),
            op.enum_option_id.to_string(),
            now,
        ],
    )
    .await;

    let submitted = || TicketTagEnumValue {
        id: op.id,
        ticket_id: op.ticket_id,
        tag_key_id: op.tag_key_id,
        enum_option_id: op.enum_option_id,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    finish_create(conn, caller, op.id.as_uuid(), inserted, submitted, now).await
}

/// Load a value with its owning ticket and the caller's role there
async fn value_with_owner(
    conn: &Connection,
    caller: &Caller,
    id: TicketTagEnumValueId,
) -> StoreResult<Option<(TicketTagEnumValue, Ticket, Role)>> {
    let Some(value) = fetch::<TicketTagEnumValue>(conn, id).await? else {
        return Ok(None);
    };
    let Some(owner) = fetch::<Ticket>(conn, value.ticket_id).await? else {
        return Ok(None);
    };
    Ok(role_in(caller, owner.organization_id).map(|role| (value, owner, role)))
}

pub(super) async fn update(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateTicketTagEnumValue,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some((value, owner, role)) = value_with_owner(conn, caller, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    if value.is_deleted() || owner.is_deleted() {
        return Ok(Reconciled::unchanged(value));
    }
    if !ticket::can_edit(caller, role, &owner) {
        return Ok(Reconciled::forbidden(value));
    }
    if !reference_is_valid(conn, &owner, value.tag_key_id, op.enum_option_id).await? {
        tracing::debug!(value = %value.id, "Rejected tag value pointing at a foreign option");
        return Ok(Reconciled::unchanged(value));
    }

    let updated = query_optional::<TicketTagEnumValue>(
        conn,
        &format!(
            "UPDATE ticket_tag_enum_values
             SET enum_option_id = ?3, updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TicketTagEnumValue::COLUMNS
        ),
        libsql::params![now, op.id.to_string(), op.enum_option_id.to_string()],
    )
    .await;
    Ok(finish_update(value, updated))
}

pub(super) async fn delete(
    conn: &Connection,
    caller: &Caller,
    id: TicketTagEnumValueId,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some((value, owner, role)) = value_with_owner(conn, caller, id).await? else {
        return Ok(Reconciled::NotFound);
    };
    if value.is_deleted() {
        return Ok(Reconciled::unchanged(value));
    }
    if !ticket::can_edit(caller, role, &owner) {
        return Ok(Reconciled::forbidden(value));
    }

    let deleted = query_optional::<TicketTagEnumValue>(
        conn,
        &format!(
            "UPDATE ticket_tag_enum_values SET {TOMBSTONE_SET}
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TicketTagEnumValue::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await;
    Ok(finish_update(value, deleted))
}
