//! Tag keys and their enum options; admin only

use deskline_core::models::{
    AnyRow, Role, SyncRow, TagEnumOption, TagEnumOptionId, TagKey, TagKeyId, TagKind,
    TicketTagEnumValue,
};
use deskline_core::protocol::{CreateTagEnumOption, CreateTagKey, UpdateTagEnumOption, UpdateTagKey};
use libsql::Connection;

use super::{finish_create, finish_update, role_in, Reconciled, TOMBSTONE_SET};
use crate::auth::Caller;
use crate::store::rows::{fetch, optional_integer, optional_text, query_all, query_optional, StoredRow};
use crate::store::StoreResult;

pub(super) async fn create_key(
    conn: &Connection,
    caller: &Caller,
    op: &CreateTagKey,
    now: i64,
) -> StoreResult<Reconciled> {
    if role_in(caller, op.organization_id) != Some(Role::Admin) {
        return Ok(Reconciled::NotFound);
    }

    let name = op.name.trim();
    let inserted = query_optional::<TagKey>(
        conn,
        &format!(
            "INSERT INTO tag_keys (id, organization_id, name, kind, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL)
             ON CONFLICT(id) DO NOTHING
             RETURNING {}",
            TagKey::COLUMNS
        ),
        libsql::params![
            op.id.to_string(),
            op.organization_id.to_string(),
            name,
            op.kind.as_str(),
            now,
        ],
    )
    .await;

    let submitted = || TagKey {
        id: op.id,
        organization_id: op.organization_id,
        name: name.to_string(),
        kind: op.kind,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    finish_create(conn, caller, op.id.as_uuid(), inserted, submitted, now).await
}

pub(super) async fn rename_key(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateTagKey,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(key) = fetch::<TagKey>(conn, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, key.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if key.is_deleted() {
        return Ok(Reconciled::unchanged(key));
    }
    if role != Role::Admin {
        return Ok(Reconciled::forbidden(key));
    }

    let updated = query_optional::<TagKey>(
        conn,
        &format!(
            "UPDATE tag_keys SET name = ?3, updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TagKey::COLUMNS
        ),
        libsql::params![now, op.id.to_string(), op.name.trim()],
    )
    .await;
    Ok(finish_update(key, updated))
}

/// Tombstone the key together with its live options and ticket values
pub(super) async fn delete_key(
    conn: &Connection,
    caller: &Caller,
    id: TagKeyId,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(key) = fetch::<TagKey>(conn, id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, key.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if key.is_deleted() {
        return Ok(Reconciled::unchanged(key));
    }
    if role != Role::Admin {
        return Ok(Reconciled::forbidden(key));
    }

    let deleted = query_optional::<TagKey>(
        conn,
        &format!(
            "UPDATE tag_keys SET {TOMBSTONE_SET}
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TagKey::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await;
    let deleted = match deleted {
        Ok(Some(deleted)) => deleted,
        other => return Ok(finish_update(key, other)),
    };

    // Cascade failures roll back the whole operation
    let options = query_all::<TagEnumOption>(
        conn,
        &format!(
            "UPDATE tag_enum_options SET {TOMBSTONE_SET}
             WHERE tag_key_id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TagEnumOption::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await?;
    let values = query_all::<TicketTagEnumValue>(
        conn,
        &format!(
            "UPDATE ticket_tag_enum_values SET {TOMBSTONE_SET}
             WHERE tag_key_id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TicketTagEnumValue::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await?;

    tracing::debug!(
        tag_key = %id,
        options = options.len(),
        values = values.len(),
        "Cascaded tag key delete"
    );
    let mut rows: Vec<AnyRow> = vec![deleted.into()];
    rows.extend(options.into_iter().map(AnyRow::from));
    rows.extend(values.into_iter().map(AnyRow::from));
    Ok(Reconciled::Applied(rows))
}

/// Options may only be added to a live enum-kind key
pub(super) async fn create_option(
    conn: &Connection,
    caller: &Caller,
    op: &CreateTagEnumOption,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(key) = fetch::<TagKey>(conn, op.tag_key_id).await? else {
        return Ok(Reconciled::NotFound);
    };
    if role_in(caller, key.organization_id) != Some(Role::Admin) {
        return Ok(Reconciled::NotFound);
    }
    if key.is_deleted() || key.kind != TagKind::Enum {
        tracing::debug!(tag_key = %key.id, "Rejected option for unusable tag key");
        return Ok(Reconciled::NotFound);
    }

    let label = op.label.trim();
    let inserted = query_optional::<TagEnumOption>(
        conn,
        &format!(
            "INSERT INTO tag_enum_options (id, tag_key_id, label, position, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL)
             ON CONFLICT(id) DO NOTHING
             RETURNING {}",
            TagEnumOption::COLUMNS
        ),
        libsql::params![
            op.id.to_string(),
            op.tag_key_id.to_string(),
            label,
            op.position,
            now,
        ],
    )
    .await;

    let submitted = || TagEnumOption {
        id: op.id,
        tag_key_id: op.tag_key_id,
        label: label.to_string(),
        position: op.position,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    finish_create(conn, caller, op.id.as_uuid(), inserted, submitted, now).await
}

/// Load an option with the role the caller holds in its key's organization
async fn option_with_role(
    conn: &Connection,
    caller: &Caller,
    id: TagEnumOptionId,
) -> StoreResult<Option<(TagEnumOption, Role)>> {
    let Some(option) = fetch::<TagEnumOption>(conn, id).await? else {
        return Ok(None);
    };
    let Some(key) = fetch::<TagKey>(conn, option.tag_key_id).await? else {
        return Ok(None);
    };
    Ok(role_in(caller, key.organization_id).map(|role| (option, role)))
}

pub(super) async fn update_option(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateTagEnumOption,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some((option, role)) = option_with_role(conn, caller, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    if option.is_deleted() {
        return Ok(Reconciled::unchanged(option));
    }
    if role != Role::Admin {
        return Ok(Reconciled::forbidden(option));
    }

    let updated = query_optional::<TagEnumOption>(
        conn,
        &format!(
            "UPDATE tag_enum_options
             SET label = COALESCE(?3, label),
                 position = COALESCE(?4, position),
                 updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TagEnumOption::COLUMNS
        ),
        libsql::params![
            now,
            op.id.to_string(),
            optional_text(op.label.as_deref().map(str::trim)),
            optional_integer(op.position),
        ],
    )
    .await;
    Ok(finish_update(option, updated))
}

/// Tombstone the option and every live ticket value selecting it
pub(super) async fn delete_option(
    conn: &Connection,
    caller: &Caller,
    id: TagEnumOptionId,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some((option, role)) = option_with_role(conn, caller, id).await? else {
        return Ok(Reconciled::NotFound);
    };
    if option.is_deleted() {
        return Ok(Reconciled::unchanged(option));
    }
    if role != Role::Admin {
        return Ok(Reconciled::forbidden(option));
    }

    let deleted = query_optional::<TagEnumOption>(
        conn,
        &format!(
            "UPDATE tag_enum_options SET {TOMBSTONE_SET}
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TagEnumOption::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await;
    let deleted = match deleted {
        Ok(Some(deleted)) => deleted,
        other => return Ok(finish_update(option, other)),
    };

    let values = query_all::<TicketTagEnumValue>(
        conn,
        &format!(
            "UPDATE ticket_tag_enum_values SET {TOMBSTONE_SET}
             WHERE enum_option_id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            TicketTagEnumValue::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await?;

    let mut rows: Vec<AnyRow> = vec![deleted.into()];
    rows.extend(values.into_iter().map(AnyRow::from));
    Ok(Reconciled::Applied(rows))
}
