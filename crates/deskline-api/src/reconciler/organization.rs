use deskline_core::models::{Organization, Role, SyncRow};
use deskline_core::protocol::UpdateOrganization;
use libsql::Connection;

use super::{finish_update, role_in, Reconciled};
use crate::auth::Caller;
use crate::store::rows::{fetch, query_optional, StoredRow};
use crate::store::StoreResult;

/// Rename; admins only
pub(super) async fn rename(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateOrganization,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(organization) = fetch::<Organization>(conn, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, organization.id) else {
        return Ok(Reconciled::NotFound);
    };
    if organization.is_deleted() {
        return Ok(Reconciled::unchanged(organization));
    }
    if role != Role::Admin {
        return Ok(Reconciled::forbidden(organization));
    }

    let updated = query_optional::<Organization>(
        conn,
        &format!(
            "UPDATE organizations SET name = ?3, updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            Organization::COLUMNS
        ),
        libsql::params![now, op.id.to_string(), op.name.trim()],
    )
    .await;
    Ok(finish_update(organization, updated))
}
