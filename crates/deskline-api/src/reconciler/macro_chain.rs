//! Macro chains; staff only

use deskline_core::models::{MacroChain, MacroChainId, SyncRow};
use deskline_core::protocol::{CreateMacroChain, UpdateMacroChain};
use libsql::Connection;

use super::{finish_create, finish_update, role_in, Reconciled, TOMBSTONE_SET};
use crate::auth::Caller;
use crate::store::rows::{fetch, optional_text, query_optional, StoredRow};
use crate::store::StoreResult;

fn trimmed_actions(actions: &[String]) -> Vec<String> {
    actions.iter().map(|action| action.trim().to_string()).collect()
}

pub(super) async fn create(
    conn: &Connection,
    caller: &Caller,
    op: &CreateMacroChain,
    now: i64,
) -> StoreResult<Reconciled> {
    if !role_in(caller, op.organization_id).is_some_and(|role| role.is_staff()) {
        return Ok(Reconciled::NotFound);
    }

    let name = op.name.trim();
    let actions = trimmed_actions(&op.actions);
    let inserted = query_optional::<MacroChain>(
        conn,
        &format!(
            "INSERT INTO macro_chains (id, organization_id, name, actions, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL)
             ON CONFLICT(id) DO NOTHING
             RETURNING {}",
            MacroChain::COLUMNS
        ),
        libsql::params![
            op.id.to_string(),
            op.organization_id.to_string(),
            name,
            serde_json::to_string(&actions)?,
            now,
        ],
    )
    .await;

    let submitted = || MacroChain {
        id: op.id,
        organization_id: op.organization_id,
        name: name.to_string(),
        actions,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    finish_create(conn, caller, op.id.as_uuid(), inserted, submitted, now).await
}

pub(super) async fn update(
    conn: &Connection,
    caller: &Caller,
    op: &UpdateMacroChain,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(chain) = fetch::<MacroChain>(conn, op.id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, chain.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if chain.is_deleted() {
        return Ok(Reconciled::unchanged(chain));
    }
    if !role.is_staff() {
        return Ok(Reconciled::forbidden(chain));
    }

    let actions = op
        .actions
        .as_deref()
        .map(|actions| serde_json::to_string(&trimmed_actions(actions)))
        .transpose()?;
    let updated = query_optional::<MacroChain>(
        conn,
        &format!(
            "UPDATE macro_chains
             SET name = COALESCE(?3, name),
                 actions = COALESCE(?4, actions),
                 updated_at = MAX(?1, updated_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            MacroChain::COLUMNS
        ),
        libsql::params![
            now,
            op.id.to_string(),
            optional_text(op.name.as_deref().map(str::trim)),
            optional_text(actions.as_deref()),
        ],
    )
    .await;
    Ok(finish_update(chain, updated))
}

pub(super) async fn delete(
    conn: &Connection,
    caller: &Caller,
    id: MacroChainId,
    now: i64,
) -> StoreResult<Reconciled> {
    let Some(chain) = fetch::<MacroChain>(conn, id).await? else {
        return Ok(Reconciled::NotFound);
    };
    let Some(role) = role_in(caller, chain.organization_id) else {
        return Ok(Reconciled::NotFound);
    };
    if chain.is_deleted() {
        return Ok(Reconciled::unchanged(chain));
    }
    if !role.is_staff() {
        return Ok(Reconciled::forbidden(chain));
    }

    let deleted = query_optional::<MacroChain>(
        conn,
        &format!(
            "UPDATE macro_chains SET {TOMBSTONE_SET}
             WHERE id = ?2 AND deleted_at IS NULL
             RETURNING {}",
            MacroChain::COLUMNS
        ),
        libsql::params![now, id.to_string()],
    )
    .await;
    Ok(finish_update(chain, deleted))
}
