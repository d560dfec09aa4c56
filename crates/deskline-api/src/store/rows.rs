//! Typed row decoding for the synchronized tables

use std::str::FromStr;

use deskline_core::models::{
    AnyRow, MacroChain, Organization, OrganizationId, SyncRow, TagEnumOption, TagKey, Table,
    Ticket, TicketTagEnumValue,
};
use libsql::params::IntoParams;
use libsql::{Connection, Row, Value};
use uuid::Uuid;

use super::{StoreError, StoreResult};

/// A synchronized row stored in its own SQL table.
///
/// `COLUMNS` always ends with `created_at, updated_at, deleted_at`.
pub trait StoredRow: SyncRow + Into<AnyRow> {
    const COLUMNS: &'static str;

    fn from_sql(row: &Row) -> StoreResult<Self>;
}

impl StoredRow for Organization {
    const COLUMNS: &'static str = "id, name, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 2)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            name: row.get(1)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

impl StoredRow for Ticket {
    const COLUMNS: &'static str =
        "id, organization_id, title, body, status, created_by, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 6)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            organization_id: parse_id(row, 1)?,
            title: row.get(2)?,
            body: row.get(3)?,
            status: parse_enum(row, 4)?,
            created_by: row.get(5)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

impl StoredRow for TagKey {
    const COLUMNS: &'static str =
        "id, organization_id, name, kind, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 4)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            organization_id: parse_id(row, 1)?,
            name: row.get(2)?,
            kind: parse_enum(row, 3)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

impl StoredRow for TagEnumOption {
    const COLUMNS: &'static str =
        "id, tag_key_id, label, position, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 4)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            tag_key_id: parse_id(row, 1)?,
            label: row.get(2)?,
            position: row.get(3)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

impl StoredRow for TicketTagEnumValue {
    const COLUMNS: &'static str =
        "id, ticket_id, tag_key_id, enum_option_id, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 4)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            ticket_id: parse_id(row, 1)?,
            tag_key_id: parse_id(row, 2)?,
            enum_option_id: parse_id(row, 3)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

impl StoredRow for MacroChain {
    const COLUMNS: &'static str =
        "id, organization_id, name, actions, created_at, updated_at, deleted_at";

    fn from_sql(row: &Row) -> StoreResult<Self> {
        let (created_at, updated_at, deleted_at) = lifecycle(row, 4)?;
        let actions: String = row.get(3)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            organization_id: parse_id(row, 1)?,
            name: row.get(2)?,
            actions: serde_json::from_str(&actions)?,
            created_at,
            updated_at,
            deleted_at,
        })
    }
}

pub fn parse_id<T>(row: &Row, idx: i32) -> StoreResult<T>
where
    T: FromStr<Err = uuid::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|error| StoreError::Decode(format!("id '{raw}': {error}")))
}

fn parse_enum<T>(row: &Row, idx: i32) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(StoreError::Decode)
}

fn lifecycle(row: &Row, first: i32) -> StoreResult<(i64, i64, Option<i64>)> {
    let deleted_at = match row.get_value(first + 2)? {
        Value::Null => None,
        Value::Integer(value) => Some(value),
        other => {
            return Err(StoreError::Decode(format!(
                "deleted_at must be an integer, got {other:?}"
            )))
        }
    };
    Ok((row.get(first)?, row.get(first + 1)?, deleted_at))
}

/// Bind helper for optional text columns
pub fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Bind helper for optional integer columns
pub fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub async fn query_optional<T: StoredRow>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
) -> StoreResult<Option<T>> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(T::from_sql(&row)?)),
        None => Ok(None),
    }
}

pub async fn query_all<T: StoredRow>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
) -> StoreResult<Vec<T>> {
    let mut rows = conn.query(sql, params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(T::from_sql(&row)?);
    }
    Ok(out)
}

/// Fetch one row by id, tombstones included
pub async fn fetch<T: StoredRow>(conn: &Connection, id: impl Into<Uuid>) -> StoreResult<Option<T>> {
    query_optional(
        conn,
        &format!(
            "SELECT {} FROM {} WHERE id = ?1",
            T::COLUMNS,
            T::TABLE.as_str()
        ),
        [id.into().to_string()],
    )
    .await
}

/// Fetch any synchronized row by table and id
pub async fn fetch_any(conn: &Connection, table: Table, id: Uuid) -> StoreResult<Option<AnyRow>> {
    Ok(match table {
        Table::Organizations => fetch::<Organization>(conn, id).await?.map(Into::into),
        Table::Tickets => fetch::<Ticket>(conn, id).await?.map(Into::into),
        Table::TagKeys => fetch::<TagKey>(conn, id).await?.map(Into::into),
        Table::TagEnumOptions => fetch::<TagEnumOption>(conn, id).await?.map(Into::into),
        Table::TicketTagEnumValues => {
            fetch::<TicketTagEnumValue>(conn, id).await?.map(Into::into)
        }
        Table::MacroChains => fetch::<MacroChain>(conn, id).await?.map(Into::into),
    })
}

/// Resolve the organization that owns `row`, walking up to its parent when
/// the row does not carry one.
pub async fn organization_of(conn: &Connection, row: &AnyRow) -> StoreResult<Option<OrganizationId>> {
    Ok(match row {
        AnyRow::Organization(organization) => Some(organization.id),
        AnyRow::Ticket(ticket) => Some(ticket.organization_id),
        AnyRow::TagKey(key) => Some(key.organization_id),
        AnyRow::MacroChain(chain) => Some(chain.organization_id),
        AnyRow::TagEnumOption(option) => fetch::<TagKey>(conn, option.tag_key_id)
            .await?
            .map(|key| key.organization_id),
        AnyRow::TicketTagEnumValue(value) => fetch::<Ticket>(conn, value.ticket_id)
            .await?
            .map(|ticket| ticket.organization_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use deskline_core::models::{TagKeyId, TagKind};
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn stored_rows_decode_with_nullable_tombstone() {
        let store = Store::open_in_memory().await.unwrap();
        let org = store.create_organization("Acme", "alice").await.unwrap();
        let db = store.lock().await;
        let conn = db.connection();

        let id = TagKeyId::new();
        conn.execute(
            "INSERT INTO tag_keys (id, organization_id, name, kind, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, 'Priority', 'enum', 5, 9, 9)",
            libsql::params![id.to_string(), org.id.to_string()],
        )
        .await
        .unwrap();

        let key: TagKey = fetch(conn, id).await.unwrap().unwrap();
        assert_eq!(key.kind, TagKind::Enum);
        assert_eq!(key.deleted_at, Some(9));

        let any = fetch_any(conn, Table::Organizations, org.id.as_uuid())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(organization_of(conn, &any).await.unwrap(), Some(org.id));
        assert!(fetch_any(conn, Table::Tickets, Uuid::now_v7())
            .await
            .unwrap()
            .is_none());
    }
}
