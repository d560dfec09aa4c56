//! Optimistic local effect of an operation on the replica

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{AnyRow, RowHeader, Table};
use crate::protocol::Operation;

/// Row the replica should hold right after `operation` is issued locally.
///
/// Returns `None` when the operation has no visible local effect: updates and
/// deletes of rows the replica does not hold, re-creates of a known id, and
/// anything aimed at a tombstone. The operation is still enqueued in those
/// cases; the server response decides.
pub fn project(
    operation: &Operation,
    existing: Option<&Value>,
    actor: &str,
    now: i64,
) -> Result<Option<Value>> {
    let (table, _) = operation.target();
    let payload = payload_object(operation)?;

    if operation.is_create() {
        if existing.is_some() {
            return Ok(None);
        }

        let mut row = payload;
        row.insert("created_at".to_string(), Value::from(now));
        row.insert("updated_at".to_string(), Value::from(now));
        row.insert("deleted_at".to_string(), Value::Null);
        if table == Table::Tickets {
            row.insert("created_by".to_string(), Value::from(actor));
        }
        return checked(table, Value::Object(row)).map(Some);
    }

    let Some(existing) = existing else {
        return Ok(None);
    };
    let header = RowHeader::read(existing)?;
    if header.deleted_at.is_some() {
        return Ok(None);
    }

    let Value::Object(mut row) = existing.clone() else {
        return Err(Error::InvalidInput(format!(
            "replica row {} in {table} is not an object",
            header.id
        )));
    };

    let stamp = now.max(header.updated_at.saturating_add(1));
    if operation.is_delete() {
        row.insert("deleted_at".to_string(), Value::from(stamp));
    } else {
        for (field, value) in payload {
            if field != "id" {
                row.insert(field, value);
            }
        }
    }
    row.insert("updated_at".to_string(), Value::from(stamp));

    checked(table, Value::Object(row)).map(Some)
}

fn payload_object(operation: &Operation) -> Result<Map<String, Value>> {
    let mut envelope = serde_json::to_value(operation)?;
    match envelope.get_mut("payload").map(Value::take) {
        Some(Value::Object(payload)) => Ok(payload),
        _ => Err(Error::InvalidInput(format!(
            "{} payload is not an object",
            operation.kind()
        ))),
    }
}

// The projected row must still decode as its table's type
fn checked(table: Table, row: Value) -> Result<Value> {
    AnyRow::from_value(table, row.clone())?;
    Ok(row)
}
