//! Request/response bodies for the sync, pull and realtime endpoints

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::Operation;
use crate::models::{AnyRow, OrganizationId, RowHeader, Table};

/// Operations a server accepts in one sync request unless configured lower
pub const SYNC_BATCH_LIMIT: u64 = 200;

/// Ordered batch of operations shipped by the outbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub operations: Vec<Operation>,
}

/// Canonical rows grouped by destination table.
///
/// A row id appears at most once per table; when the same row is added again
/// the copy with the higher `updated_at` is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRows(BTreeMap<Table, Vec<serde_json::Value>>);

impl TableRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a canonical row, replacing an older copy of the same id
    pub fn insert(&mut self, row: &AnyRow) -> serde_json::Result<()> {
        let value = row.to_value()?;
        self.insert_value(row.table(), value)
    }

    /// Add a raw JSON row for `table`, replacing an older copy of the same id
    pub fn insert_value(&mut self, table: Table, value: serde_json::Value) -> serde_json::Result<()> {
        let header = RowHeader::read(&value)?;
        let rows = self.0.entry(table).or_default();
        let existing = rows.iter().position(|candidate| {
            RowHeader::read(candidate).is_ok_and(|existing| existing.id == header.id)
        });

        match existing {
            Some(index) => {
                let keep_existing = RowHeader::read(&rows[index])
                    .is_ok_and(|existing| existing.updated_at > header.updated_at);
                if !keep_existing {
                    rows[index] = value;
                }
            }
            None => rows.push(value),
        }
        Ok(())
    }

    pub fn extend(&mut self, other: Self) -> serde_json::Result<()> {
        for (table, rows) in other.0 {
            for value in rows {
                self.insert_value(table, value)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, table: Table) -> &[serde_json::Value] {
        self.0.get(&table).map_or(&[], Vec::as_slice)
    }

    /// Iterate `(table, row)` pairs in table order
    pub fn iter(&self) -> impl Iterator<Item = (Table, &serde_json::Value)> {
        self.0
            .iter()
            .flat_map(|(table, rows)| rows.iter().map(move |row| (*table, row)))
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response of one sync round: every row touched by the batch
pub type SyncResponse = TableRows;

/// Per-table watermarks the client has already observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub watermarks: BTreeMap<Table, i64>,
    /// Tables to pull; empty means every synchronized table
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tables: BTreeSet<Table>,
    /// Narrow the pull to these organizations; empty means all of the
    /// caller's organizations
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub organizations: BTreeSet<OrganizationId>,
    /// Inclusive per-table upper bound on `updated_at`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ceilings: BTreeMap<Table, i64>,
}

impl PullRequest {
    /// Tables this request covers
    pub fn requested_tables(&self) -> Vec<Table> {
        if self.tables.is_empty() {
            Table::ALL.to_vec()
        } else {
            self.tables.iter().copied().collect()
        }
    }

    pub fn watermark(&self, table: Table) -> i64 {
        self.watermarks.get(&table).copied().unwrap_or(0)
    }

    pub fn ceiling(&self, table: Table) -> Option<i64> {
        self.ceilings.get(&table).copied()
    }
}

/// Rows changed since the requested watermarks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub rows: TableRows,
    /// Tables whose delta was truncated by the page limit
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub has_more: BTreeSet<Table>,
    /// Every organization the caller belongs to, whatever the request scope
    #[serde(default)]
    pub organizations: BTreeSet<OrganizationId>,
}

/// A row-level change pushed by the realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert { table: Table, row: serde_json::Value },
    Update { table: Table, row: serde_json::Value },
    Delete { table: Table, id: Uuid },
}

impl ChangeEvent {
    pub const fn table(&self) -> Table {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                *table
            }
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}
