//! Synchronized tables and the row abstraction shared by replica, reconciler and pull

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{MacroChain, Organization, TagEnumOption, TagKey, Ticket, TicketTagEnumValue};

/// Every table that is replicated to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Organizations,
    Tickets,
    TagKeys,
    TagEnumOptions,
    TicketTagEnumValues,
    MacroChains,
}

impl Table {
    pub const ALL: [Self; 6] = [
        Self::Organizations,
        Self::Tickets,
        Self::TagKeys,
        Self::TagEnumOptions,
        Self::TicketTagEnumValues,
        Self::MacroChains,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Organizations => "organizations",
            Self::Tickets => "tickets",
            Self::TagKeys => "tag_keys",
            Self::TagEnumOptions => "tag_enum_options",
            Self::TicketTagEnumValues => "ticket_tag_enum_values",
            Self::MacroChains => "macro_chains",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == s.trim())
            .ok_or_else(|| format!("unknown table '{s}'"))
    }
}

/// A row of a synchronized table.
///
/// Every implementor carries a stable client-generated id and the three
/// lifecycle timestamps (Unix ms). A non-null `deleted_at` marks a tombstone.
pub trait SyncRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn row_id(&self) -> Uuid;
    fn created_at(&self) -> i64;
    fn updated_at(&self) -> i64;
    fn deleted_at(&self) -> Option<i64>;

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

macro_rules! impl_sync_row {
    ($ty:ident, $table:expr) => {
        impl SyncRow for $ty {
            const TABLE: Table = $table;

            fn row_id(&self) -> Uuid {
                self.id.as_uuid()
            }

            fn created_at(&self) -> i64 {
                self.created_at
            }

            fn updated_at(&self) -> i64 {
                self.updated_at
            }

            fn deleted_at(&self) -> Option<i64> {
                self.deleted_at
            }
        }

        impl From<$ty> for AnyRow {
            fn from(row: $ty) -> Self {
                Self::$ty(row)
            }
        }
    };
}

/// Any canonical row, tagged with the table it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyRow {
    Organization(Organization),
    Ticket(Ticket),
    TagKey(TagKey),
    TagEnumOption(TagEnumOption),
    TicketTagEnumValue(TicketTagEnumValue),
    MacroChain(MacroChain),
}

impl AnyRow {
    /// Decode a JSON row received for `table`
    pub fn from_value(table: Table, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match table {
            Table::Organizations => Self::Organization(serde_json::from_value(value)?),
            Table::Tickets => Self::Ticket(serde_json::from_value(value)?),
            Table::TagKeys => Self::TagKey(serde_json::from_value(value)?),
            Table::TagEnumOptions => Self::TagEnumOption(serde_json::from_value(value)?),
            Table::TicketTagEnumValues => {
                Self::TicketTagEnumValue(serde_json::from_value(value)?)
            }
            Table::MacroChains => Self::MacroChain(serde_json::from_value(value)?),
        })
    }

    pub const fn table(&self) -> Table {
        match self {
            Self::Organization(_) => Table::Organizations,
            Self::Ticket(_) => Table::Tickets,
            Self::TagKey(_) => Table::TagKeys,
            Self::TagEnumOption(_) => Table::TagEnumOptions,
            Self::TicketTagEnumValue(_) => Table::TicketTagEnumValues,
            Self::MacroChain(_) => Table::MacroChains,
        }
    }

    pub fn row_id(&self) -> Uuid {
        match self {
            Self::Organization(row) => row.row_id(),
            Self::Ticket(row) => row.row_id(),
            Self::TagKey(row) => row.row_id(),
            Self::TagEnumOption(row) => row.row_id(),
            Self::TicketTagEnumValue(row) => row.row_id(),
            Self::MacroChain(row) => row.row_id(),
        }
    }

    pub fn updated_at(&self) -> i64 {
        match self {
            Self::Organization(row) => row.updated_at(),
            Self::Ticket(row) => row.updated_at(),
            Self::TagKey(row) => row.updated_at(),
            Self::TagEnumOption(row) => row.updated_at(),
            Self::TicketTagEnumValue(row) => row.updated_at(),
            Self::MacroChain(row) => row.updated_at(),
        }
    }

    pub fn deleted_at(&self) -> Option<i64> {
        match self {
            Self::Organization(row) => row.deleted_at(),
            Self::Ticket(row) => row.deleted_at(),
            Self::TagKey(row) => row.deleted_at(),
            Self::TagEnumOption(row) => row.deleted_at(),
            Self::TicketTagEnumValue(row) => row.deleted_at(),
            Self::MacroChain(row) => row.deleted_at(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Organization(row) => serde_json::to_value(row),
            Self::Ticket(row) => serde_json::to_value(row),
            Self::TagKey(row) => serde_json::to_value(row),
            Self::TagEnumOption(row) => serde_json::to_value(row),
            Self::TicketTagEnumValue(row) => serde_json::to_value(row),
            Self::MacroChain(row) => serde_json::to_value(row),
        }
    }
}

impl_sync_row!(Organization, Table::Organizations);
impl_sync_row!(Ticket, Table::Tickets);
impl_sync_row!(TagKey, Table::TagKeys);
impl_sync_row!(TagEnumOption, Table::TagEnumOptions);
impl_sync_row!(TicketTagEnumValue, Table::TicketTagEnumValues);
impl_sync_row!(MacroChain, Table::MacroChains);

/// The lifecycle fields every row carries, readable from raw JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RowHeader {
    pub id: Uuid,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl RowHeader {
    pub fn read(value: &serde_json::Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}
