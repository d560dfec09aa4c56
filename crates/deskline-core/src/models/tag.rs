//! Tag keys, enum options and per-ticket enum values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{OrganizationId, TagEnumOptionId, TagKeyId, TicketId, TicketTagEnumValueId};

/// Value shape of a tag key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    #[default]
    Text,
    Enum,
}

impl TagKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Enum => "enum",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "enum" => Ok(Self::Enum),
            other => Err(format!("unknown tag kind '{other}'")),
        }
    }
}

/// A tag dimension defined per organization (e.g. "Priority")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKey {
    pub id: TagKeyId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub kind: TagKind,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// One allowed value of an enum-kind tag key (e.g. "High")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEnumOption {
    pub id: TagEnumOptionId,
    pub tag_key_id: TagKeyId,
    pub label: String,
    pub position: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// The enum option selected for a tag key on one ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketTagEnumValue {
    pub id: TicketTagEnumValueId,
    pub ticket_id: TicketId,
    pub tag_key_id: TagKeyId,
    pub enum_option_id: TagEnumOptionId,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}
