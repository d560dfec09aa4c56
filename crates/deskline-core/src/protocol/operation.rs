//! The closed set of mutations a client can record and the server can apply

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    MacroChainId, OrganizationId, Table, TagEnumOptionId, TagKeyId, TagKind, TicketId,
    TicketStatus, TicketTagEnumValueId,
};

/// Longest accepted title/name/label, in characters
pub const MAX_NAME_CHARS: usize = 200;
/// Longest accepted ticket body, in characters
pub const MAX_BODY_CHARS: usize = 20_000;
/// Most actions a macro chain may hold
pub const MAX_MACRO_ACTIONS: usize = 50;

/// Payload rejected by schema validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} payload: {reason}")]
pub struct ValidationError {
    pub kind: &'static str,
    pub reason: String,
}

/// A recorded mutation, `{kind, payload}` on the wire.
///
/// Operations are immutable once recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    UpdateOrganization(UpdateOrganization),
    CreateTicket(CreateTicket),
    UpdateTicket(UpdateTicket),
    DeleteTicket(DeleteRow<TicketId>),
    CreateTagKey(CreateTagKey),
    UpdateTagKey(UpdateTagKey),
    DeleteTagKey(DeleteRow<TagKeyId>),
    CreateTagEnumOption(CreateTagEnumOption),
    UpdateTagEnumOption(UpdateTagEnumOption),
    DeleteTagEnumOption(DeleteRow<TagEnumOptionId>),
    CreateTicketTagEnumValue(CreateTicketTagEnumValue),
    UpdateTicketTagEnumValue(UpdateTicketTagEnumValue),
    DeleteTicketTagEnumValue(DeleteRow<TicketTagEnumValueId>),
    CreateMacroChain(CreateMacroChain),
    UpdateMacroChain(UpdateMacroChain),
    DeleteMacroChain(DeleteRow<MacroChainId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRow<I> {
    pub id: I,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateOrganization {
    pub id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTicket {
    pub id: TicketId,
    pub organization_id: OrganizationId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: TicketStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTicket {
    pub id: TicketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TicketStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTagKey {
    pub id: TagKeyId,
    pub organization_id: OrganizationId,
    pub name: String,
    #[serde(default)]
    pub kind: TagKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTagKey {
    pub id: TagKeyId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTagEnumOption {
    pub id: TagEnumOptionId,
    pub tag_key_id: TagKeyId,
    pub label: String,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTagEnumOption {
    pub id: TagEnumOptionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTicketTagEnumValue {
    pub id: TicketTagEnumValueId,
    pub ticket_id: TicketId,
    pub tag_key_id: TagKeyId,
    pub enum_option_id: TagEnumOptionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTicketTagEnumValue {
    pub id: TicketTagEnumValueId,
    pub enum_option_id: TagEnumOptionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMacroChain {
    pub id: MacroChainId,
    pub organization_id: OrganizationId,
    pub name: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMacroChain {
    pub id: MacroChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
}

impl Operation {
    /// Wire name of this operation's kind
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UpdateOrganization(_) => "update_organization",
            Self::CreateTicket(_) => "create_ticket",
            Self::UpdateTicket(_) => "update_ticket",
            Self::DeleteTicket(_) => "delete_ticket",
            Self::CreateTagKey(_) => "create_tag_key",
            Self::UpdateTagKey(_) => "update_tag_key",
            Self::DeleteTagKey(_) => "delete_tag_key",
            Self::CreateTagEnumOption(_) => "create_tag_enum_option",
            Self::UpdateTagEnumOption(_) => "update_tag_enum_option",
            Self::DeleteTagEnumOption(_) => "delete_tag_enum_option",
            Self::CreateTicketTagEnumValue(_) => "create_ticket_tag_enum_value",
            Self::UpdateTicketTagEnumValue(_) => "update_ticket_tag_enum_value",
            Self::DeleteTicketTagEnumValue(_) => "delete_ticket_tag_enum_value",
            Self::CreateMacroChain(_) => "create_macro_chain",
            Self::UpdateMacroChain(_) => "update_macro_chain",
            Self::DeleteMacroChain(_) => "delete_macro_chain",
        }
    }

    /// Table and id of the row this operation primarily affects
    pub fn target(&self) -> (Table, Uuid) {
        match self {
            Self::UpdateOrganization(op) => (Table::Organizations, op.id.as_uuid()),
            Self::CreateTicket(op) => (Table::Tickets, op.id.as_uuid()),
            Self::UpdateTicket(op) => (Table::Tickets, op.id.as_uuid()),
            Self::DeleteTicket(op) => (Table::Tickets, op.id.as_uuid()),
            Self::CreateTagKey(op) => (Table::TagKeys, op.id.as_uuid()),
            Self::UpdateTagKey(op) => (Table::TagKeys, op.id.as_uuid()),
            Self::DeleteTagKey(op) => (Table::TagKeys, op.id.as_uuid()),
            Self::CreateTagEnumOption(op) => (Table::TagEnumOptions, op.id.as_uuid()),
            Self::UpdateTagEnumOption(op) => (Table::TagEnumOptions, op.id.as_uuid()),
            Self::DeleteTagEnumOption(op) => (Table::TagEnumOptions, op.id.as_uuid()),
            Self::CreateTicketTagEnumValue(op) => (Table::TicketTagEnumValues, op.id.as_uuid()),
            Self::UpdateTicketTagEnumValue(op) => (Table::TicketTagEnumValues, op.id.as_uuid()),
            Self::DeleteTicketTagEnumValue(op) => (Table::TicketTagEnumValues, op.id.as_uuid()),
            Self::CreateMacroChain(op) => (Table::MacroChains, op.id.as_uuid()),
            Self::UpdateMacroChain(op) => (Table::MacroChains, op.id.as_uuid()),
            Self::DeleteMacroChain(op) => (Table::MacroChains, op.id.as_uuid()),
        }
    }

    /// Whether this operation inserts a new row
    pub const fn is_create(&self) -> bool {
        matches!(
            self,
            Self::CreateTicket(_)
                | Self::CreateTagKey(_)
                | Self::CreateTagEnumOption(_)
                | Self::CreateTicketTagEnumValue(_)
                | Self::CreateMacroChain(_)
        )
    }

    /// Whether this operation soft-deletes its target
    pub const fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteTicket(_)
                | Self::DeleteTagKey(_)
                | Self::DeleteTagEnumOption(_)
                | Self::DeleteTicketTagEnumValue(_)
                | Self::DeleteMacroChain(_)
        )
    }

    /// Schema validation applied before an operation is accepted
    pub fn validate(&self) -> Result<(), ValidationError> {
        let kind = self.kind();
        let fail = |reason: String| ValidationError { kind, reason };
        match self {
            Self::UpdateOrganization(op) => check_name(&op.name, "name").map_err(fail),
            Self::CreateTicket(op) => {
                check_name(&op.title, "title").map_err(fail)?;
                check_body(&op.body).map_err(fail)
            }
            Self::UpdateTicket(op) => {
                if let Some(title) = &op.title {
                    check_name(title, "title").map_err(fail)?;
                }
                if let Some(body) = &op.body {
                    check_body(body).map_err(fail)?;
                }
                Ok(())
            }
            Self::CreateTagKey(op) => check_name(&op.name, "name").map_err(fail),
            Self::UpdateTagKey(op) => check_name(&op.name, "name").map_err(fail),
            Self::CreateTagEnumOption(op) => check_name(&op.label, "label").map_err(fail),
            Self::UpdateTagEnumOption(op) => op
                .label
                .as_deref()
                .map_or(Ok(()), |label| check_name(label, "label"))
                .map_err(fail),
            Self::CreateMacroChain(op) => {
                check_name(&op.name, "name").map_err(fail)?;
                check_actions(&op.actions).map_err(fail)
            }
            Self::UpdateMacroChain(op) => {
                if let Some(name) = &op.name {
                    check_name(name, "name").map_err(fail)?;
                }
                if let Some(actions) = &op.actions {
                    check_actions(actions).map_err(fail)?;
                }
                Ok(())
            }
            Self::DeleteTicket(_)
            | Self::DeleteTagKey(_)
            | Self::DeleteTagEnumOption(_)
            | Self::CreateTicketTagEnumValue(_)
            | Self::UpdateTicketTagEnumValue(_)
            | Self::DeleteTicketTagEnumValue(_)
            | Self::DeleteMacroChain(_) => Ok(()),
        }
    }
}

fn check_name(value: &str, field: &str) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(format!("{field} exceeds {MAX_NAME_CHARS} characters"));
    }
    Ok(())
}

fn check_body(value: &str) -> Result<(), String> {
    if value.chars().count() > MAX_BODY_CHARS {
        return Err(format!("body exceeds {MAX_BODY_CHARS} characters"));
    }
    Ok(())
}

fn check_actions(actions: &[String]) -> Result<(), String> {
    if actions.len() > MAX_MACRO_ACTIONS {
        return Err(format!("more than {MAX_MACRO_ACTIONS} actions"));
    }
    if actions.iter().any(|action| action.trim().is_empty()) {
        return Err("actions must not be empty".to_string());
    }
    Ok(())
}
