//! Macro chain model

use serde::{Deserialize, Serialize};

use super::{MacroChainId, OrganizationId};

/// An ordered list of named ticket actions that agents run in one step.
///
/// The actions themselves are interpreted by the ticket business rules; the
/// sync layer only stores and replicates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroChain {
    pub id: MacroChainId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub actions: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}
