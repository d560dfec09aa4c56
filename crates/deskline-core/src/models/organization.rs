//! Organization model

use serde::{Deserialize, Serialize};

use super::OrganizationId;

/// A tenant. Every other synchronized row resolves to exactly one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}
