//! Organization roles and the per-request membership map

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::OrganizationId;

/// Role of a user within one organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
    Customer,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Customer => "customer",
        }
    }

    /// Staff roles can act on any row in the organization.
    pub const fn is_staff(self) -> bool {
        matches!(self, Self::Admin | Self::Member)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "customer" => Ok(Self::Customer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Mapping of organization id to the caller's role in it.
///
/// No entry means no access: rows owned by that organization are invisible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memberships(HashMap<OrganizationId, Role>);

impl Memberships {
    pub fn new(entries: impl IntoIterator<Item = (OrganizationId, Role)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn role_in(&self, organization_id: &OrganizationId) -> Option<Role> {
        self.0.get(organization_id).copied()
    }

    pub fn organization_ids(&self) -> impl Iterator<Item = &OrganizationId> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" customer ".parse::<Role>().unwrap(), Role::Customer);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn missing_membership_means_no_role() {
        let org = OrganizationId::new();
        let memberships = Memberships::new([(org, Role::Member)]);
        assert_eq!(memberships.role_in(&org), Some(Role::Member));
        assert_eq!(memberships.role_in(&OrganizationId::new()), None);
    }
}
