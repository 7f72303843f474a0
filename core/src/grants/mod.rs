//! Resource permission grants
//!
//! A resource's grants map each role to the permission bits it holds on that
//! resource. Empty sets are equivalent to no grant and are dropped on entry.

pub mod registry;

pub use registry::{GrantRegistry, GrantTransition, MemoryGrantStore, PermissionReader, PermissionWriter};

use crate::permissions::{PermissionSet, ResourceKind};
use crate::roles::CommunityRoster;
use crate::types::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role to permission set mapping of one resource
pub type GrantMap = BTreeMap<RoleId, PermissionSet>;

/// New grants proposed by a mutation
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", content = "grants", rename_all = "lowercase")]
pub enum GrantChange {
    /// Full replacement; roles omitted from the map lose their grant
    Replace(GrantMap),
    /// The mutation did not touch grants
    Unchanged,
}

/// Committed grants of a resource at a given revision
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GrantSnapshot {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub community_id: CommunityId,
    pub revision: u64,
    pub grants: GrantMap,
}

impl GrantSnapshot {
    /// Roles currently holding the existence bit
    pub fn visible_to(&self) -> impl Iterator<Item = RoleId> + '_ {
        let kind = self.kind;
        self.grants
            .iter()
            .filter(move |(_, perms)| perms.grants_existence(kind))
            .map(|(role, _)| *role)
    }
}

/// Drop empty permission sets
pub fn normalize(grants: GrantMap) -> GrantMap {
    grants.into_iter().filter(|(_, perms)| !perms.is_empty()).collect()
}

/// Check caller-supplied grants against a community roster.
///
/// Roles outside the community and the Admin role are `Forbidden`; bits of
/// another resource kind are `InvalidRequest`.
pub fn validate(kind: ResourceKind, roster: &CommunityRoster, grants: &GrantMap) -> Result<()> {
    for (role_id, perms) in grants {
        if *role_id == roster.admin {
            return Err(Error::Forbidden("Admin grants are managed by the registry".to_string()));
        }
        if !roster.contains(role_id) {
            return Err(Error::Forbidden(format!(
                "Role {} does not belong to community {}",
                role_id, roster.community_id
            )));
        }
        if let Some(bit) = perms.foreign_bit(kind) {
            return Err(Error::InvalidRequest(format!("{:?} is not a {} permission", bit, kind)));
        }
    }
    Ok(())
}

/// Validate, normalise and inject the Admin preset
pub fn prepare(kind: ResourceKind, roster: &CommunityRoster, grants: GrantMap) -> Result<GrantMap> {
    validate(kind, roster, &grants)?;
    let mut grants = normalize(grants);
    grants.insert(roster.admin, kind.admin_preset());
    Ok(grants)
}
