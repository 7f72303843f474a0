//! Role and membership storage
//!
//! `RoleDirectory` is the read-only view the grant registry and the
//! mutation pipeline need; `RoleStore` adds the writes used by the
//! membership service. `MemoryRoleStore` keeps everything in process.

use super::{CommunityRoster, Role, RoleMembership, RoleSummary};
use crate::types::*;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read access to a community's roles
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// All non-deleted roles of a community
    async fn community_roles(&self, community_id: CommunityId) -> Result<Vec<RoleSummary>>;

    /// Community roles with Public/Member/Admin resolved
    async fn roster(&self, community_id: CommunityId) -> Result<CommunityRoster> {
        let roles = self.community_roles(community_id).await?;
        CommunityRoster::resolve(community_id, roles)
    }
}

/// Full role and membership storage
#[async_trait]
pub trait RoleStore: RoleDirectory {
    /// Get a live role. Deleted or unknown roles are `NotFound`.
    async fn get_role(&self, role_id: RoleId) -> Result<Role>;

    /// Non-deleted roles of a community, full records
    async fn list_roles(&self, community_id: CommunityId) -> Result<Vec<Role>>;

    /// Insert a new role
    async fn insert_role(&self, role: Role) -> Result<()>;

    /// Replace a stored role
    async fn update_role(&self, role: Role) -> Result<()>;

    /// Soft-delete a role and drop its memberships in one step
    async fn delete_role(&self, role_id: RoleId, at: DateTime<Utc>) -> Result<Vec<RoleMembership>>;

    async fn membership(&self, role_id: RoleId, user_id: UserId) -> Result<Option<RoleMembership>>;

    /// Insert a claimed row or flip an unclaimed one.
    ///
    /// Returns `false` when the membership was already claimed.
    async fn claim_membership(&self, role_id: RoleId, user_id: UserId) -> Result<bool>;

    /// Insert an unclaimed row. Existing rows are left untouched (`false`).
    async fn insert_unclaimed(&self, role_id: RoleId, user_id: UserId) -> Result<bool>;

    /// Remove a membership row, returning it if present
    async fn remove_membership(&self, role_id: RoleId, user_id: UserId) -> Result<Option<RoleMembership>>;

    /// Atomically remove every membership of `user_id` within a community
    async fn remove_community_memberships(
        &self,
        community_id: CommunityId,
        user_id: UserId,
    ) -> Result<Vec<RoleMembership>>;

    /// Memberships of a user, across communities
    async fn user_memberships(&self, user_id: UserId) -> Result<Vec<RoleMembership>>;
}

#[derive(Default)]
struct RoleState {
    roles: HashMap<RoleId, Role>,
    /// (role, user) -> claimed
    memberships: HashMap<(RoleId, UserId), bool>,
}

impl RoleState {
    fn live_role(&self, role_id: &RoleId) -> Result<&Role> {
        self.roles
            .get(role_id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", role_id)))
    }
}

/// In-process role store
#[derive(Default)]
pub struct MemoryRoleStore {
    state: RwLock<RoleState>,
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleDirectory for MemoryRoleStore {
    async fn community_roles(&self, community_id: CommunityId) -> Result<Vec<RoleSummary>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .filter(|r| r.community_id == community_id && !r.is_deleted())
            .map(Role::summary)
            .collect())
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn get_role(&self, role_id: RoleId) -> Result<Role> {
        let state = self.state.read().await;
        state.live_role(&role_id).cloned()
    }

    async fn list_roles(&self, community_id: CommunityId) -> Result<Vec<Role>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .filter(|r| r.community_id == community_id && !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn insert_role(&self, role: Role) -> Result<()> {
        let mut state = self.state.write().await;
        if state.roles.contains_key(&role.id) {
            return Err(Error::InvalidRequest(format!("Role {} already exists", role.id)));
        }
        state.roles.insert(role.id, role);
        Ok(())
    }

    async fn update_role(&self, role: Role) -> Result<()> {
        let mut state = self.state.write().await;
        state.live_role(&role.id)?;
        state.roles.insert(role.id, role);
        Ok(())
    }

    async fn delete_role(&self, role_id: RoleId, at: DateTime<Utc>) -> Result<Vec<RoleMembership>> {
        let mut state = self.state.write().await;
        state.live_role(&role_id)?;
        if let Some(role) = state.roles.get_mut(&role_id) {
            role.deleted_at = Some(at);
        }

        let mut removed = Vec::new();
        state.memberships.retain(|(r, u), claimed| {
            if *r == role_id {
                removed.push(RoleMembership { role_id: *r, user_id: *u, claimed: *claimed });
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn membership(&self, role_id: RoleId, user_id: UserId) -> Result<Option<RoleMembership>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .get(&(role_id, user_id))
            .map(|claimed| RoleMembership { role_id, user_id, claimed: *claimed }))
    }

    async fn claim_membership(&self, role_id: RoleId, user_id: UserId) -> Result<bool> {
        let mut state = self.state.write().await;
        state.live_role(&role_id)?;
        let claimed = state.memberships.entry((role_id, user_id)).or_insert(false);
        if *claimed {
            return Ok(false);
        }
        *claimed = true;
        Ok(true)
    }

    async fn insert_unclaimed(&self, role_id: RoleId, user_id: UserId) -> Result<bool> {
        let mut state = self.state.write().await;
        state.live_role(&role_id)?;
        if state.memberships.contains_key(&(role_id, user_id)) {
            return Ok(false);
        }
        state.memberships.insert((role_id, user_id), false);
        Ok(true)
    }

    async fn remove_membership(&self, role_id: RoleId, user_id: UserId) -> Result<Option<RoleMembership>> {
        let mut state = self.state.write().await;
        Ok(state
            .memberships
            .remove(&(role_id, user_id))
            .map(|claimed| RoleMembership { role_id, user_id, claimed }))
    }

    async fn remove_community_memberships(
        &self,
        community_id: CommunityId,
        user_id: UserId,
    ) -> Result<Vec<RoleMembership>> {
        let mut state = self.state.write().await;
        let RoleState { roles, memberships } = &mut *state;

        let mut removed = Vec::new();
        memberships.retain(|(r, u), claimed| {
            let in_community = roles.get(r).map(|role| role.community_id == community_id).unwrap_or(false);
            if *u == user_id && in_community {
                removed.push(RoleMembership { role_id: *r, user_id: *u, claimed: *claimed });
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn user_memberships(&self, user_id: UserId) -> Result<Vec<RoleMembership>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .iter()
            .filter(|((_, u), _)| *u == user_id)
            .map(|((r, u), claimed)| RoleMembership { role_id: *r, user_id: *u, claimed: *claimed })
            .collect())
    }
}
