//! Membership service
//!
//! Decides whether a user may hold a role and performs role lifecycle,
//! claim, join and leave operations. Every change that alters which role
//! rooms a user belongs to is published as a `MembershipEvent` so the
//! targeting router can move the user's live connections.

use super::store::RoleStore;
use super::{AssignmentRule, CommunityRoster, PredefinedRole, Role, RoleKind, RolePatch};
use crate::config::RoleConfig;
use crate::permissions::CommunityPermission;
use crate::types::*;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// External check backing token-gated roles
#[async_trait]
pub trait EligibilityOracle: Send + Sync {
    /// Whether `user_id` currently satisfies `rule`
    async fn evaluate(&self, user_id: UserId, rule: &AssignmentRule) -> Result<bool>;
}

/// What happened to a user's memberships
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MembershipChange {
    RolesAdded { role_ids: Vec<RoleId> },
    RolesRemoved { role_ids: Vec<RoleId> },
    JoinedCommunity { role_ids: Vec<RoleId> },
    LeftCommunity { role_ids: Vec<RoleId> },
}

/// Membership change consumed by the targeting router
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    pub user_id: UserId,
    pub community_id: CommunityId,
    pub change: MembershipChange,
}

/// Input for creating a custom role
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoleDraft {
    pub title: String,
    pub kind: RoleKind,
    pub assignment_rule: AssignmentRule,
    pub permissions: BTreeSet<CommunityPermission>,
}

/// Manages roles and memberships on top of a `RoleStore`
pub struct MembershipService {
    store: Arc<dyn RoleStore>,
    oracle: Arc<dyn EligibilityOracle>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    config: RoleConfig,
}

impl MembershipService {
    /// Create the service and the receiving end of its membership events
    pub fn new(
        store: Arc<dyn RoleStore>,
        oracle: Arc<dyn EligibilityOracle>,
        config: RoleConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                oracle,
                events,
                config,
            },
            rx,
        )
    }

    pub fn store(&self) -> &Arc<dyn RoleStore> {
        &self.store
    }

    /// Seed the Public, Member and Admin roles of a community.
    ///
    /// Roles that already exist are kept.
    pub async fn create_community_roles(&self, community_id: CommunityId) -> Result<CommunityRoster> {
        let existing = self.store.list_roles(community_id).await?;
        for which in PredefinedRole::ALL {
            if !existing.iter().any(|r| r.predefined_as() == Some(which)) {
                self.store.insert_role(Role::predefined(community_id, which)).await?;
            }
        }
        self.store.roster(community_id).await
    }

    /// Create a custom role
    pub async fn create_role(&self, community_id: CommunityId, draft: RoleDraft) -> Result<Role> {
        if draft.kind == RoleKind::Predefined {
            return Err(Error::Forbidden("Predefined roles cannot be created".to_string()));
        }
        check_rule_matches_kind(draft.kind, &draft.assignment_rule)?;

        // Unknown communities have no roster
        self.store.roster(community_id).await?;

        if let Some(limit) = self.config.max_custom_roles {
            let custom = self
                .store
                .list_roles(community_id)
                .await?
                .iter()
                .filter(|r| r.kind != RoleKind::Predefined)
                .count();
            if custom >= limit {
                return Err(Error::Forbidden(format!(
                    "Community {} reached its limit of {} custom roles",
                    community_id, limit
                )));
            }
        }

        let role = Role {
            id: RoleId::new(),
            community_id,
            title: draft.title,
            kind: draft.kind,
            assignment_rule: draft.assignment_rule,
            permissions: draft.permissions,
            deleted_at: None,
        };
        self.store.insert_role(role.clone()).await?;

        tracing::info!(
            community = %community_id,
            role = %role.id,
            kind = ?role.kind,
            "Created role"
        );
        Ok(role)
    }

    /// Apply a partial update to a role
    pub async fn update_role(&self, role_id: RoleId, patch: RolePatch) -> Result<Role> {
        if patch.is_empty() {
            return Err(Error::InvalidRequest("Empty role patch".to_string()));
        }
        if patch.kind == Some(RoleKind::Predefined) {
            return Err(Error::Forbidden("Roles cannot become predefined".to_string()));
        }

        let mut role = self.store.get_role(role_id).await?;
        if role.is_admin() && (patch.permissions.is_some() || patch.kind.is_some()) {
            return Err(Error::Forbidden("The Admin role is immutable".to_string()));
        }
        if role.kind == RoleKind::Predefined
            && (patch.title.is_some() || patch.kind.is_some() || patch.assignment_rule.is_some())
        {
            return Err(Error::Forbidden(format!(
                "Predefined role {} only accepts permission changes",
                role.title
            )));
        }

        let RolePatch {
            title,
            kind,
            assignment_rule,
            permissions,
        } = patch;
        if let Some(title) = title {
            role.title = title;
        }
        if let Some(kind) = kind {
            role.kind = kind;
        }
        if let Some(rule) = assignment_rule {
            role.assignment_rule = rule;
        }
        if let Some(permissions) = permissions {
            role.permissions = permissions;
        }
        if role.kind != RoleKind::Predefined {
            check_rule_matches_kind(role.kind, &role.assignment_rule)?;
        }

        self.store.update_role(role.clone()).await?;
        tracing::info!(role = %role.id, "Updated role");
        Ok(role)
    }

    /// Soft-delete a custom role and drop all of its memberships
    pub async fn delete_role(&self, community_id: CommunityId, role_id: RoleId) -> Result<Vec<MembershipEvent>> {
        let role = self.store.get_role(role_id).await?;
        if role.community_id != community_id {
            return Err(Error::NotFound(format!("Role {} not in community {}", role_id, community_id)));
        }
        if role.kind == RoleKind::Predefined {
            return Err(Error::Forbidden("Predefined roles cannot be deleted".to_string()));
        }

        let removed = self.store.delete_role(role_id, Utc::now()).await?;
        let events: Vec<_> = removed
            .into_iter()
            .filter(|m| m.claimed)
            .map(|m| MembershipEvent {
                user_id: m.user_id,
                community_id,
                change: MembershipChange::RolesRemoved { role_ids: vec![role_id] },
            })
            .collect();
        for event in &events {
            self.emit(event.clone());
        }

        tracing::info!(role = %role_id, revoked = events.len(), "Deleted role");
        Ok(events)
    }

    /// Self-service claim of a role.
    ///
    /// Returns `None` when the membership was already claimed.
    pub async fn claim(&self, user_id: UserId, role_id: RoleId) -> Result<Option<MembershipEvent>> {
        let role = self.store.get_role(role_id).await?;
        if role.is_public() {
            return Err(Error::Forbidden("The Public role is implicit".to_string()));
        }

        let eligible = match self.store.membership(role_id, user_id).await? {
            Some(membership) if membership.claimed => return Ok(None),
            // Seeded rows were already checked when they were granted
            Some(_) => true,
            None => match &role.assignment_rule {
                AssignmentRule::Free => true,
                rule @ AssignmentRule::Token(_) => self.oracle.evaluate(user_id, rule).await?,
                AssignmentRule::None => false,
            },
        };
        if !eligible {
            return Err(Error::Forbidden(format!("User {} may not claim role {}", user_id, role_id)));
        }

        self.record_claim(user_id, &role).await
    }

    /// Direct assignment of a role, bypassing the assignment rule
    pub async fn join(&self, user_id: UserId, role_id: RoleId) -> Result<Option<MembershipEvent>> {
        let role = self.store.get_role(role_id).await?;
        if role.is_public() {
            return Err(Error::Forbidden("The Public role is implicit".to_string()));
        }
        self.record_claim(user_id, &role).await
    }

    /// Give up a single role. The Member role is only left with the community.
    pub async fn leave(&self, user_id: UserId, role_id: RoleId) -> Result<Option<MembershipEvent>> {
        let role = self.store.get_role(role_id).await?;
        match role.predefined_as() {
            Some(PredefinedRole::Public) => {
                return Err(Error::Forbidden("The Public role is implicit".to_string()));
            }
            Some(PredefinedRole::Member) => {
                return Err(Error::Forbidden(
                    "The Member role is only left by leaving the community".to_string(),
                ));
            }
            _ => {}
        }

        let removed = self
            .store
            .remove_membership(role_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User {} does not hold role {}", user_id, role_id)))?;

        // Unclaimed rows never granted visibility, nothing to tell the router
        if !removed.claimed {
            return Ok(None);
        }
        Ok(Some(self.emit(MembershipEvent {
            user_id,
            community_id: role.community_id,
            change: MembershipChange::RolesRemoved { role_ids: vec![role_id] },
        })))
    }

    /// Join a community by claiming its Member role
    pub async fn join_community(&self, user_id: UserId, community_id: CommunityId) -> Result<Option<MembershipEvent>> {
        let roster = self.store.roster(community_id).await?;
        if !self.store.claim_membership(roster.member, user_id).await? {
            return Ok(None);
        }

        tracing::info!(user = %user_id, community = %community_id, "User joined community");
        Ok(Some(self.emit(MembershipEvent {
            user_id,
            community_id,
            change: MembershipChange::JoinedCommunity { role_ids: vec![roster.member] },
        })))
    }

    /// Leave a community, dropping every membership in it at once
    pub async fn leave_community(&self, user_id: UserId, community_id: CommunityId) -> Result<MembershipEvent> {
        self.store.roster(community_id).await?;
        let removed = self.store.remove_community_memberships(community_id, user_id).await?;
        if removed.is_empty() {
            return Err(Error::NotFound(format!(
                "User {} is not a member of community {}",
                user_id, community_id
            )));
        }

        let role_ids = removed.iter().filter(|m| m.claimed).map(|m| m.role_id).collect();
        tracing::info!(user = %user_id, community = %community_id, "User left community");
        Ok(self.emit(MembershipEvent {
            user_id,
            community_id,
            change: MembershipChange::LeftCommunity { role_ids },
        }))
    }

    /// Pre-grant roles as unclaimed memberships.
    ///
    /// Returns how many rows were inserted; existing rows are untouched.
    pub async fn seed_unclaimed(&self, user_id: UserId, role_ids: &[RoleId]) -> Result<usize> {
        let mut inserted = 0;
        for role_id in role_ids {
            let role = self.store.get_role(*role_id).await?;
            if role.is_public() {
                continue;
            }
            if self.store.insert_unclaimed(*role_id, user_id).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Drop memberships whose backing requirement no longer holds.
    ///
    /// Unclaimed rows vanish silently; claimed ones are revoked and
    /// announced, grouped per community.
    pub async fn revoke_unclaimable(&self, user_id: UserId, role_ids: &[RoleId]) -> Result<Vec<MembershipEvent>> {
        let mut revoked: BTreeMap<CommunityId, Vec<RoleId>> = BTreeMap::new();
        for role_id in role_ids {
            let role = match self.store.get_role(*role_id).await {
                Ok(role) => role,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if let Some(removed) = self.store.remove_membership(*role_id, user_id).await? {
                if removed.claimed {
                    revoked.entry(role.community_id).or_default().push(*role_id);
                }
            }
        }

        let events: Vec<_> = revoked
            .into_iter()
            .map(|(community_id, role_ids)| MembershipEvent {
                user_id,
                community_id,
                change: MembershipChange::RolesRemoved { role_ids },
            })
            .collect();
        for event in &events {
            self.emit(event.clone());
        }
        Ok(events)
    }

    /// Turn every token-gated role referencing `contract_id` into a manual role
    pub async fn remove_token_requirement(
        &self,
        community_id: CommunityId,
        contract_id: ContractId,
    ) -> Result<Vec<RoleId>> {
        let mut converted = Vec::new();
        for mut role in self.store.list_roles(community_id).await? {
            let references = match &role.assignment_rule {
                AssignmentRule::Token(rules) => rules.references(&contract_id),
                _ => false,
            };
            if role.kind != RoleKind::CustomAuto || !references {
                continue;
            }
            role.kind = RoleKind::CustomManual;
            role.assignment_rule = AssignmentRule::None;
            converted.push(role.id);
            self.store.update_role(role).await?;
        }

        if !converted.is_empty() {
            tracing::info!(
                community = %community_id,
                contract = %contract_id,
                roles = converted.len(),
                "Converted token-gated roles to manual assignment"
            );
        }
        Ok(converted)
    }

    /// Claimed roles of a user within one community (Public is implied)
    pub async fn user_roles(&self, user_id: UserId, community_id: CommunityId) -> Result<Vec<RoleId>> {
        let community_roles: BTreeSet<RoleId> = self
            .store
            .community_roles(community_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        Ok(self
            .store
            .user_memberships(user_id)
            .await?
            .into_iter()
            .filter(|m| m.claimed && community_roles.contains(&m.role_id))
            .map(|m| m.role_id)
            .collect())
    }

    async fn record_claim(&self, user_id: UserId, role: &Role) -> Result<Option<MembershipEvent>> {
        if !self.store.claim_membership(role.id, user_id).await? {
            return Ok(None);
        }
        tracing::info!(user = %user_id, role = %role.id, "Role claimed");
        Ok(Some(self.emit(MembershipEvent {
            user_id,
            community_id: role.community_id,
            change: MembershipChange::RolesAdded { role_ids: vec![role.id] },
        })))
    }

    fn emit(&self, event: MembershipEvent) -> MembershipEvent {
        if self.events.send(event.clone()).is_err() {
            tracing::warn!(user = %event.user_id, "Membership event dropped, no room sync running");
        }
        event
    }
}

fn check_rule_matches_kind(kind: RoleKind, rule: &AssignmentRule) -> Result<()> {
    if rule.is_token_gated() && kind != RoleKind::CustomAuto {
        return Err(Error::InvalidRequest(
            "Token-gated roles must be auto-assigned".to_string(),
        ));
    }
    Ok(())
}
