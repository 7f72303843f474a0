//! Roles and role memberships
//!
//! Every community carries three predefined roles:
//! - Public: implicit member of everyone, including anonymous viewers
//! - Member: claimed when joining the community
//! - Admin: immutable, always force-granted on every resource
//!
//! Custom roles are either manually assigned or auto-assigned through a
//! token-gated eligibility rule.

pub mod service;
pub mod store;

pub use service::{EligibilityOracle, MembershipChange, MembershipEvent, MembershipService, RoleDraft};
pub use store::{MemoryRoleStore, RoleDirectory, RoleStore};

use crate::permissions::CommunityPermission;
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a role came to exist and how it is assigned
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleKind {
    /// Public, Member or Admin (reserved, never created by callers)
    Predefined,
    /// Assigned by community administrators
    CustomManual,
    /// Assigned through an eligibility rule
    CustomAuto,
}

/// The three roles every community has
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum PredefinedRole {
    Public,
    Member,
    Admin,
}

impl PredefinedRole {
    pub const ALL: [PredefinedRole; 3] = [
        PredefinedRole::Public,
        PredefinedRole::Member,
        PredefinedRole::Admin,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            PredefinedRole::Public => "Public",
            PredefinedRole::Member => "Member",
            PredefinedRole::Admin => "Admin",
        }
    }

    /// Community permissions a freshly seeded predefined role starts with
    pub fn default_permissions(&self) -> BTreeSet<CommunityPermission> {
        match self {
            PredefinedRole::Public => BTreeSet::new(),
            PredefinedRole::Member => CommunityPermission::member_preset(),
            PredefinedRole::Admin => CommunityPermission::admin_preset(),
        }
    }
}

/// Logical combination of two token requirements
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum RuleLogic {
    And,
    Or,
}

/// Minimum holding of one token contract
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequirement {
    pub contract_id: ContractId,
    /// Decimal amount, interpreted by the eligibility oracle
    pub amount: String,
}

/// Token-gated assignment rules (one or two requirements)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct TokenRules {
    pub rule1: TokenRequirement,
    pub rule2: Option<(RuleLogic, TokenRequirement)>,
}

impl TokenRules {
    pub fn single(requirement: TokenRequirement) -> Self {
        Self { rule1: requirement, rule2: None }
    }

    /// Check whether any requirement references `contract_id`
    pub fn references(&self, contract_id: &ContractId) -> bool {
        self.rule1.contract_id == *contract_id
            || matches!(&self.rule2, Some((_, rule)) if rule.contract_id == *contract_id)
    }
}

/// Rule deciding whether a user may claim a role by themselves
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", content = "rules", rename_all = "lowercase")]
pub enum AssignmentRule {
    /// Not self-claimable
    None,
    /// Anyone may claim
    Free,
    /// Delegated to the eligibility oracle
    Token(TokenRules),
}

impl AssignmentRule {
    pub fn is_token_gated(&self) -> bool {
        matches!(self, AssignmentRule::Token(_))
    }
}

/// A role within a community
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: RoleId,
    pub community_id: CommunityId,
    pub title: String,
    pub kind: RoleKind,
    pub assignment_rule: AssignmentRule,
    pub permissions: BTreeSet<CommunityPermission>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    /// Create one of the predefined roles of a community
    pub fn predefined(community_id: CommunityId, which: PredefinedRole) -> Self {
        Self {
            id: RoleId::new(),
            community_id,
            title: which.title().to_string(),
            kind: RoleKind::Predefined,
            assignment_rule: AssignmentRule::None,
            permissions: which.default_permissions(),
            deleted_at: None,
        }
    }

    /// Which predefined role this is, if any
    pub fn predefined_as(&self) -> Option<PredefinedRole> {
        if self.kind != RoleKind::Predefined {
            return None;
        }
        PredefinedRole::ALL.into_iter().find(|p| p.title() == self.title)
    }

    pub fn is_admin(&self) -> bool {
        self.predefined_as() == Some(PredefinedRole::Admin)
    }

    pub fn is_public(&self) -> bool {
        self.predefined_as() == Some(PredefinedRole::Public)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn summary(&self) -> RoleSummary {
        RoleSummary {
            id: self.id,
            title: self.title.clone(),
            kind: self.kind,
        }
    }
}

/// Minimal role view handed out by the role directory
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct RoleSummary {
    pub id: RoleId,
    pub title: String,
    pub kind: RoleKind,
}

impl RoleSummary {
    fn is(&self, which: PredefinedRole) -> bool {
        self.kind == RoleKind::Predefined && self.title == which.title()
    }
}

/// Membership of a user in a role
///
/// Only claimed memberships count toward visibility; unclaimed rows model a
/// seeded grant waiting to be claimed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoleMembership {
    pub role_id: RoleId,
    pub user_id: UserId,
    pub claimed: bool,
}

/// Partial update of a role
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RolePatch {
    pub title: Option<String>,
    pub kind: Option<RoleKind>,
    pub assignment_rule: Option<AssignmentRule>,
    pub permissions: Option<BTreeSet<CommunityPermission>>,
}

impl RolePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.kind.is_none()
            && self.assignment_rule.is_none()
            && self.permissions.is_none()
    }
}

/// A community's role set with the predefined role ids resolved
#[derive(Clone, Debug)]
pub struct CommunityRoster {
    pub community_id: CommunityId,
    pub public: RoleId,
    pub member: RoleId,
    pub admin: RoleId,
    roles: Vec<RoleSummary>,
}

impl CommunityRoster {
    /// Resolve the predefined roles out of a community's role list
    pub fn resolve(community_id: CommunityId, roles: Vec<RoleSummary>) -> Result<Self> {
        let find = |which: PredefinedRole| {
            roles
                .iter()
                .find(|r| r.is(which))
                .map(|r| r.id)
                .ok_or_else(|| {
                    Error::NotFound(format!("{} role of community {} not found", which.title(), community_id))
                })
        };
        Ok(Self {
            community_id,
            public: find(PredefinedRole::Public)?,
            member: find(PredefinedRole::Member)?,
            admin: find(PredefinedRole::Admin)?,
            roles,
        })
    }

    pub fn contains(&self, role_id: &RoleId) -> bool {
        self.roles.iter().any(|r| r.id == *role_id)
    }

    pub fn roles(&self) -> &[RoleSummary] {
        &self.roles
    }
}
