//! Visibility diff
//!
//! Classifies every role into appear, update or disappear from the
//! transition of the resource kind's existence bit between the old and new
//! grants. Other permission bits never influence the outcome. A role that
//! held the existence bit and is omitted from the new grants loses it.
//!
//! The Public role is reported through the `public_*` flags rather than the
//! role sets, since it stands for the whole community. The Admin role is
//! never classified: it sees every resource at all times.


use crate::grants::{GrantChange, GrantMap};
use crate::permissions::Permission;
use crate::roles::CommunityRoster;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Predefined roles the diff treats specially
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DiffScope {
    pub public_role: RoleId,
    pub admin_role: RoleId,
}

impl From<&CommunityRoster> for DiffScope {
    fn from(roster: &CommunityRoster) -> Self {
        Self {
            public_role: roster.public,
            admin_role: roster.admin,
        }
    }
}

/// Where a single role ends up after a grant change
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Fate {
    Appear,
    Update,
    Disappear,
}

/// Role buckets produced by comparing two grant snapshots
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityDiff {
    pub appear: BTreeSet<RoleId>,
    pub update: BTreeSet<RoleId>,
    pub disappear: BTreeSet<RoleId>,
    pub public_appear: bool,
    pub public_update: bool,
    pub public_disappear: bool,
}

impl VisibilityDiff {
    /// Compare `old` grants with the proposed change
    pub fn compute(existence_bit: Permission, scope: DiffScope, old: &GrantMap, new: &GrantChange) -> Self {
        let had = |role: &RoleId| old.get(role).map(|p| p.contains(existence_bit)).unwrap_or(false);
        let mut diff = Self::default();

        match new {
            GrantChange::Unchanged => {
                for role in old.keys().filter(|r| had(r)) {
                    diff.place(scope, *role, Fate::Update);
                }
            }
            GrantChange::Replace(new) => {
                for (role, perms) in new {
                    let fate = match (had(role), perms.contains(existence_bit)) {
                        (false, true) => Fate::Appear,
                        (true, true) => Fate::Update,
                        (true, false) => Fate::Disappear,
                        (false, false) => continue,
                    };
                    diff.place(scope, *role, fate);
                }
                // Omission revokes
                for role in old.keys().filter(|r| !new.contains_key(*r) && had(r)) {
                    diff.place(scope, *role, Fate::Disappear);
                }
            }
        }

        tracing::debug!(
            appear = diff.appear.len(),
            update = diff.update.len(),
            disappear = diff.disappear.len(),
            public_appear = diff.public_appear,
            public_update = diff.public_update,
            public_disappear = diff.public_disappear,
            "Computed visibility diff"
        );
        diff
    }

    fn place(&mut self, scope: DiffScope, role: RoleId, fate: Fate) {
        if role == scope.admin_role {
            return;
        }
        if role == scope.public_role {
            match fate {
                Fate::Appear => self.public_appear = true,
                Fate::Update => self.public_update = true,
                Fate::Disappear => self.public_disappear = true,
            }
            return;
        }
        match fate {
            Fate::Appear => self.appear.insert(role),
            Fate::Update => self.update.insert(role),
            Fate::Disappear => self.disappear.insert(role),
        };
    }

    /// The resource is visible community-wide after the change
    pub fn public_after(&self) -> bool {
        self.public_appear || self.public_update
    }

    /// The resource was visible community-wide before the change
    pub fn public_before(&self) -> bool {
        self.public_update || self.public_disappear
    }

    /// Nothing to deliver
    pub fn is_empty(&self) -> bool {
        self.appear.is_empty()
            && self.update.is_empty()
            && self.disappear.is_empty()
            && !self.public_appear
            && !self.public_update
            && !self.public_disappear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionSet;

    const EXISTS: Permission = Permission::ChannelExists;

    struct Fixture {
        scope: DiffScope,
        member: RoleId,
        editor: RoleId,
    }

    fn fixture() -> Fixture {
        Fixture {
            scope: DiffScope {
                public_role: RoleId::new(),
                admin_role: RoleId::new(),
            },
            member: RoleId::new(),
            editor: RoleId::new(),
        }
    }

    fn exists() -> PermissionSet {
        PermissionSet::from([EXISTS])
    }

    #[test]
    fn test_new_role_appears_existing_role_updates() {
        let f = fixture();
        let old = GrantMap::from([(f.member, exists()), (f.scope.public_role, PermissionSet::new())]);
        let new = GrantMap::from([(f.member, exists()), (f.editor, exists())]);

        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Replace(new));
        assert_eq!(diff.appear, BTreeSet::from([f.editor]));
        assert_eq!(diff.update, BTreeSet::from([f.member]));
        assert!(diff.disappear.is_empty());
        assert!(!diff.public_appear && !diff.public_update && !diff.public_disappear);
    }

    #[test]
    fn test_public_revocation_is_community_wide() {
        let f = fixture();
        let old = GrantMap::from([(f.scope.public_role, exists())]);

        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Replace(GrantMap::new()));
        assert!(diff.public_disappear);
        assert!(diff.appear.is_empty() && diff.update.is_empty() && diff.disappear.is_empty());
    }

    #[test]
    fn test_unchanged_updates_visible_roles() {
        let f = fixture();
        let old = GrantMap::from([
            (f.member, exists()),
            (f.editor, PermissionSet::from([Permission::ChannelRead])),
            (f.scope.public_role, exists()),
            (f.scope.admin_role, exists()),
        ]);

        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Unchanged);
        assert_eq!(diff.update, BTreeSet::from([f.member]));
        assert!(diff.public_update);
        assert!(diff.appear.is_empty() && diff.disappear.is_empty());
    }

    #[test]
    fn test_never_visible_role_is_ignored() {
        let f = fixture();
        let old = GrantMap::from([(f.editor, PermissionSet::from([Permission::ChannelRead]))]);
        let new = GrantMap::from([(f.editor, PermissionSet::from([Permission::ChannelWrite]))]);

        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Replace(new));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_explicit_revocation() {
        let f = fixture();
        let old = GrantMap::from([(f.member, PermissionSet::from([EXISTS, Permission::ChannelRead]))]);
        let new = GrantMap::from([(f.member, PermissionSet::from([Permission::ChannelRead]))]);

        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Replace(new));
        assert_eq!(diff.disappear, BTreeSet::from([f.member]));
        assert!(!diff.public_after());
    }

    #[test]
    fn test_admin_is_never_classified() {
        let f = fixture();
        let old = GrantMap::from([(f.scope.admin_role, exists())]);
        let diff = VisibilityDiff::compute(EXISTS, f.scope, &old, &GrantChange::Replace(GrantMap::new()));
        assert!(diff.is_empty());
    }
}
