//! Mutation pipeline
//!
//! Ties the grant registry, the visibility diff and the targeting router
//! together for resource create, update and delete. Roster lookup and body
//! rendering run before the grant write; once the write commits, delivery
//! failures only show up in the receipts.

use crate::broadcast::DeliveryAction;
use crate::grants::{GrantChange, GrantMap, GrantRegistry};
use crate::permissions::ResourceKind;
use crate::roles::{MembershipEvent, MembershipService};
use crate::routing::{DeliveryReceipt, TargetingRouter};
use crate::types::*;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

/// Result of a committed mutation
#[derive(Clone, Debug)]
pub struct MutationReceipt {
    /// Grant revision after the mutation (last revision for deletes)
    pub revision: u64,
    pub deliveries: Vec<DeliveryReceipt>,
}

impl MutationReceipt {
    /// Receipt of one action, if it was routed
    pub fn delivery(&self, action: DeliveryAction) -> Option<&DeliveryReceipt> {
        self.deliveries.iter().find(|d| d.action == action)
    }
}

/// Entry point for resource mutation handlers
#[derive(Clone)]
pub struct MutationCoordinator {
    registry: GrantRegistry,
    router: Arc<TargetingRouter>,
}

impl MutationCoordinator {
    pub fn new(registry: GrantRegistry, router: Arc<TargetingRouter>) -> Self {
        Self { registry, router }
    }

    pub fn registry(&self) -> &GrantRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TargetingRouter> {
        &self.router
    }

    /// Store the grants of a new resource and announce it
    pub async fn create<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        grants: GrantMap,
        build: F,
    ) -> Result<MutationReceipt>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let prepared = self.router.prepare(kind, resource_id, community_id, build).await?;
        let snapshot = self.registry.create(kind, resource_id, community_id, grants).await?;
        tracing::info!(resource = %resource_id, kind = %kind, community = %community_id, "Resource created");

        let deliveries = self
            .router
            .dispatch(&prepared, &GrantMap::new(), &GrantChange::Replace(snapshot.grants))
            .await;
        Ok(MutationReceipt {
            revision: snapshot.revision,
            deliveries,
        })
    }

    /// Apply a grant change (or a grant-preserving edit) and notify viewers.
    ///
    /// `expected_revision` turns the write into a compare-and-swap.
    pub async fn update<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        change: GrantChange,
        expected_revision: Option<u64>,
        build: F,
    ) -> Result<MutationReceipt>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let prepared = self.router.prepare(kind, resource_id, community_id, build).await?;
        let (old, new, revision) = match change {
            GrantChange::Replace(grants) => {
                let transition = self
                    .registry
                    .replace(kind, resource_id, community_id, grants, expected_revision)
                    .await?;
                (
                    transition.before.grants,
                    GrantChange::Replace(transition.after.grants),
                    transition.after.revision,
                )
            }
            GrantChange::Unchanged => {
                let snapshot = self.registry.snapshot(kind, resource_id, community_id).await?;
                if let Some(expected) = expected_revision {
                    if expected != snapshot.revision {
                        return Err(Error::Conflict {
                            resource: resource_id.to_string(),
                            expected,
                            actual: snapshot.revision,
                        });
                    }
                }
                (snapshot.grants, GrantChange::Unchanged, snapshot.revision)
            }
        };
        tracing::info!(resource = %resource_id, kind = %kind, revision, "Resource updated");

        let deliveries = self.router.dispatch(&prepared, &old, &new).await;
        Ok(MutationReceipt { revision, deliveries })
    }

    /// Remove a resource's grants and tell every viewer it is gone
    pub async fn delete<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        build: F,
    ) -> Result<MutationReceipt>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let prepared = self.router.prepare(kind, resource_id, community_id, build).await?;
        let removed = self.registry.remove(kind, resource_id, community_id).await?;
        tracing::info!(resource = %resource_id, kind = %kind, community = %community_id, "Resource deleted");

        let deliveries = self
            .router
            .dispatch(&prepared, &removed.grants, &GrantChange::Replace(GrantMap::new()))
            .await;
        Ok(MutationReceipt {
            revision: removed.revision,
            deliveries,
        })
    }

    /// Delete a custom role together with its memberships and grants
    pub async fn delete_role(
        &self,
        membership: &MembershipService,
        community_id: CommunityId,
        role_id: RoleId,
    ) -> Result<Vec<MembershipEvent>> {
        let events = membership.delete_role(community_id, role_id).await?;
        self.registry.purge_role(role_id).await?;
        Ok(events)
    }
}
