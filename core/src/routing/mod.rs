//! Targeting router
//!
//! Turns a visibility diff into delivery instructions and hands them to the
//! broadcaster, and keeps broadcaster rooms in step with role membership.
//!
//! A viewer's outcome is decided by whether any of their rooms could see the
//! resource before (update or disappear rooms) and after (appear or update
//! rooms) the change:
//! - `update` reaches update rooms with no exclusion
//! - `appear` reaches appear rooms, excluding anyone in an update or
//!   disappear room
//! - `disappear` reaches disappear rooms, excluding anyone in an appear or
//!   update room, and is dropped entirely while the resource stays public
//!
//! A viewer holding roles in several buckets therefore gets exactly one
//! delivery, or none when their visibility did not change.

use crate::broadcast::{Audience, Broadcaster, Delivery, DeliveryAction, Envelope};
use crate::config::DeliveryConfig;
use crate::grants::{GrantChange, GrantMap};
use crate::permissions::ResourceKind;
use crate::roles::{MembershipChange, MembershipEvent, RoleDirectory};
use crate::types::*;
use crate::visibility::{DiffScope, VisibilityDiff};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to one delivery
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    /// Empty target, nothing handed to the broadcaster
    Skipped,
    /// Broadcaster failed; the mutation stays committed
    Unavailable(String),
}

/// Record of one routed delivery
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub action: DeliveryAction,
    pub target: Audience,
    pub exclude: Audience,
    pub outcome: DeliveryOutcome,
}

/// Target and exclusion of one delivery before it has a body
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PlannedDelivery {
    pub action: DeliveryAction,
    pub target: Audience,
    pub exclude: Audience,
    pub push_fallback: Audience,
}

/// Derive deliveries from a diff, in disappear, update, appear order
pub fn plan(diff: &VisibilityDiff, community_id: CommunityId, push_fallback: bool) -> Vec<PlannedDelivery> {
    let rooms = |roles: &std::collections::BTreeSet<RoleId>, public: bool| {
        let audience = Audience::roles(roles.iter().copied());
        if public {
            audience.with_community(community_id)
        } else {
            audience
        }
    };

    let appear = rooms(&diff.appear, diff.public_appear);
    let update = rooms(&diff.update, diff.public_update);
    let disappear = rooms(&diff.disappear, diff.public_disappear);

    let mut planned = Vec::with_capacity(3);
    // Public access dominates narrower revocations
    if !diff.public_after() {
        planned.push(PlannedDelivery {
            action: DeliveryAction::Disappear,
            target: disappear.clone(),
            exclude: appear.merge(&update),
            push_fallback: Audience::new(),
        });
    }
    planned.push(PlannedDelivery {
        action: DeliveryAction::Update,
        target: update.clone(),
        exclude: Audience::new(),
        push_fallback: Audience::new(),
    });
    planned.push(PlannedDelivery {
        action: DeliveryAction::Appear,
        push_fallback: if push_fallback { appear.clone() } else { Audience::new() },
        target: appear,
        exclude: update.merge(&disappear),
    });
    planned
}

/// Roster scope and rendered bodies of one resource, ready to route
#[derive(Clone, Debug)]
pub struct PreparedRoute {
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub community_id: CommunityId,
    scope: DiffScope,
    bodies: BTreeMap<DeliveryAction, serde_json::Value>,
}

impl PreparedRoute {
    fn body(&self, action: DeliveryAction) -> serde_json::Value {
        self.bodies.get(&action).cloned().unwrap_or_default()
    }
}

// Build every body up front so a payload error delivers nothing
fn render<P, F>(build: F) -> Result<BTreeMap<DeliveryAction, serde_json::Value>>
where
    P: Serialize,
    F: Fn(DeliveryAction) -> P,
{
    [DeliveryAction::Disappear, DeliveryAction::Update, DeliveryAction::Appear]
        .into_iter()
        .map(|action| -> Result<_> { Ok((action, serde_json::to_value(build(action))?)) })
        .collect()
}

/// Routes visibility changes and membership changes to a broadcaster
pub struct TargetingRouter {
    broadcaster: Arc<dyn Broadcaster>,
    directory: Arc<dyn RoleDirectory>,
    config: DeliveryConfig,
}

impl TargetingRouter {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, directory: Arc<dyn RoleDirectory>, config: DeliveryConfig) -> Self {
        Self {
            broadcaster,
            directory,
            config,
        }
    }

    /// Diff `old` against `new` and deliver the result.
    ///
    /// `build` produces the resource-specific body of each delivery.
    pub async fn compute_and_route<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        old: &GrantMap,
        new: &GrantChange,
        build: F,
    ) -> Result<Vec<DeliveryReceipt>>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let prepared = self.prepare(kind, resource_id, community_id, build).await?;
        Ok(self.dispatch(&prepared, old, new).await)
    }

    /// Resolve the roster scope and render every body of a resource.
    ///
    /// Everything that can fail happens here, so callers run it before
    /// committing the grant write and [`dispatch`](Self::dispatch) afterwards.
    pub async fn prepare<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        build: F,
    ) -> Result<PreparedRoute>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let roster = self.directory.roster(community_id).await?;
        Ok(PreparedRoute {
            kind,
            resource_id,
            community_id,
            scope: DiffScope::from(&roster),
            bodies: render(build)?,
        })
    }

    /// Diff and deliver with a prepared route. Failures land in the receipts.
    pub async fn dispatch(&self, prepared: &PreparedRoute, old: &GrantMap, new: &GrantChange) -> Vec<DeliveryReceipt> {
        let diff = VisibilityDiff::compute(prepared.kind.existence_bit(), prepared.scope, old, new);
        self.deliver_planned(prepared, &diff).await
    }

    /// Deliver an already computed diff
    pub async fn route<P, F>(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        diff: &VisibilityDiff,
        build: F,
    ) -> Result<Vec<DeliveryReceipt>>
    where
        P: Serialize,
        F: Fn(DeliveryAction) -> P,
    {
        let prepared = self.prepare(kind, resource_id, community_id, build).await?;
        Ok(self.deliver_planned(&prepared, diff).await)
    }

    async fn deliver_planned(&self, prepared: &PreparedRoute, diff: &VisibilityDiff) -> Vec<DeliveryReceipt> {
        let PreparedRoute {
            kind,
            resource_id,
            community_id,
            ..
        } = *prepared;
        let planned = plan(diff, community_id, self.config.push_fallback);

        let mut receipts = Vec::with_capacity(planned.len());
        for p in planned {
            let outcome = if p.target.is_empty() && !self.config.deliver_empty {
                DeliveryOutcome::Skipped
            } else {
                let delivery = Delivery {
                    envelope: Envelope {
                        kind,
                        action: p.action,
                        resource_id,
                        community_id,
                        body: prepared.body(p.action),
                    },
                    target: p.target.clone(),
                    exclude: p.exclude.clone(),
                    push_fallback: p.push_fallback,
                };
                match self.broadcaster.deliver(delivery).await {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(e) => {
                        let err = Error::from(e);
                        tracing::warn!(
                            resource = %resource_id,
                            action = %p.action,
                            error = %err,
                            "Delivery failed, clients reconcile on read"
                        );
                        DeliveryOutcome::Unavailable(err.to_string())
                    }
                }
            };
            receipts.push(DeliveryReceipt {
                action: p.action,
                target: p.target,
                exclude: p.exclude,
                outcome,
            });
        }

        tracing::debug!(resource = %resource_id, kind = %kind, deliveries = receipts.len(), "Routed visibility change");
        receipts
    }

    /// Move a user's connections between rooms after a membership change
    pub async fn apply_membership_event(&self, event: &MembershipEvent) -> Result<()> {
        let user_id = event.user_id;
        match &event.change {
            MembershipChange::RolesAdded { role_ids } => {
                self.broadcaster
                    .join_rooms(user_id, &Audience::roles(role_ids.iter().copied()))
                    .await?
            }
            MembershipChange::JoinedCommunity { role_ids } => {
                let rooms = Audience::roles(role_ids.iter().copied()).with_community(event.community_id);
                self.broadcaster.join_rooms(user_id, &rooms).await?
            }
            MembershipChange::RolesRemoved { role_ids } => {
                self.broadcaster
                    .leave_rooms(user_id, &Audience::roles(role_ids.iter().copied()))
                    .await?
            }
            MembershipChange::LeftCommunity { role_ids } => {
                let rooms = Audience::roles(role_ids.iter().copied()).with_community(event.community_id);
                self.broadcaster.leave_rooms(user_id, &rooms).await?
            }
        }
        tracing::debug!(user = %user_id, community = %event.community_id, "Synced rooms");
        Ok(())
    }

    /// Apply membership events until every sender is dropped
    pub fn spawn_membership_sync(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MembershipEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.apply_membership_event(&event).await {
                    tracing::warn!(user = %event.user_id, error = %e, "Room sync failed");
                }
            }
            tracing::debug!("Membership sync stopped");
        })
    }
}
