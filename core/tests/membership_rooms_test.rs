//! Membership changes moving live connections between rooms

use commons_core::broadcast::{Audience, Broadcaster, DeliveryAction, LocalBroadcaster};
use commons_core::config::{DeliveryConfig, RoleConfig};
use commons_core::grants::{GrantChange, GrantMap};
use commons_core::permissions::{Permission, PermissionSet, ResourceKind};
use commons_core::roles::{
    AssignmentRule, MembershipChange, MembershipService, MemoryRoleStore, RoleDraft, RoleKind, TokenRequirement,
    TokenRules,
};
use commons_core::routing::TargetingRouter;
use commons_core::testkit::*;
use commons_core::{ContractId, Error, ResourceId, UserId};
use std::collections::BTreeSet;
use std::sync::Arc;

fn exists() -> PermissionSet {
    PermissionSet::from([Permission::ChannelExists])
}

#[tokio::test]
async fn test_claimed_role_starts_receiving() {
    let community = TestCommunity::local().await.unwrap();
    let editor = community.custom_role("Editor").await.unwrap();
    let mut viewer = community.viewer(&[]).await.unwrap();
    let user = viewer.user_id.unwrap();

    let channel = ResourceId::new();
    community
        .coordinator
        .create(
            ResourceKind::Channel,
            channel,
            community.community_id(),
            GrantMap::from([(editor, exists())]),
            payload("drafts"),
        )
        .await
        .unwrap();
    assert!(viewer.actions().is_empty());

    community.membership.join(user, editor).await.unwrap();
    assert_eq!(community.sync_rooms().await.unwrap(), 1);
    assert!(community.broadcaster.in_role_room(user, editor).await);

    community
        .coordinator
        .update(ResourceKind::Channel, channel, community.community_id(), GrantChange::Unchanged, None, payload("drafts"))
        .await
        .unwrap();
    assert_eq!(viewer.actions(), vec![DeliveryAction::Update]);

    community.membership.leave(user, editor).await.unwrap();
    community.sync_rooms().await.unwrap();
    community
        .coordinator
        .update(ResourceKind::Channel, channel, community.community_id(), GrantChange::Unchanged, None, payload("drafts"))
        .await
        .unwrap();
    assert!(viewer.actions().is_empty());
}

#[tokio::test]
async fn test_leaving_community_leaves_every_room() {
    let community = TestCommunity::local().await.unwrap();
    let editor = community.custom_role("Editor").await.unwrap();
    let mut viewer = community.viewer(&[editor]).await.unwrap();
    let user = viewer.user_id.unwrap();

    let event = community
        .membership
        .leave_community(user, community.community_id())
        .await
        .unwrap();
    match &event.change {
        MembershipChange::LeftCommunity { role_ids } => assert_eq!(role_ids.len(), 2),
        other => panic!("unexpected change {:?}", other),
    }
    community.sync_rooms().await.unwrap();
    assert!(!community.broadcaster.in_role_room(user, editor).await);
    assert!(!community.broadcaster.in_role_room(user, community.roster.member).await);

    let public = ResourceId::new();
    community
        .coordinator
        .create(
            ResourceKind::Channel,
            public,
            community.community_id(),
            GrantMap::from([(community.roster.public, exists()), (editor, exists())]),
            payload("lobby"),
        )
        .await
        .unwrap();
    assert!(viewer.actions().is_empty());
}

#[tokio::test]
async fn test_token_gated_claim() {
    let community = TestCommunity::local().await.unwrap();
    let holder = community
        .membership
        .create_role(
            community.community_id(),
            RoleDraft {
                title: "Holder".into(),
                kind: RoleKind::CustomAuto,
                assignment_rule: AssignmentRule::Token(TokenRules::single(TokenRequirement {
                    contract_id: ContractId::new(),
                    amount: "100".into(),
                })),
                permissions: BTreeSet::new(),
            },
        )
        .await
        .unwrap();

    let user = UserId::new();
    assert!(matches!(community.membership.claim(user, holder.id).await, Err(Error::Forbidden(_))));

    community.oracle.allow(user).await;
    assert!(community.membership.claim(user, holder.id).await.unwrap().is_some());
    assert!(community.membership.claim(user, holder.id).await.unwrap().is_none());
    assert_eq!(community.sync_rooms().await.unwrap(), 1);
    println!("✓ Eligible user claimed the token-gated role once");
}

#[tokio::test]
async fn test_deleted_role_loses_grants_and_rooms() {
    let community = TestCommunity::recording().await.unwrap();
    let editor = community.custom_role("Editor").await.unwrap();
    let user = UserId::new();
    community.enroll(user, &[editor]).await.unwrap();

    let channel = ResourceId::new();
    community
        .coordinator
        .create(
            ResourceKind::Channel,
            channel,
            community.community_id(),
            GrantMap::from([(editor, exists())]),
            payload("drafts"),
        )
        .await
        .unwrap();
    community.broadcaster.clear().await;

    let events = community
        .coordinator
        .delete_role(&community.membership, community.community_id(), editor)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    community.sync_rooms().await.unwrap();

    let changes = community.broadcaster.room_changes().await;
    assert_eq!(changes, vec![RoomChange::Leave(user, Audience::roles([editor]))]);

    let snapshot = community.coordinator.registry().current(channel).await.unwrap();
    assert!(!snapshot.grants.contains_key(&editor));
    assert!(snapshot.grants.contains_key(&community.roster.admin));
    let remaining = community.membership.user_roles(user, community.community_id()).await.unwrap();
    assert_eq!(remaining, vec![community.roster.member]);
}

#[tokio::test]
async fn test_background_room_sync() {
    let roles = Arc::new(MemoryRoleStore::new());
    let broadcaster = Arc::new(LocalBroadcaster::new());
    let (membership, events) = MembershipService::new(roles.clone(), Arc::new(StaticOracle::new()), RoleConfig::default());
    let roster = membership.create_community_roles(commons_core::CommunityId::new()).await.unwrap();

    let router = Arc::new(TargetingRouter::new(
        broadcaster.clone() as Arc<dyn Broadcaster>,
        roles.clone(),
        DeliveryConfig::default(),
    ));
    let sync = router.spawn_membership_sync(events);

    let user = UserId::new();
    membership.join_community(user, roster.community_id).await.unwrap();
    membership.join(user, roster.admin).await.unwrap();

    // Dropping the service closes the channel and ends the task
    drop(membership);
    sync.await.unwrap();

    assert!(broadcaster.in_role_room(user, roster.member).await);
    assert!(broadcaster.in_role_room(user, roster.admin).await);
}
