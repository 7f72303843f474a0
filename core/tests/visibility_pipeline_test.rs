//! Visibility pipeline tests
//!
//! Drive resource mutations through the coordinator and check what every
//! kind of live viewer receives through the in-process broadcaster.

use commons_core::broadcast::{Audience, DeliveryAction};
use commons_core::grants::{GrantChange, GrantMap};
use commons_core::permissions::{Permission, PermissionSet, ResourceKind};
use commons_core::routing::DeliveryOutcome;
use commons_core::testkit::*;
use commons_core::{Error, ResourceId, RoleId};
use std::collections::BTreeMap;

const CHANNEL: ResourceKind = ResourceKind::Channel;

fn exists() -> PermissionSet {
    PermissionSet::from([Permission::ChannelExists])
}

fn grants(roles: &[RoleId]) -> GrantMap {
    roles.iter().map(|r| (*r, exists())).collect()
}

#[tokio::test]
async fn test_new_role_grant_reaches_only_new_viewers() {
    let community = TestCommunity::local().await.unwrap();
    let member = community.roster.member;
    let editor = community.custom_role("Editor").await.unwrap();

    let mut member_only = community.viewer(&[]).await.unwrap();
    let mut member_and_editor = community.viewer(&[editor]).await.unwrap();
    let mut editor_only = community.guest(&[editor]).await.unwrap();
    let mut anonymous = community.anonymous_viewer().await;

    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[member]), payload("general"))
        .await
        .unwrap();
    assert_eq!(member_only.actions(), vec![DeliveryAction::Appear]);
    assert_eq!(member_and_editor.actions(), vec![DeliveryAction::Appear]);
    assert!(editor_only.actions().is_empty());
    assert!(anonymous.actions().is_empty());

    let receipt = community
        .coordinator
        .update(
            CHANNEL,
            channel,
            community.community_id(),
            GrantChange::Replace(grants(&[member, editor])),
            None,
            payload("general"),
        )
        .await
        .unwrap();

    assert_eq!(member_only.actions(), vec![DeliveryAction::Update]);
    assert_eq!(member_and_editor.actions(), vec![DeliveryAction::Update]);
    assert_eq!(editor_only.actions(), vec![DeliveryAction::Appear]);
    assert!(anonymous.actions().is_empty());

    let appear = receipt.delivery(DeliveryAction::Appear).unwrap();
    assert_eq!(appear.target, Audience::roles([editor]));
    assert_eq!(appear.exclude, Audience::roles([member]));
    assert_eq!(receipt.revision, 2);
    println!("✓ Multi-role viewer received a single update");
}

#[tokio::test]
async fn test_public_revocation_reaches_whole_community() {
    let community = TestCommunity::local().await.unwrap();
    let mut member = community.viewer(&[]).await.unwrap();
    let mut anonymous = community.anonymous_viewer().await;

    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[community.roster.public]), payload("lobby"))
        .await
        .unwrap();
    assert_eq!(member.actions(), vec![DeliveryAction::Appear]);
    assert_eq!(anonymous.actions(), vec![DeliveryAction::Appear]);

    let receipt = community
        .coordinator
        .update(
            CHANNEL,
            channel,
            community.community_id(),
            GrantChange::Replace(GrantMap::new()),
            None,
            payload("lobby"),
        )
        .await
        .unwrap();

    assert_eq!(member.actions(), vec![DeliveryAction::Disappear]);
    assert_eq!(anonymous.actions(), vec![DeliveryAction::Disappear]);
    let disappear = receipt.delivery(DeliveryAction::Disappear).unwrap();
    assert_eq!(disappear.target, Audience::community(community.community_id()));
    assert_eq!(disappear.outcome, DeliveryOutcome::Delivered);
}

#[tokio::test]
async fn test_public_grant_dominates_role_revocation() {
    let community = TestCommunity::local().await.unwrap();
    let editor = community.custom_role("Editor").await.unwrap();
    let mut editor_member = community.viewer(&[editor]).await.unwrap();
    let mut plain_member = community.viewer(&[]).await.unwrap();
    let mut anonymous = community.anonymous_viewer().await;

    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[editor]), payload("drafts"))
        .await
        .unwrap();
    assert_eq!(editor_member.actions(), vec![DeliveryAction::Appear]);

    let receipt = community
        .coordinator
        .update(
            CHANNEL,
            channel,
            community.community_id(),
            GrantChange::Replace(grants(&[community.roster.public])),
            None,
            payload("drafts"),
        )
        .await
        .unwrap();

    // Never told the channel is gone while it stays visible through Public
    assert!(receipt.delivery(DeliveryAction::Disappear).is_none());
    assert!(!editor_member.actions().contains(&DeliveryAction::Disappear));
    assert_eq!(plain_member.actions(), vec![DeliveryAction::Appear]);
    assert_eq!(anonymous.actions(), vec![DeliveryAction::Appear]);
}

#[tokio::test]
async fn test_action_bits_only_update() {
    let community = TestCommunity::local().await.unwrap();
    let member = community.roster.member;
    let mut viewer = community.viewer(&[]).await.unwrap();

    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[member]), payload("general"))
        .await
        .unwrap();
    viewer.drain();

    let richer = GrantMap::from([(
        member,
        PermissionSet::from([Permission::ChannelExists, Permission::ChannelRead, Permission::ChannelWrite]),
    )]);
    community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(richer), None, payload("general"))
        .await
        .unwrap();
    assert_eq!(viewer.actions(), vec![DeliveryAction::Update]);

    // Dropping the existence bit hides the channel even with read left
    let read_only = GrantMap::from([(member, PermissionSet::from([Permission::ChannelRead]))]);
    community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(read_only), None, payload("general"))
        .await
        .unwrap();
    assert_eq!(viewer.actions(), vec![DeliveryAction::Disappear]);
}

#[tokio::test]
async fn test_unchanged_grants_update_current_viewers() {
    let community = TestCommunity::local().await.unwrap();
    let editor = community.custom_role("Editor").await.unwrap();
    let mut editor_viewer = community.guest(&[editor]).await.unwrap();
    let mut member = community.viewer(&[]).await.unwrap();

    let event = ResourceId::new();
    let preview = PermissionSet::from([Permission::EventPreview]);
    community
        .coordinator
        .create(
            ResourceKind::Event,
            event,
            community.community_id(),
            GrantMap::from([(editor, preview)]),
            payload("launch"),
        )
        .await
        .unwrap();
    editor_viewer.drain();

    let receipt = community
        .coordinator
        .update(ResourceKind::Event, event, community.community_id(), GrantChange::Unchanged, Some(1), payload("launch v2"))
        .await
        .unwrap();
    assert_eq!(receipt.revision, 1);

    let received = editor_viewer.drain();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].action, DeliveryAction::Update);
    assert_eq!(received[0].kind, ResourceKind::Event);
    assert_eq!(received[0].body["title"], "launch v2");
    assert!(member.actions().is_empty());
}

#[tokio::test]
async fn test_delete_hides_resource() {
    let community = TestCommunity::local().await.unwrap();
    let mut member = community.viewer(&[]).await.unwrap();
    let article = ResourceId::new();
    let preview = GrantMap::from([(community.roster.member, PermissionSet::from([Permission::ArticlePreview]))]);

    community
        .coordinator
        .create(ResourceKind::Article, article, community.community_id(), preview, payload("news"))
        .await
        .unwrap();
    member.drain();

    community
        .coordinator
        .delete(ResourceKind::Article, article, community.community_id(), payload("news"))
        .await
        .unwrap();
    assert_eq!(member.actions(), vec![DeliveryAction::Disappear]);

    let again = community
        .coordinator
        .delete(ResourceKind::Article, article, community.community_id(), payload("news"))
        .await;
    assert!(matches!(again, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_rejected_grants_change_nothing() {
    let community = TestCommunity::local().await.unwrap();
    let other = TestCommunity::local().await.unwrap();
    let mut member = community.viewer(&[]).await.unwrap();

    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[community.roster.member]), payload("general"))
        .await
        .unwrap();
    member.drain();

    for bad in [grants(&[community.roster.admin]), grants(&[other.roster.member])] {
        let result = community
            .coordinator
            .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(bad), None, payload("general"))
            .await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    let snapshot = community.coordinator.registry().current(channel).await.unwrap();
    assert_eq!(snapshot.revision, 1);
    assert!(member.actions().is_empty());
}

#[tokio::test]
async fn test_stale_revision_is_a_conflict() {
    let community = TestCommunity::local().await.unwrap();
    let member = community.roster.member;
    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[member]), payload("general"))
        .await
        .unwrap();
    community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(GrantMap::new()), Some(1), payload("general"))
        .await
        .unwrap();

    let stale = community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(grants(&[member])), Some(1), payload("general"))
        .await;
    match stale {
        Err(e @ Error::Conflict { .. }) => assert!(e.is_retryable()),
        other => panic!("expected conflict, got {:?}", other.map(|r| r.revision)),
    }

    let fresh = community.coordinator.registry().current(channel).await.unwrap();
    let retried = community
        .coordinator
        .update(
            CHANNEL,
            channel,
            community.community_id(),
            GrantChange::Replace(grants(&[member])),
            Some(fresh.revision),
            payload("general"),
        )
        .await
        .unwrap();
    assert_eq!(retried.revision, 3);
}

#[tokio::test]
async fn test_calls_use_their_own_existence_bit() {
    let community = TestCommunity::local().await.unwrap();
    let mut member = community.viewer(&[]).await.unwrap();
    let call = ResourceId::new();

    // Joining without existence grants nothing visible
    let join_only = GrantMap::from([(community.roster.member, PermissionSet::from([Permission::CallJoin]))]);
    community
        .coordinator
        .create(ResourceKind::Call, call, community.community_id(), join_only, payload("standup"))
        .await
        .unwrap();
    assert!(member.actions().is_empty());

    let channel_bit = GrantMap::from([(community.roster.member, exists())]);
    let result = community
        .coordinator
        .update(ResourceKind::Call, call, community.community_id(), GrantChange::Replace(channel_bit), None, payload("standup"))
        .await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn test_unrenderable_body_leaves_grants_untouched() {
    let community = TestCommunity::local().await.unwrap();
    let member = community.roster.member;
    let mut viewer = community.viewer(&[]).await.unwrap();
    let channel = ResourceId::new();
    community
        .coordinator
        .create(CHANNEL, channel, community.community_id(), grants(&[member]), payload("general"))
        .await
        .unwrap();
    viewer.drain();

    // JSON objects need string keys, so this body cannot be rendered
    let broken = |_: DeliveryAction| BTreeMap::from([((1u8, 2u8), 3u8)]);
    let result = community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(GrantMap::new()), Some(1), broken)
        .await;
    assert!(matches!(result, Err(Error::Serialization(_))));

    let snapshot = community.coordinator.registry().current(channel).await.unwrap();
    assert_eq!(snapshot.revision, 1);
    assert!(snapshot.grants.contains_key(&member));
    assert!(viewer.actions().is_empty());

    // Retrying with the same expected revision goes through
    let receipt = community
        .coordinator
        .update(CHANNEL, channel, community.community_id(), GrantChange::Replace(GrantMap::new()), Some(1), payload("general"))
        .await
        .unwrap();
    assert_eq!(receipt.revision, 2);
    assert_eq!(viewer.actions(), vec![DeliveryAction::Disappear]);
}
