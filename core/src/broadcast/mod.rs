//! Broadcaster contract
//!
//! The broadcaster holds live client connections grouped into rooms (one
//! per role, one per community) and delivers an event to every connection
//! that matches the target audience and does not match the exclusion
//! audience. Two transports are provided:
//! - `LocalBroadcaster`: in-process connections fed through channels
//! - `FrameBroadcaster`: CBOR frames handed to an external transport

pub mod frame;
pub mod local;

pub use frame::{Frame, FrameBroadcaster};
pub use local::{LocalBroadcaster, PushNotice};

use crate::permissions::ResourceKind;
use crate::types::*;
use crate::Error;
use async_trait::async_trait;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Notification kind delivered to clients
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryAction {
    #[n(0)]
    Appear,
    #[n(1)]
    Update,
    #[n(2)]
    Disappear,
}

impl fmt::Display for DeliveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryAction::Appear => "appear",
            DeliveryAction::Update => "update",
            DeliveryAction::Disappear => "disappear",
        };
        f.write_str(name)
    }
}

/// Set of rooms and users a delivery addresses
#[derive(Clone, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    #[n(0)]
    pub role_ids: BTreeSet<RoleId>,
    #[n(1)]
    pub community_ids: BTreeSet<CommunityId>,
    #[n(2)]
    pub user_ids: BTreeSet<UserId>,
}

impl Audience {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles<I: IntoIterator<Item = RoleId>>(roles: I) -> Self {
        Self {
            role_ids: roles.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn community(community_id: CommunityId) -> Self {
        Self {
            community_ids: BTreeSet::from([community_id]),
            ..Default::default()
        }
    }

    pub fn with_community(mut self, community_id: CommunityId) -> Self {
        self.community_ids.insert(community_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_ids.insert(user_id);
        self
    }

    /// Union of two audiences
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            role_ids: self.role_ids.union(&other.role_ids).copied().collect(),
            community_ids: self.community_ids.union(&other.community_ids).copied().collect(),
            user_ids: self.user_ids.union(&other.user_ids).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.role_ids.is_empty() && self.community_ids.is_empty() && self.user_ids.is_empty()
    }

    /// Check whether a viewer with the given rooms is addressed
    pub fn matches(
        &self,
        user_id: Option<UserId>,
        roles: &BTreeSet<RoleId>,
        communities: &BTreeSet<CommunityId>,
    ) -> bool {
        user_id.map(|u| self.user_ids.contains(&u)).unwrap_or(false)
            || !self.role_ids.is_disjoint(roles)
            || !self.community_ids.is_disjoint(communities)
    }
}

/// Event handed to clients
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: ResourceKind,
    pub action: DeliveryAction,
    pub resource_id: ResourceId,
    pub community_id: CommunityId,
    /// Resource-specific fields built by the mutation handler
    pub body: serde_json::Value,
}

/// One delivery instruction
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub envelope: Envelope,
    pub target: Audience,
    pub exclude: Audience,
    /// Offline recipients to notify by push. Independent of `exclude`.
    pub push_fallback: Audience,
}

/// Transport-level delivery failure
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Broadcaster closed")]
    Closed,

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<BroadcastError> for Error {
    fn from(e: BroadcastError) -> Self {
        Error::DeliveryUnavailable(e.to_string())
    }
}

/// Real-time transport holding live connections
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Dispatch one delivery. Never retried by the caller.
    async fn deliver(&self, delivery: Delivery) -> Result<(), BroadcastError>;

    /// Subscribe every connection of a user to the given rooms
    async fn join_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError>;

    /// Unsubscribe every connection of a user from the given rooms
    async fn leave_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError>;
}
