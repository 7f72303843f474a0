//! Permission model
//!
//! Two families of permissions exist:
//! - `CommunityPermission`: held by a role itself (manage channels, moderate, ...)
//! - `Permission`: granted to a role on one role-gated resource. Every resource
//!   kind owns a disjoint subset of these bits, exactly one of which is the
//!   *existence* bit that gates whether the resource is visible at all.

use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of a role-gated resource
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[n(0)]
    Channel,
    #[n(1)]
    Article,
    #[n(2)]
    Event,
    #[n(3)]
    Call,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Channel,
        ResourceKind::Article,
        ResourceKind::Event,
        ResourceKind::Call,
    ];

    /// The permission bit that gates visibility for this kind
    pub fn existence_bit(&self) -> Permission {
        match self {
            ResourceKind::Channel => Permission::ChannelExists,
            ResourceKind::Article => Permission::ArticlePreview,
            ResourceKind::Event => Permission::EventPreview,
            ResourceKind::Call => Permission::CallExists,
        }
    }

    /// Every permission bit belonging to this kind
    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            ResourceKind::Channel => &[ChannelExists, ChannelRead, ChannelWrite, ChannelModerate],
            ResourceKind::Article => &[ArticlePreview, ArticleRead],
            ResourceKind::Event => &[EventPreview, EventAttend, EventModerate],
            ResourceKind::Call => &[
                CallExists,
                CallJoin,
                CallModerate,
                CallChannelRead,
                CallChannelWrite,
                AudioSend,
                VideoSend,
                ShareScreen,
                PinForEveryone,
                EndCallForEveryone,
            ],
        }
    }

    /// Fixed maximal preset injected for the Admin role on every grant write
    pub fn admin_preset(&self) -> PermissionSet {
        self.permissions().iter().copied().collect()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Channel => "channel",
            ResourceKind::Article => "article",
            ResourceKind::Event => "event",
            ResourceKind::Call => "call",
        };
        f.write_str(name)
    }
}

/// Permission bit granted to a role on a single resource
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    // Channel
    ChannelExists,
    ChannelRead,
    ChannelWrite,
    ChannelModerate,

    // Article
    ArticlePreview,
    ArticleRead,

    // Scheduled event
    EventPreview,
    EventAttend,
    EventModerate,

    // Call
    CallExists,
    CallJoin,
    CallModerate,
    CallChannelRead,
    CallChannelWrite,
    AudioSend,
    VideoSend,
    ShareScreen,
    PinForEveryone,
    EndCallForEveryone,
}

impl Permission {
    /// Resource kind this bit belongs to
    pub fn kind(&self) -> ResourceKind {
        use Permission::*;
        match self {
            ChannelExists | ChannelRead | ChannelWrite | ChannelModerate => ResourceKind::Channel,
            ArticlePreview | ArticleRead => ResourceKind::Article,
            EventPreview | EventAttend | EventModerate => ResourceKind::Event,
            CallExists | CallJoin | CallModerate | CallChannelRead | CallChannelWrite | AudioSend
            | VideoSend | ShareScreen | PinForEveryone | EndCallForEveryone => ResourceKind::Call,
        }
    }

    /// Whether this is the visibility-gating bit of its kind
    pub fn is_existence(&self) -> bool {
        self.kind().existence_bit() == *self
    }
}

/// Set of resource permission bits held by one role on one resource
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn remove(&mut self, permission: Permission) -> bool {
        self.0.remove(&permission)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    /// Check whether the set carries the existence bit of `kind`
    pub fn grants_existence(&self, kind: ResourceKind) -> bool {
        self.contains(kind.existence_bit())
    }

    /// First bit not belonging to `kind`, if any
    pub fn foreign_bit(&self, kind: ResourceKind) -> Option<Permission> {
        self.iter().find(|p| p.kind() != kind)
    }

    /// Merge permissions (union of two permission sets)
    pub fn merge(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Intersect permissions (only permissions present in both)
    pub fn intersect(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Permission; N]> for PermissionSet {
    fn from(bits: [Permission; N]) -> Self {
        bits.into_iter().collect()
    }
}

/// Community-level permission held by a role
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunityPermission {
    ManageInfo,
    ManageChannels,
    ManageRoles,
    ManageArticles,
    Moderate,
    ManageUserApplications,
    WebrtcCreate,
    WebrtcCreateCustom,
    WebrtcModerate,
    ManageEvents,
}

impl CommunityPermission {
    pub const ALL: [CommunityPermission; 10] = [
        CommunityPermission::ManageInfo,
        CommunityPermission::ManageChannels,
        CommunityPermission::ManageRoles,
        CommunityPermission::ManageArticles,
        CommunityPermission::Moderate,
        CommunityPermission::ManageUserApplications,
        CommunityPermission::WebrtcCreate,
        CommunityPermission::WebrtcCreateCustom,
        CommunityPermission::WebrtcModerate,
        CommunityPermission::ManageEvents,
    ];

    /// Default admin permissions (full control)
    pub fn admin_preset() -> BTreeSet<CommunityPermission> {
        Self::ALL.into_iter().collect()
    }

    /// Default member permissions
    pub fn member_preset() -> BTreeSet<CommunityPermission> {
        BTreeSet::from([CommunityPermission::WebrtcCreate])
    }
}
