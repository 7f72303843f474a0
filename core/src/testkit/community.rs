use super::RecordingBroadcaster;
use crate::broadcast::{Audience, Broadcaster, DeliveryAction, Envelope, LocalBroadcaster};
use crate::config::CoreConfig;
use crate::grants::{GrantRegistry, MemoryGrantStore};
use crate::mutation::MutationCoordinator;
use crate::roles::{
    AssignmentRule, CommunityRoster, EligibilityOracle, MembershipEvent, MembershipService, MemoryRoleStore,
    RoleDraft, RoleKind,
};
use crate::routing::TargetingRouter;
use crate::types::*;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Eligibility oracle backed by an allow list
#[derive(Default)]
pub struct StaticOracle {
    eligible: RwLock<HashSet<UserId>>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn allow(&self, user_id: UserId) {
        self.eligible.write().await.insert(user_id);
    }
}

#[async_trait]
impl EligibilityOracle for StaticOracle {
    async fn evaluate(&self, user_id: UserId, _rule: &AssignmentRule) -> Result<bool> {
        Ok(self.eligible.read().await.contains(&user_id))
    }
}

/// Payload builder tagging a title with the action
pub fn payload(title: &str) -> impl Fn(DeliveryAction) -> serde_json::Value {
    let title = title.to_string();
    move |action| serde_json::json!({ "title": title, "action": action })
}

/// One seeded community wired to a broadcaster
pub struct TestCommunity<B> {
    pub roles: Arc<MemoryRoleStore>,
    pub grants: Arc<MemoryGrantStore>,
    pub oracle: Arc<StaticOracle>,
    pub membership: MembershipService,
    pub coordinator: MutationCoordinator,
    pub broadcaster: Arc<B>,
    pub roster: CommunityRoster,
    events: Mutex<mpsc::UnboundedReceiver<MembershipEvent>>,
}

impl<B: Broadcaster + 'static> TestCommunity<B> {
    pub async fn with_broadcaster(broadcaster: Arc<B>, config: CoreConfig) -> Result<Self> {
        let roles = Arc::new(MemoryRoleStore::new());
        let grants = Arc::new(MemoryGrantStore::new());
        let oracle = Arc::new(StaticOracle::new());

        let (membership, events) = MembershipService::new(roles.clone(), oracle.clone(), config.roles.clone());
        let roster = membership.create_community_roles(CommunityId::new()).await?;

        let registry = GrantRegistry::new(grants.clone(), roles.clone());
        let router = Arc::new(TargetingRouter::new(
            broadcaster.clone() as Arc<dyn Broadcaster>,
            roles.clone(),
            config.delivery.clone(),
        ));
        let coordinator = MutationCoordinator::new(registry, router);

        Ok(Self {
            roles,
            grants,
            oracle,
            membership,
            coordinator,
            broadcaster,
            roster,
            events: Mutex::new(events),
        })
    }

    pub fn community_id(&self) -> CommunityId {
        self.roster.community_id
    }

    /// Create a manually assigned custom role
    pub async fn custom_role(&self, title: &str) -> Result<RoleId> {
        let role = self
            .membership
            .create_role(
                self.community_id(),
                RoleDraft {
                    title: title.to_string(),
                    kind: RoleKind::CustomManual,
                    assignment_rule: AssignmentRule::None,
                    permissions: BTreeSet::new(),
                },
            )
            .await?;
        Ok(role.id)
    }

    /// Apply pending membership events to the broadcaster's rooms
    pub async fn sync_rooms(&self) -> Result<usize> {
        let mut events = self.events.lock().await;
        let mut applied = 0;
        while let Ok(event) = events.try_recv() {
            self.coordinator.router().apply_membership_event(&event).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Join the community and the given roles, then sync rooms
    pub async fn enroll(&self, user_id: UserId, roles: &[RoleId]) -> Result<()> {
        self.membership.join_community(user_id, self.community_id()).await?;
        self.assign(user_id, roles).await
    }

    /// Assign roles directly without the Member role, then sync rooms
    pub async fn assign(&self, user_id: UserId, roles: &[RoleId]) -> Result<()> {
        for role in roles {
            self.membership.join(user_id, *role).await?;
        }
        self.sync_rooms().await?;
        Ok(())
    }
}

impl TestCommunity<LocalBroadcaster> {
    pub async fn local() -> Result<Self> {
        Self::local_with(CoreConfig::default()).await
    }

    pub async fn local_with(config: CoreConfig) -> Result<Self> {
        Self::with_broadcaster(Arc::new(LocalBroadcaster::new()), config).await
    }

    /// A connected member holding `roles` on top of Member
    pub async fn viewer(&self, roles: &[RoleId]) -> Result<Viewer> {
        let user_id = UserId::new();
        self.enroll(user_id, roles).await?;
        let (connection_id, rx) = self.broadcaster.connect(user_id, &Audience::new()).await;
        Ok(Viewer {
            user_id: Some(user_id),
            connection_id,
            rx,
        })
    }

    /// A connected user holding exactly `roles`
    pub async fn guest(&self, roles: &[RoleId]) -> Result<Viewer> {
        let user_id = UserId::new();
        self.assign(user_id, roles).await?;
        let (connection_id, rx) = self.broadcaster.connect(user_id, &Audience::new()).await;
        Ok(Viewer {
            user_id: Some(user_id),
            connection_id,
            rx,
        })
    }

    /// A connected visitor who is not signed in
    pub async fn anonymous_viewer(&self) -> Viewer {
        let (connection_id, rx) = self.broadcaster.connect_anonymous(&[self.community_id()]).await;
        Viewer {
            user_id: None,
            connection_id,
            rx,
        }
    }
}

impl TestCommunity<RecordingBroadcaster> {
    pub async fn recording() -> Result<Self> {
        Self::with_broadcaster(Arc::new(RecordingBroadcaster::new()), CoreConfig::default()).await
    }
}

/// A live connection and what it received
pub struct Viewer {
    pub user_id: Option<UserId>,
    pub connection_id: ConnectionId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Viewer {
    /// Everything received since the last drain
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut received = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            received.push(envelope);
        }
        received
    }

    /// Actions received since the last drain
    pub fn actions(&mut self) -> Vec<DeliveryAction> {
        self.drain().into_iter().map(|e| e.action).collect()
    }
}
