//! In-process broadcaster
//!
//! Room subscriptions are kept per user so they survive reconnects; every
//! live connection of a user sees the user's rooms. Anonymous connections
//! carry their own community rooms (they only ever see Public resources).

use super::{Audience, BroadcastError, Broadcaster, Delivery, Envelope};
use crate::types::*;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, RwLock};

/// Push notification queued for a user without a live connection
#[derive(Clone, PartialEq, Debug)]
pub struct PushNotice {
    pub user_id: UserId,
    pub envelope: Envelope,
}

#[derive(Default, Clone, Debug)]
struct Rooms {
    roles: BTreeSet<RoleId>,
    communities: BTreeSet<CommunityId>,
}

impl Rooms {
    fn join(&mut self, audience: &Audience) {
        self.roles.extend(audience.role_ids.iter().copied());
        self.communities.extend(audience.community_ids.iter().copied());
    }

    fn leave(&mut self, audience: &Audience) {
        self.roles.retain(|r| !audience.role_ids.contains(r));
        self.communities.retain(|c| !audience.community_ids.contains(c));
    }

    fn within(&self, audience: &Audience, user_id: Option<UserId>) -> bool {
        audience.matches(user_id, &self.roles, &self.communities)
    }
}

struct Connection {
    user_id: Option<UserId>,
    /// Rooms of an anonymous connection
    rooms: Rooms,
    sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct LocalState {
    subscriptions: HashMap<UserId, Rooms>,
    connections: HashMap<ConnectionId, Connection>,
    push_queue: Vec<PushNotice>,
}

/// Broadcaster delivering to in-process connections
#[derive(Default)]
pub struct LocalBroadcaster {
    state: RwLock<LocalState>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for a signed-in user, joining `rooms` for that user
    pub async fn connect(&self, user_id: UserId, rooms: &Audience) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let mut state = self.state.write().await;
        state.subscriptions.entry(user_id).or_default().join(rooms);
        state.connections.insert(
            id,
            Connection {
                user_id: Some(user_id),
                rooms: Rooms::default(),
                sender,
            },
        );
        tracing::debug!(connection = %id, user = %user_id, "Connection opened");
        (id, rx)
    }

    /// Open a connection for a viewer who is not signed in
    pub async fn connect_anonymous(&self, communities: &[CommunityId]) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let rooms = Rooms {
            roles: BTreeSet::new(),
            communities: communities.iter().copied().collect(),
        };
        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            Connection {
                user_id: None,
                rooms,
                sender,
            },
        );
        (id, rx)
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut state = self.state.write().await;
        state.connections.remove(&connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Whether the user is currently subscribed to a role room
    pub async fn in_role_room(&self, user_id: UserId, role_id: RoleId) -> bool {
        let state = self.state.read().await;
        state
            .subscriptions
            .get(&user_id)
            .map(|rooms| rooms.roles.contains(&role_id))
            .unwrap_or(false)
    }

    /// Drain queued push notifications
    pub async fn take_push_queue(&self) -> Vec<PushNotice> {
        let mut state = self.state.write().await;
        std::mem::take(&mut state.push_queue)
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        let LocalState {
            subscriptions,
            connections,
            push_queue,
        } = &mut *state;

        let mut dead = Vec::new();
        let mut delivered = 0usize;
        for (id, conn) in connections.iter() {
            let rooms = match conn.user_id.and_then(|user_id| subscriptions.get(&user_id)) {
                Some(rooms) => rooms,
                None => &conn.rooms,
            };
            if !rooms.within(&delivery.target, conn.user_id) || rooms.within(&delivery.exclude, conn.user_id) {
                continue;
            }
            if conn.sender.send(delivery.envelope.clone()).is_err() {
                dead.push(*id);
            } else {
                delivered += 1;
            }
        }
        for id in dead {
            connections.remove(&id);
        }

        if !delivery.push_fallback.is_empty() {
            // Only connections that survived the send count as online
            let online: BTreeSet<UserId> = connections.values().filter_map(|c| c.user_id).collect();
            for (user_id, rooms) in subscriptions.iter() {
                if online.contains(user_id)
                    || !rooms.within(&delivery.push_fallback, Some(*user_id))
                    || rooms.within(&delivery.exclude, Some(*user_id))
                {
                    continue;
                }
                push_queue.push(PushNotice {
                    user_id: *user_id,
                    envelope: delivery.envelope.clone(),
                });
            }
        }

        tracing::debug!(
            resource = %delivery.envelope.resource_id,
            action = %delivery.envelope.action,
            delivered,
            "Local delivery"
        );
        Ok(())
    }

    async fn join_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        state.subscriptions.entry(user_id).or_default().join(rooms);
        Ok(())
    }

    async fn leave_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        if let Some(subscribed) = state.subscriptions.get_mut(&user_id) {
            subscribed.leave(rooms);
        }
        Ok(())
    }
}
