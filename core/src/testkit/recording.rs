use crate::broadcast::{Audience, BroadcastError, Broadcaster, Delivery};
use crate::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Room subscription change seen by the recorder
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RoomChange {
    Join(UserId, Audience),
    Leave(UserId, Audience),
}

/// Broadcaster that records every call instead of delivering
#[derive(Default)]
pub struct RecordingBroadcaster {
    deliveries: Mutex<Vec<Delivery>>,
    rooms: Mutex<Vec<RoomChange>>,
    unavailable: AtomicBool,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail as if the transport were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn room_changes(&self) -> Vec<RoomChange> {
        self.rooms.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.deliveries.lock().await.clear();
        self.rooms.lock().await.clear();
    }

    fn check(&self) -> Result<(), BroadcastError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BroadcastError::Transport("recorder offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn deliver(&self, delivery: Delivery) -> Result<(), BroadcastError> {
        self.check()?;
        self.deliveries.lock().await.push(delivery);
        Ok(())
    }

    async fn join_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError> {
        self.check()?;
        self.rooms.lock().await.push(RoomChange::Join(user_id, rooms.clone()));
        Ok(())
    }

    async fn leave_rooms(&self, user_id: UserId, rooms: &Audience) -> Result<(), BroadcastError> {
        self.check()?;
        self.rooms.lock().await.push(RoomChange::Leave(user_id, rooms.clone()));
        Ok(())
    }
}
