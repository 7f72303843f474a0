//! CBOR frame transport
//!
//! Encodes broadcaster calls as CBOR frames and pushes them onto a bounded
//! queue drained by an external real-time transport. The queue is never
//! awaited: a full or closed queue fails the call immediately.

use super::{Audience, BroadcastError, Broadcaster, Delivery, DeliveryAction, Envelope};
use crate::config::DeliveryConfig;
use crate::permissions::ResourceKind;
use crate::types::*;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use minicbor::{Decode, Encode};
use tokio::sync::mpsc;

/// Wire form of one broadcaster call
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum Frame {
    #[n(0)]
    Deliver {
        #[n(0)]
        kind: ResourceKind,
        #[n(1)]
        action: DeliveryAction,
        #[n(2)]
        resource_id: ResourceId,
        #[n(3)]
        community_id: CommunityId,
        /// JSON text of the envelope body
        #[n(4)]
        body: String,
        #[n(5)]
        target: Audience,
        #[n(6)]
        exclude: Audience,
        #[n(7)]
        push_fallback: Audience,
    },
    #[n(1)]
    JoinRooms {
        #[n(0)]
        user_id: UserId,
        #[n(1)]
        rooms: Audience,
    },
    #[n(2)]
    LeaveRooms {
        #[n(0)]
        user_id: UserId,
        #[n(1)]
        rooms: Audience,
    },
}

impl Frame {
    pub fn from_delivery(delivery: Delivery) -> Result<Self> {
        let Delivery {
            envelope,
            target,
            exclude,
            push_fallback,
        } = delivery;
        Ok(Frame::Deliver {
            kind: envelope.kind,
            action: envelope.action,
            resource_id: envelope.resource_id,
            community_id: envelope.community_id,
            body: serde_json::to_string(&envelope.body)?,
            target,
            exclude,
            push_fallback,
        })
    }

    /// Rebuild the delivery carried by a `Deliver` frame
    pub fn into_delivery(self) -> Result<Option<Delivery>> {
        match self {
            Frame::Deliver {
                kind,
                action,
                resource_id,
                community_id,
                body,
                target,
                exclude,
                push_fallback,
            } => Ok(Some(Delivery {
                envelope: Envelope {
                    kind,
                    action,
                    resource_id,
                    community_id,
                    body: serde_json::from_str(&body)?,
                },
                target,
                exclude,
                push_fallback,
            })),
            _ => Ok(None),
        }
    }

    /// Serialize to CBOR bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        minicbor::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(format!("Failed to encode frame: {}", e)))
    }

    /// Deserialize from CBOR bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        minicbor::decode(bytes).map_err(|e| Error::Serialization(format!("Failed to decode frame: {}", e)))
    }
}

/// Broadcaster writing CBOR frames to a bounded queue
#[derive(Clone)]
pub struct FrameBroadcaster {
    tx: mpsc::Sender<Bytes>,
}

impl FrameBroadcaster {
    /// Create the broadcaster and the queue the external transport drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn from_config(config: &DeliveryConfig) -> (Self, mpsc::Receiver<Bytes>) {
        Self::new(config.frame_capacity)
    }

    fn push(&self, frame: &Frame) -> std::result::Result<(), BroadcastError> {
        let bytes = frame.to_bytes().map_err(|e| BroadcastError::Encode(e.to_string()))?;
        self.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BroadcastError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => BroadcastError::Closed,
        })
    }
}

#[async_trait]
impl Broadcaster for FrameBroadcaster {
    async fn deliver(&self, delivery: Delivery) -> std::result::Result<(), BroadcastError> {
        let frame = Frame::from_delivery(delivery).map_err(|e| BroadcastError::Encode(e.to_string()))?;
        self.push(&frame)
    }

    async fn join_rooms(&self, user_id: UserId, rooms: &Audience) -> std::result::Result<(), BroadcastError> {
        self.push(&Frame::JoinRooms {
            user_id,
            rooms: rooms.clone(),
        })
    }

    async fn leave_rooms(&self, user_id: UserId, rooms: &Audience) -> std::result::Result<(), BroadcastError> {
        self.push(&Frame::LeaveRooms {
            user_id,
            rooms: rooms.clone(),
        })
    }
}
