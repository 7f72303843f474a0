//! Commons Core Library
//!
//! Role-gated visibility for community resources. Communities own channels,
//! articles, scheduled events and calls whose visibility is granted per role.
//! Whenever a resource's grants change, this library computes which roles
//! gain, keep or lose sight of it and routes appear, update and disappear
//! notifications to live connections through a pluggable broadcaster.

pub mod broadcast;
pub mod config;
pub mod grants;
pub mod mutation;
pub mod permissions;
pub mod roles;
pub mod routing;
pub mod types;
pub mod visibility;

#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use broadcast::{Audience, BroadcastError, Broadcaster, Delivery, DeliveryAction, Envelope};
pub use config::CoreConfig;
pub use grants::{GrantChange, GrantMap, GrantSnapshot};
pub use mutation::MutationCoordinator;
pub use permissions::{CommunityPermission, Permission, PermissionSet, ResourceKind};
pub use routing::{DeliveryOutcome, DeliveryReceipt, TargetingRouter};
pub use types::*;
pub use visibility::VisibilityDiff;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict on {resource}: expected revision {expected}, got {actual}")]
    Conflict { resource: String, expected: u64, actual: u64 },

    #[error("Delivery unavailable: {0}")]
    DeliveryUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the caller may retry the operation with fresh state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::DeliveryUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
