//! Core configuration

use crate::Result;
use serde::{Deserialize, Serialize};

/// Top-level configuration of the visibility core
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub delivery: DeliveryConfig,
    pub roles: RoleConfig,
}

/// Delivery behaviour of the targeting router and frame transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bound of the outbound frame queue
    pub frame_capacity: usize,
    /// Name the `appear` audience as push-notification fallback
    pub push_fallback: bool,
    /// Hand deliveries with an empty target to the broadcaster anyway
    pub deliver_empty: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 1024,
            push_fallback: false,
            deliver_empty: false,
        }
    }
}

/// Limits applied by the membership service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Maximum number of custom roles per community
    pub max_custom_roles: Option<usize>,
}

impl CoreConfig {
    /// Load configuration from a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
