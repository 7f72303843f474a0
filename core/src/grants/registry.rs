//! Resource permission registry
//!
//! Stores grants per resource. Every write validates caller grants against
//! the community roster, injects the Admin preset and captures the previous
//! snapshot in the same critical section as the write, so two concurrent
//! mutations can never diff against the same stale state.

use super::{prepare, GrantMap, GrantSnapshot};
use crate::permissions::ResourceKind;
use crate::roles::RoleDirectory;
use crate::types::*;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Committed snapshots before and after a write
#[derive(Clone, Debug)]
pub struct GrantTransition {
    pub before: GrantSnapshot,
    pub after: GrantSnapshot,
}

/// Read side of grant storage
#[async_trait]
pub trait PermissionReader: Send + Sync {
    /// Committed grants of a resource
    async fn current_grants(&self, resource_id: ResourceId) -> Result<GrantSnapshot>;
}

/// Write side of grant storage. Every method is atomic per resource.
#[async_trait]
pub trait PermissionWriter: PermissionReader {
    /// Store the first snapshot of a resource (`Conflict` if it exists)
    async fn insert_grants(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        grants: GrantMap,
    ) -> Result<GrantSnapshot>;

    /// Replace grants, returning the previous and new snapshot.
    ///
    /// With `expected_revision`, the write fails with `Conflict` unless the
    /// stored revision matches.
    async fn replace_grants(
        &self,
        resource_id: ResourceId,
        grants: GrantMap,
        expected_revision: Option<u64>,
    ) -> Result<GrantTransition>;

    /// Remove every grant of a resource, returning the last snapshot
    async fn remove_grants(&self, resource_id: ResourceId) -> Result<GrantSnapshot>;

    /// Drop a role from every resource it is granted on
    async fn purge_role(&self, role_id: RoleId) -> Result<usize>;
}

/// In-process grant storage
#[derive(Default)]
pub struct MemoryGrantStore {
    snapshots: Mutex<HashMap<ResourceId, GrantSnapshot>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(resource_id: ResourceId) -> Error {
    Error::NotFound(format!("Grants of resource {} not found", resource_id))
}

#[async_trait]
impl PermissionReader for MemoryGrantStore {
    async fn current_grants(&self, resource_id: ResourceId) -> Result<GrantSnapshot> {
        let snapshots = self.snapshots.lock().await;
        snapshots.get(&resource_id).cloned().ok_or_else(|| missing(resource_id))
    }
}

#[async_trait]
impl PermissionWriter for MemoryGrantStore {
    async fn insert_grants(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        grants: GrantMap,
    ) -> Result<GrantSnapshot> {
        let mut snapshots = self.snapshots.lock().await;
        if let Some(existing) = snapshots.get(&resource_id) {
            return Err(Error::Conflict {
                resource: resource_id.to_string(),
                expected: 0,
                actual: existing.revision,
            });
        }

        let snapshot = GrantSnapshot {
            resource_id,
            kind,
            community_id,
            revision: 1,
            grants,
        };
        snapshots.insert(resource_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn replace_grants(
        &self,
        resource_id: ResourceId,
        grants: GrantMap,
        expected_revision: Option<u64>,
    ) -> Result<GrantTransition> {
        let mut snapshots = self.snapshots.lock().await;
        let current = snapshots.get_mut(&resource_id).ok_or_else(|| missing(resource_id))?;

        if let Some(expected) = expected_revision {
            if expected != current.revision {
                return Err(Error::Conflict {
                    resource: resource_id.to_string(),
                    expected,
                    actual: current.revision,
                });
            }
        }

        let before = current.clone();
        current.grants = grants;
        current.revision += 1;
        Ok(GrantTransition {
            before,
            after: current.clone(),
        })
    }

    async fn remove_grants(&self, resource_id: ResourceId) -> Result<GrantSnapshot> {
        let mut snapshots = self.snapshots.lock().await;
        snapshots.remove(&resource_id).ok_or_else(|| missing(resource_id))
    }

    async fn purge_role(&self, role_id: RoleId) -> Result<usize> {
        let mut snapshots = self.snapshots.lock().await;
        let mut touched = 0;
        for snapshot in snapshots.values_mut() {
            if snapshot.grants.remove(&role_id).is_some() {
                snapshot.revision += 1;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

/// Validating front of grant storage used by the mutation pipeline
#[derive(Clone)]
pub struct GrantRegistry {
    storage: Arc<dyn PermissionWriter>,
    directory: Arc<dyn RoleDirectory>,
}

impl GrantRegistry {
    pub fn new(storage: Arc<dyn PermissionWriter>, directory: Arc<dyn RoleDirectory>) -> Self {
        Self { storage, directory }
    }

    pub fn directory(&self) -> &Arc<dyn RoleDirectory> {
        &self.directory
    }

    pub async fn current(&self, resource_id: ResourceId) -> Result<GrantSnapshot> {
        self.storage.current_grants(resource_id).await
    }

    /// Committed grants, checked against the caller's view of the resource
    pub async fn snapshot(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
    ) -> Result<GrantSnapshot> {
        let current = self.storage.current_grants(resource_id).await?;
        check_owner(&current, kind, community_id)?;
        Ok(current)
    }

    /// Validate and store the initial grants of a new resource
    pub async fn create(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        grants: GrantMap,
    ) -> Result<GrantSnapshot> {
        let roster = self.directory.roster(community_id).await?;
        let grants = prepare(kind, &roster, grants)?;
        self.storage.insert_grants(kind, resource_id, community_id, grants).await
    }

    /// Validate and atomically replace the grants of an existing resource
    pub async fn replace(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
        grants: GrantMap,
        expected_revision: Option<u64>,
    ) -> Result<GrantTransition> {
        let roster = self.directory.roster(community_id).await?;
        let grants = prepare(kind, &roster, grants)?;
        self.snapshot(kind, resource_id, community_id).await?;

        let transition = self.storage.replace_grants(resource_id, grants, expected_revision).await?;
        tracing::info!(
            resource = %resource_id,
            kind = %kind,
            revision = transition.after.revision,
            "Replaced resource grants"
        );
        Ok(transition)
    }

    /// Remove the grants of a deleted resource
    pub async fn remove(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        community_id: CommunityId,
    ) -> Result<GrantSnapshot> {
        self.snapshot(kind, resource_id, community_id).await?;
        self.storage.remove_grants(resource_id).await
    }

    /// Drop a deleted role from every resource
    pub async fn purge_role(&self, role_id: RoleId) -> Result<usize> {
        let touched = self.storage.purge_role(role_id).await?;
        if touched > 0 {
            tracing::info!(role = %role_id, resources = touched, "Purged grants of deleted role");
        }
        Ok(touched)
    }
}

fn check_owner(snapshot: &GrantSnapshot, kind: ResourceKind, community_id: CommunityId) -> Result<()> {
    if snapshot.community_id != community_id {
        return Err(Error::NotFound(format!(
            "Resource {} not found in community {}",
            snapshot.resource_id, community_id
        )));
    }
    if snapshot.kind != kind {
        return Err(Error::InvalidRequest(format!(
            "Resource {} is a {}, not a {}",
            snapshot.resource_id, snapshot.kind, kind
        )));
    }
    Ok(())
}
