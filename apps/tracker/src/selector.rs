//! Pure replica-selection algorithms: pick a group for a new upload, pick a
//! storage replica within a group for a given client.

use std::sync::Arc;

use common::IpHash;

use crate::cluster::{ClusterState, GroupRegistry, GroupStatus, ReplicaStatus, StorageReplica};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    NoAvailableGroup,
    NoAvailableStorage,
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAvailableGroup => write!(f, "no available group"),
            Self::NoAvailableStorage => write!(f, "no available storage for group"),
        }
    }
}

impl std::error::Error for SelectError {}

/// Picks the active group with the most advertised capacity. Ties break by
/// group name ascending, so a fixed input set always yields the same pick.
pub fn select_group_for_upload(
    cluster: &ClusterState,
) -> Result<Arc<GroupRegistry>, SelectError> {
    let mut candidates: Vec<(u64, String, Arc<GroupRegistry>)> = cluster
        .list_groups()
        .into_iter()
        .filter(|group| group.status() == GroupStatus::Active)
        .map(|group| (group.capacity(), group.name().to_string(), group))
        .collect();

    if candidates.is_empty() {
        return Err(SelectError::NoAvailableGroup);
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let (_, _, group) = candidates.remove(0);
    Ok(group)
}

/// Deterministic client-affinity pick: `hash(ip) mod active_count` over the
/// group's active replicas. The candidate list comes address-sorted from the
/// registry, so the same ip maps to the same replica on every call.
pub fn select_replica(
    ip: &str,
    group: &GroupRegistry,
    hash: IpHash,
) -> Result<StorageReplica, SelectError> {
    let active: Vec<StorageReplica> = group
        .list_replicas()
        .into_iter()
        .filter(|replica| replica.status == ReplicaStatus::Active)
        .collect();

    if active.is_empty() {
        return Err(SelectError::NoAvailableStorage);
    }

    let index = hash(ip.as_bytes()) as usize % active.len();
    Ok(active[index].clone())
}
