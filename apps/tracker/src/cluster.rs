use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use common::StatusReport;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Active,
    NotEnoughSpace,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StorageReplica {
    pub group: String,
    pub addr: String,
    pub scheme: String,
    pub status: ReplicaStatus,
    pub free_bytes: u64,
    pub last_report_unix: u64,
}

impl StorageReplica {
    /// Builds the registry entry for one status report. Reports at or below
    /// the free-space floor register the replica as unable to accept data.
    pub fn from_report(report: &StatusReport, min_free_bytes: u64, now_unix: u64) -> Self {
        let status = if report.free <= min_free_bytes {
            ReplicaStatus::NotEnoughSpace
        } else {
            ReplicaStatus::Active
        };

        Self {
            group: report.group.clone(),
            addr: format!("{}:{}", report.host, report.port),
            scheme: report.scheme.clone(),
            status,
            free_bytes: report.free,
            last_report_unix: now_unix,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.addr)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClusterError {
    DuplicateGroup,
    InvalidAddress,
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateGroup => write!(f, "group is already registered"),
            Self::InvalidAddress => write!(f, "storage addr can not be empty"),
        }
    }
}

impl std::error::Error for ClusterError {}

#[derive(Debug)]
struct GroupInner {
    status: GroupStatus,
    capacity: u64,
    replicas: BTreeMap<String, StorageReplica>,
}

/// One named set of storage replicas. The registry is the unit of concurrency
/// isolation: every mutation takes this group's write lock, reads take the
/// shared lock, and the address-keyed BTreeMap keeps `list_replicas` in the
/// stable order hash-based selection depends on.
#[derive(Debug)]
pub struct GroupRegistry {
    name: String,
    inner: RwLock<GroupInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub status: GroupStatus,
    pub capacity: u64,
    pub replicas: Vec<StorageReplica>,
}

impl GroupRegistry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(GroupInner {
                status: GroupStatus::Unavailable,
                capacity: 0,
                replicas: BTreeMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> GroupStatus {
        self.inner.read().status
    }

    pub fn capacity(&self) -> u64 {
        self.inner.read().capacity
    }

    /// Replicas sorted by address.
    pub fn list_replicas(&self) -> Vec<StorageReplica> {
        self.inner.read().replicas.values().cloned().collect()
    }

    pub fn get_replica(&self, addr: &str) -> Option<StorageReplica> {
        self.inner.read().replicas.get(addr).cloned()
    }

    pub fn upsert_replica(&self, replica: StorageReplica) -> Result<(), ClusterError> {
        if replica.addr.is_empty() {
            return Err(ClusterError::InvalidAddress);
        }
        let mut inner = self.inner.write();
        inner.replicas.insert(replica.addr.clone(), replica);
        Ok(())
    }

    pub fn remove_replica(&self, addr: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.replicas.remove(addr).is_some();
        if removed {
            recompute_locked(&mut inner);
        }
        removed
    }

    /// Error hook for the upload proxy: a replica that failed a forwarded
    /// request is taken out of rotation immediately.
    pub fn mark_offline(&self, addr: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(replica) = inner.replicas.get_mut(addr) else {
            return false;
        };
        replica.status = ReplicaStatus::Offline;
        recompute_locked(&mut inner);
        true
    }

    /// Recomputes capacity and group status. Capacity is the minimum free
    /// space among active replicas (inactive replicas are filtered here);
    /// 0 with no active replica, in which case the group is unavailable.
    pub fn recompute_capacity(&self) -> u64 {
        let mut inner = self.inner.write();
        recompute_locked(&mut inner);
        inner.capacity
    }

    /// Demotes replicas that have been silent past the threshold, then
    /// recomputes capacity and group status. Returns the demotion count.
    pub fn sweep(&self, now_unix: u64, offline_after_secs: u64) -> usize {
        let mut inner = self.inner.write();
        let mut demoted = 0;

        for replica in inner.replicas.values_mut() {
            let silent_for = now_unix.saturating_sub(replica.last_report_unix);
            if replica.status == ReplicaStatus::Active && silent_for > offline_after_secs {
                replica.status = ReplicaStatus::Offline;
                demoted += 1;
            }
        }

        recompute_locked(&mut inner);
        demoted
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let inner = self.inner.read();
        GroupSnapshot {
            name: self.name.clone(),
            status: inner.status,
            capacity: inner.capacity,
            replicas: inner.replicas.values().cloned().collect(),
        }
    }
}

fn recompute_locked(inner: &mut GroupInner) {
    let active_min = inner
        .replicas
        .values()
        .filter(|replica| replica.status == ReplicaStatus::Active)
        .map(|replica| replica.free_bytes)
        .min();

    match active_min {
        Some(capacity) => {
            inner.capacity = capacity;
            inner.status = GroupStatus::Active;
        }
        None => {
            inner.capacity = 0;
            inner.status = GroupStatus::Unavailable;
        }
    }
}

/// Tracker-side registry of every known group. Groups are created on first
/// status report and never removed, only deactivated. `register_lock`
/// serializes the register-or-update-then-recompute sequence, which is not
/// atomic under the map lock alone.
#[derive(Debug, Default)]
pub struct ClusterState {
    groups: RwLock<HashMap<String, Arc<GroupRegistry>>>,
    register_lock: Mutex<()>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.groups.read().contains_key(name)
    }

    pub fn get_group(&self, name: &str) -> Option<Arc<GroupRegistry>> {
        self.groups.read().get(name).cloned()
    }

    pub fn list_groups(&self) -> Vec<Arc<GroupRegistry>> {
        self.groups.read().values().cloned().collect()
    }

    pub fn register_group(&self, name: &str) -> Result<Arc<GroupRegistry>, ClusterError> {
        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(ClusterError::DuplicateGroup);
        }
        let group = Arc::new(GroupRegistry::new(name));
        groups.insert(name.to_string(), group.clone());
        Ok(group)
    }

    /// Applies one storage status report: registers the group on first
    /// contact, upserts the replica, recomputes capacity. The whole sequence
    /// runs under the process-level lock so concurrent reports cannot create
    /// duplicate registries or lose updates.
    pub fn apply_report(&self, replica: StorageReplica) -> Result<Arc<GroupRegistry>, ClusterError> {
        let _serial = self.register_lock.lock();

        let group = self.group_entry(&replica.group);
        group.upsert_replica(replica)?;
        group.recompute_capacity();
        Ok(group)
    }

    /// Offline sweep over every group, run on the report cadence. Serialized
    /// against `apply_report` so the sweep and report handlers never
    /// interleave on the same registry.
    pub fn sweep(&self, now_unix: u64, offline_after_secs: u64) {
        let _serial = self.register_lock.lock();
        for group in self.list_groups() {
            group.sweep(now_unix, offline_after_secs);
        }
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut snapshots: Vec<GroupSnapshot> =
            self.list_groups().iter().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn group_entry(&self, name: &str) -> Arc<GroupRegistry> {
        let mut groups = self.groups.write();
        groups
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(GroupRegistry::new(name)))
            .clone()
    }
}

pub fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
