//! The cluster map and its sync protocol

use cirrus_common::{Member, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Serialized form of the map, pushed between nodes by the control plane
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub members: HashMap<NodeId, Member>,
}

/// Result of applying a pushed snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Snapshot was strictly newer and replaced the local map wholesale.
    /// A version change implies objects may need to move; the rebalance
    /// itself runs elsewhere.
    Applied { old_version: u64, new_version: u64 },
    /// Snapshot version was <= the local version; silently discarded.
    Ignored { local_version: u64 },
}

/// Versioned registry of cluster members.
///
/// All map-shape mutations take the exclusive lock. The version counter
/// is written only while the lock is held but may be read without it;
/// readers that intend to mutate must re-validate under the lock.
#[derive(Debug, Default)]
pub struct ClusterMap {
    members: Mutex<HashMap<NodeId, Member>>,
    version: AtomicU64,
}

impl ClusterMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a member; increments the version
    pub fn add(&self, member: Member) {
        let mut members = self.members.lock();
        members.insert(member.id.clone(), member);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove a member; increments the version even when the ID was absent
    pub fn remove(&self, id: &NodeId) -> Option<Member> {
        let mut members = self.members.lock();
        let removed = members.remove(id);
        self.version.fetch_add(1, Ordering::SeqCst);
        removed
    }

    /// Look up a member by ID
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<Member> {
        self.members.lock().get(id).cloned()
    }

    /// Number of members
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.lock().len()
    }

    /// Lock-free read of the version counter
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Copy the current map for serialization or iteration
    #[must_use]
    pub fn snapshot(&self) -> ClusterSnapshot {
        let members = self.members.lock();
        ClusterSnapshot {
            version: self.version.load(Ordering::SeqCst),
            members: members.clone(),
        }
    }

    /// Apply a pushed snapshot if and only if it is strictly newer.
    ///
    /// The comparison happens under the lock so a concurrent local
    /// mutation cannot slip between the check and the swap.
    pub fn try_sync(&self, snapshot: ClusterSnapshot) -> SyncOutcome {
        let mut members = self.members.lock();
        let local = self.version.load(Ordering::SeqCst);
        if snapshot.version <= local {
            return SyncOutcome::Ignored {
                local_version: local,
            };
        }
        info!(
            old_version = local,
            new_version = snapshot.version,
            members = snapshot.members.len(),
            "applying cluster map, rebalance implied"
        );
        *members = snapshot.members;
        self.version.store(snapshot.version, Ordering::SeqCst);
        SyncOutcome::Applied {
            old_version: local,
            new_version: snapshot.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> Member {
        Member::new(NodeId::new(id), "127.0.0.1", 8081)
    }

    #[test]
    fn test_add_remove_bump_version() {
        let map = ClusterMap::new();
        assert_eq!(map.version(), 0);
        assert_eq!(map.count(), 0);

        map.add(member("t1"));
        assert_eq!(map.version(), 1);
        assert_eq!(map.count(), 1);
        assert!(map.get(&NodeId::new("t1")).is_some());

        map.add(member("t2"));
        map.remove(&NodeId::new("t1"));
        assert_eq!(map.version(), 3);
        assert_eq!(map.count(), 1);
        assert!(map.get(&NodeId::new("t1")).is_none());
    }

    #[test]
    fn test_overwrite_still_bumps_version() {
        let map = ClusterMap::new();
        map.add(member("t1"));
        map.add(member("t1"));
        assert_eq!(map.version(), 2);
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn test_sync_rejects_stale_and_equal() {
        let map = ClusterMap::new();
        map.add(member("t1"));
        map.add(member("t2"));
        let local = map.version();

        let mut stale = map.snapshot();
        stale.version = local - 1;
        stale.members.clear();
        assert_eq!(
            map.try_sync(stale),
            SyncOutcome::Ignored {
                local_version: local
            }
        );

        let mut equal = map.snapshot();
        equal.members.clear();
        assert_eq!(
            map.try_sync(equal),
            SyncOutcome::Ignored {
                local_version: local
            }
        );

        // map and version unchanged
        assert_eq!(map.version(), local);
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn test_sync_applies_newer_wholesale() {
        let map = ClusterMap::new();
        map.add(member("t1"));

        let mut incoming = ClusterSnapshot::default();
        incoming.version = 10;
        incoming
            .members
            .insert(NodeId::new("t9"), member("t9"));

        let outcome = map.try_sync(incoming);
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                old_version: 1,
                new_version: 10
            }
        );
        assert_eq!(map.version(), 10);
        assert_eq!(map.count(), 1);
        assert!(map.get(&NodeId::new("t9")).is_some());
        assert!(map.get(&NodeId::new("t1")).is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let map = ClusterMap::new();
        map.add(member("t1"));

        let json = serde_json::to_string(&map.snapshot()).unwrap();
        let parsed: ClusterSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.members.len(), 1);
    }
}
