//! Cirrus Cluster - versioned membership registry
//!
//! The cluster map is the single source of truth for which proxies and
//! targets exist. Mutations are serialized by an exclusive lock and every
//! accepted change strictly increases the version; the version counter
//! itself is readable without the lock for cheap status checks.

mod map;

pub use map::{ClusterMap, ClusterSnapshot, SyncOutcome};
