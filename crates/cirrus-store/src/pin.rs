//! Pin registry - files open for read or mid-write
//!
//! Eviction must never delete an in-flight file, so every open handle
//! and every staging write holds a pin for its lifetime.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Refcounted set of paths excluded from eviction candidacy
#[derive(Debug, Default)]
pub struct PinSet {
    inner: DashMap<PathBuf, u32>,
}

impl PinSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a path until the returned guard is dropped
    #[must_use]
    pub fn pin(self: &Arc<Self>, path: PathBuf) -> PinGuard {
        *self.inner.entry(path.clone()).or_insert(0) += 1;
        PinGuard {
            set: Arc::clone(self),
            path,
        }
    }

    #[must_use]
    pub fn is_pinned(&self, path: &Path) -> bool {
        self.inner.contains_key(path)
    }
}

/// Releases one pin on drop
#[derive(Debug)]
pub struct PinGuard {
    set: Arc<PinSet>,
    path: PathBuf,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.set.inner.remove_if_mut(&self.path, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}
