//! Per-mountpath capacity watchdog
//!
//! When a mountpath's used capacity crosses the high watermark, a pass
//! deletes least-recently-used objects until usage drops to the low
//! watermark or candidates run out. Pinned files (open for read or
//! mid-write) and dot-prefixed staging files are never candidates.

use crate::pin::PinSet;
use crate::stats::CacheStats;
use cirrus_common::{Error, Result, Watermarks};
use cirrus_placement::{Mountpath, MountpathSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Filesystem capacity as seen by one mountpath
#[derive(Clone, Copy, Debug)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub avail_bytes: u64,
}

impl DiskUsage {
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.avail_bytes)
    }

    #[must_use]
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Utilization source, swappable so tests can report synthetic usage
pub trait CapacityProbe: Send + Sync {
    fn usage(&self, path: &Path) -> Result<DiskUsage>;
}

/// Production probe backed by statvfs(3)
#[derive(Debug, Default)]
pub struct StatvfsProbe;

impl CapacityProbe for StatvfsProbe {
    fn usage(&self, path: &Path) -> Result<DiskUsage> {
        let vfs = nix::sys::statvfs::statvfs(path)
            .map_err(|e| Error::storage(path.display().to_string(), format!("statvfs: {e}")))?;
        let frsize = vfs.fragment_size() as u64;
        Ok(DiskUsage {
            total_bytes: vfs.blocks() as u64 * frsize,
            avail_bytes: vfs.blocks_available() as u64 * frsize,
        })
    }
}

struct Candidate {
    path: PathBuf,
    accessed: SystemTime,
    size: u64,
}

/// Evicts cold objects to keep each mountpath inside its watermarks
pub struct EvictionManager {
    mounts: Arc<MountpathSet>,
    watermarks: Watermarks,
    pins: Arc<PinSet>,
    probe: Box<dyn CapacityProbe>,
    stats: Arc<CacheStats>,
}

impl EvictionManager {
    #[must_use]
    pub fn new(
        mounts: Arc<MountpathSet>,
        watermarks: Watermarks,
        pins: Arc<PinSet>,
        probe: Box<dyn CapacityProbe>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            mounts,
            watermarks,
            pins,
            probe,
            stats,
        }
    }

    /// One watchdog cycle over every enabled mountpath.
    ///
    /// A failed utilization check is logged and skipped for the cycle,
    /// never fatal.
    pub fn run_pass(&self) {
        for mp in self.mounts.enabled() {
            match self.probe.usage(mp.path()) {
                Ok(usage) => {
                    if usage.used_percent() >= f64::from(self.watermarks.high_percent) {
                        self.evict_mountpath(mp, usage);
                    }
                }
                Err(e) => {
                    warn!(path = %mp.path().display(), error = %e, "capacity check failed, skipping");
                }
            }
        }
    }

    /// Evict LRU-first until usage reaches the low watermark or the
    /// candidate list is exhausted. Overshoot is bounded by one object:
    /// the pass stops at the first deletion that satisfies the target.
    fn evict_mountpath(&self, mp: &Arc<Mountpath>, usage: DiskUsage) {
        let target_used = usage.total_bytes * u64::from(self.watermarks.low_percent) / 100;
        let need = usage.used_bytes().saturating_sub(target_used);
        if need == 0 {
            return;
        }
        info!(
            path = %mp.path().display(),
            used_percent = usage.used_percent(),
            need_bytes = need,
            "high watermark crossed, evicting"
        );

        let mut candidates = Vec::new();
        collect_candidates(mp.path(), &mut candidates);
        candidates.sort_by_key(|c| c.accessed);

        let mut freed: u64 = 0;
        let mut evicted: u64 = 0;
        for c in candidates {
            if freed >= need {
                break;
            }
            if self.pins.is_pinned(&c.path) {
                debug!(path = %c.path.display(), "in flight, not evictable");
                continue;
            }
            match std::fs::remove_file(&c.path) {
                Ok(()) => {
                    freed += c.size;
                    evicted += 1;
                }
                Err(e) => {
                    warn!(path = %c.path.display(), error = %e, "eviction delete failed");
                }
            }
        }

        self.stats.evicted_objects.fetch_add(evicted, Ordering::Relaxed);
        self.stats.bytes_evicted.fetch_add(freed, Ordering::Relaxed);
        info!(
            path = %mp.path().display(),
            evicted,
            freed_bytes = freed,
            reached_target = freed >= need,
            "eviction pass done"
        );
    }
}

/// Collect evictable files under `root`, oldest access first once
/// sorted. Dot-prefixed names (staging files) are skipped.
fn collect_candidates(root: &Path, out: &mut Vec<Candidate>) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "cannot enumerate");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            collect_candidates(&path, out);
        } else if meta.is_file() {
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(Candidate {
                path,
                accessed,
                size: meta.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::FileTimes;
    use std::time::Duration;

    /// Reports a fixed total with usage derived from the bytes actually
    /// present under the path plus a synthetic base, so deletions move
    /// the needle
    struct FakeProbe {
        total: u64,
        base_used: u64,
    }

    impl CapacityProbe for FakeProbe {
        fn usage(&self, path: &Path) -> Result<DiskUsage> {
            let used = self.base_used + dir_size(path);
            Ok(DiskUsage {
                total_bytes: self.total,
                avail_bytes: self.total.saturating_sub(used),
            })
        }
    }

    fn dir_size(root: &Path) -> u64 {
        let mut total = 0;
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    total += dir_size(&path);
                } else if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        total
    }

    fn write_aged_file(dir: &Path, name: &str, size: usize, age_index: u64) {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        // older index = older access time
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + age_index * 60);
        let f = std::fs::File::options().write(true).open(&path).unwrap();
        f.set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
    }

    fn manager(
        mounts: &Arc<MountpathSet>,
        pins: &Arc<PinSet>,
        low: u8,
        high: u8,
        probe: FakeProbe,
    ) -> EvictionManager {
        EvictionManager::new(
            Arc::clone(mounts),
            Watermarks {
                low_percent: low,
                high_percent: high,
            },
            Arc::clone(pins),
            Box::new(probe),
            Arc::new(CacheStats::default()),
        )
    }

    #[test]
    fn test_evicts_lru_down_to_low_watermark() {
        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 1).unwrap());
        let mp_dir = mounts.all()[0].path().to_path_buf();
        let bucket = mp_dir.join("b1");
        std::fs::create_dir_all(&bucket).unwrap();

        // 92 files of 1000 bytes: 92% of a 100k filesystem
        for i in 0..92 {
            write_aged_file(&bucket, &format!("o{i:02}"), 1000, i);
        }

        let pins = Arc::new(PinSet::new());
        let probe = FakeProbe {
            total: 100_000,
            base_used: 0,
        };
        let mgr = manager(&mounts, &pins, 85, 90, probe);
        mgr.run_pass();

        let used = dir_size(&mp_dir);
        // landed in (low - one object, low]
        assert!(used <= 85_000, "used {used} above low watermark");
        assert!(used > 84_000, "over-evicted to {used}");

        // the oldest files went first
        assert!(!bucket.join("o00").exists());
        assert!(!bucket.join("o06").exists());
        assert!(bucket.join("o07").exists());
        assert!(bucket.join("o91").exists());
    }

    #[test]
    fn test_pinned_files_survive() {
        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 1).unwrap());
        let bucket = mounts.all()[0].path().join("b1");
        std::fs::create_dir_all(&bucket).unwrap();

        for i in 0..92 {
            write_aged_file(&bucket, &format!("o{i:02}"), 1000, i);
        }

        let pins = Arc::new(PinSet::new());
        // oldest file is open for read
        let _guard = pins.pin(bucket.join("o00"));

        let probe = FakeProbe {
            total: 100_000,
            base_used: 0,
        };
        let mgr = manager(&mounts, &pins, 85, 90, probe);
        mgr.run_pass();

        assert!(bucket.join("o00").exists(), "pinned file was evicted");
        // the pass skipped it and took the next-oldest instead
        assert!(!bucket.join("o01").exists());
        assert!(!bucket.join("o07").exists());
        assert_eq!(dir_size(mounts.all()[0].path()), 85_000);
    }

    #[test]
    fn test_below_high_watermark_is_untouched() {
        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 1).unwrap());
        let bucket = mounts.all()[0].path().join("b1");
        std::fs::create_dir_all(&bucket).unwrap();
        for i in 0..10 {
            write_aged_file(&bucket, &format!("o{i}"), 1000, i);
        }

        let pins = Arc::new(PinSet::new());
        let probe = FakeProbe {
            total: 100_000,
            base_used: 0,
        };
        let mgr = manager(&mounts, &pins, 85, 90, probe);
        mgr.run_pass();

        assert_eq!(dir_size(mounts.all()[0].path()), 10_000);
    }

    #[test]
    fn test_staging_files_are_not_candidates() {
        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 1).unwrap());
        let bucket = mounts.all()[0].path().join("b1");
        std::fs::create_dir_all(&bucket).unwrap();

        write_aged_file(&bucket, ".o0.partial", 50_000, 0);
        write_aged_file(&bucket, "o1", 45_000, 1);

        let pins = Arc::new(PinSet::new());
        let probe = FakeProbe {
            total: 100_000,
            base_used: 0,
        };
        let mgr = manager(&mounts, &pins, 50, 90, probe);
        mgr.run_pass();

        // only the real object was evictable
        assert!(bucket.join(".o0.partial").exists());
        assert!(!bucket.join("o1").exists());
    }

    #[test]
    fn test_probe_failure_is_skipped() {
        struct FailingProbe;
        impl CapacityProbe for FailingProbe {
            fn usage(&self, path: &Path) -> Result<DiskUsage> {
                Err(Error::storage(path.display().to_string(), "unmounted"))
            }
        }

        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 1).unwrap());
        let bucket = mounts.all()[0].path().join("b1");
        std::fs::create_dir_all(&bucket).unwrap();
        write_aged_file(&bucket, "o1", 1000, 0);

        let pins = Arc::new(PinSet::new());
        let mgr = EvictionManager::new(
            Arc::clone(&mounts),
            Watermarks::default(),
            pins,
            Box::new(FailingProbe),
            Arc::new(CacheStats::default()),
        );
        // must not panic, must not delete
        mgr.run_pass();
        assert!(bucket.join("o1").exists());
    }

    #[test]
    fn test_statvfs_probe_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        let usage = StatvfsProbe.usage(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.used_percent() >= 0.0);
        assert!(usage.used_percent() <= 100.0);
    }
}
