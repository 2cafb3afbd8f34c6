//! Mountpath registry
//!
//! The set is assembled once at target start-up - from explicit
//! configuration, from a /proc/mounts scan, or as emulated directories
//! for testing - and is static afterwards except for health-driven
//! disablement.

use cirrus_common::{BucketName, Error, ObjectKey, Result};
use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// A local filesystem root dedicated to cache storage
pub struct Mountpath {
    path: PathBuf,
    enabled: AtomicBool,
}

impl Mountpath {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            enabled: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Take the mountpath out of rotation after a local I/O failure so
    /// future resolutions route around it
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            warn!(path = %self.path.display(), "mountpath disabled");
        }
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!(path = %self.path.display(), "mountpath re-enabled");
        }
    }

    /// Fully-qualified local path for an object: `{mountpath}/{bucket}/{key}`
    #[must_use]
    pub fn fqn(&self, bucket: &BucketName, key: &ObjectKey) -> PathBuf {
        self.path.join(bucket.as_str()).join(key.as_str())
    }
}

impl fmt::Debug for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mountpath")
            .field("path", &self.path)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The target's set of mountpaths
#[derive(Debug, Clone)]
pub struct MountpathSet {
    paths: Vec<Arc<Mountpath>>,
}

impl MountpathSet {
    /// Build from explicit roots; each must exist and be a directory
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::configuration("no mountpaths configured"));
        }
        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            if !p.is_dir() {
                return Err(Error::configuration(format!(
                    "mountpath {} is not a directory",
                    p.display()
                )));
            }
            out.push(Arc::new(Mountpath::new(p.clone())));
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        info!(count = out.len(), "configured mountpaths");
        Ok(Self { paths: out })
    }

    /// Create `count` numbered directories under `base` and use them as
    /// mountpaths (testing without dedicated filesystems)
    pub fn emulated(base: &Path, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::configuration("emulated mountpath count must be >= 1"));
        }
        info!(base = %base.display(), count, "emulating mountpaths");
        let mut paths = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let p = base.join(i.to_string());
            std::fs::create_dir_all(&p)?;
            paths.push(p);
        }
        Self::from_paths(&paths)
    }

    /// Scan /proc/mounts for mounted filesystems under `prefix`
    pub fn discover(prefix: &Path) -> Result<Self> {
        let file = std::fs::File::open("/proc/mounts")?;
        let paths = parse_proc_mounts(std::io::BufReader::new(file), prefix)?;
        if paths.is_empty() {
            return Err(Error::configuration(format!(
                "no mounts found under {}",
                prefix.display()
            )));
        }
        Self::from_paths(&paths)
    }

    /// All mountpaths, enabled or not
    #[must_use]
    pub fn all(&self) -> &[Arc<Mountpath>] {
        &self.paths
    }

    /// Currently enabled mountpaths
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<Mountpath>> {
        self.paths.iter().filter(|m| m.is_enabled())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Parse a /proc/mounts stream, keeping mountpoints under `prefix`
fn parse_proc_mounts(reader: impl BufRead, prefix: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        // fields: device mountpoint fstype options dump pass
        let Some(mountpoint) = line.split_whitespace().nth(1) else {
            continue;
        };
        // octal escapes (\040 for space) are left as-is; such paths are
        // not usable as cache roots anyway
        let path = PathBuf::from(mountpoint);
        if path.starts_with(prefix) {
            out.push(path);
        }
    }
    Ok(out)
}
