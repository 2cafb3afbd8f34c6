//! The object cache
//!
//! A path under its final name is either absent or a complete,
//! integrity-verified copy: fills stream into a dot-prefixed staging
//! file in the same directory and rename into place only after the
//! checksum reported by the backend matches the digest computed over
//! the transfer. Concurrent fills of the same object are coalesced so
//! one cloud transfer serves every waiter.

use crate::pin::{PinGuard, PinSet};
use crate::stats::CacheStats;
use bytes::Bytes;
use cirrus_cloud::CloudBackend;
use cirrus_cluster::ClusterMap;
use cirrus_common::checksum::DigestBuilder;
use cirrus_common::{BucketName, Checksum, CopyMsg, Error, Member, NodeId, ObjectKey, Result};
use cirrus_placement::{Mountpath, Placement};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An open, pinned cache file positioned at the start.
///
/// Reads delegate to the underlying file; the pin is released when the
/// handle drops, so streaming a `CachedObject` keeps it safe from
/// eviction for the whole transfer.
#[derive(Debug)]
pub struct CachedObject {
    pub file: tokio::fs::File,
    pub size: u64,
    pub path: PathBuf,
    _pin: PinGuard,
}

impl tokio::io::AsyncRead for CachedObject {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// This node's part in an intra-cluster copy
#[derive(Debug)]
pub enum CopyRole {
    /// Stream the local file to this peer
    Source { peer: Member },
    /// Receive the stream into the local cache
    Destination,
}

/// Orchestrates local lookup, cloud miss-fill, verification, atomic
/// install, and intra-cluster copies
pub struct ObjectCache {
    node_id: NodeId,
    placement: Placement,
    cluster: Arc<ClusterMap>,
    backend: Arc<dyn CloudBackend>,
    pins: Arc<PinSet>,
    stats: Arc<CacheStats>,
    inflight: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ObjectCache {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        placement: Placement,
        cluster: Arc<ClusterMap>,
        backend: Arc<dyn CloudBackend>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            node_id,
            placement,
            cluster,
            backend,
            pins: Arc::new(PinSet::new()),
            stats,
            inflight: DashMap::new(),
        }
    }

    #[must_use]
    pub fn pins(&self) -> &Arc<PinSet> {
        &self.pins
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Serve an object from the cache, filling from the cloud on miss
    pub async fn get(&self, bucket: &BucketName, key: &ObjectKey) -> Result<CachedObject> {
        let mp = self.placement.resolve(bucket, key)?;
        let fqn = mp.fqn(bucket, key);
        let pin = self.pins.pin(fqn.clone());

        if !tokio::fs::try_exists(&fqn).await.unwrap_or(false) {
            self.stats.cold_gets.fetch_add(1, Ordering::Relaxed);
            debug!(bucket = %bucket, key = %key, fqn = %fqn.display(), "not cached, filling");
            self.coalesced_fill(&mp, &fqn, bucket, key).await?;
        }

        self.open_pinned(&fqn, bucket, key, pin).await
    }

    /// Serve a local file for the source side of a copy; never fills
    pub async fn open_for_send(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<CachedObject> {
        let mp = self.placement.resolve(bucket, key)?;
        let fqn = mp.fqn(bucket, key);
        let pin = self.pins.pin(fqn.clone());

        if !tokio::fs::try_exists(&fqn).await.unwrap_or(false) {
            return Err(Error::ObjectNotFound {
                bucket: bucket.as_str().to_string(),
                key: key.as_str().to_string(),
            });
        }
        self.open_pinned(&fqn, bucket, key, pin).await
    }

    /// Object names in a bucket; delegates entirely to the backend
    pub async fn list_bucket(&self, bucket: &BucketName) -> Result<Vec<String>> {
        self.stats.lists.fetch_add(1, Ordering::Relaxed);
        self.backend.list_bucket(bucket).await
    }

    /// Decide this node's part in a copy request.
    ///
    /// The node must be the named source or destination; as source, the
    /// destination member must be known to the cluster map.
    pub fn copy_role(&self, msg: &CopyMsg) -> Result<CopyRole> {
        let from = NodeId::new(msg.from_id.clone());
        let to = NodeId::new(msg.to_id.clone());
        if self.node_id != from && self.node_id != to {
            return Err(Error::protocol(format!(
                "copy: {} is neither the source {} nor the destination {}",
                self.node_id, msg.from_id, msg.to_id
            )));
        }
        if self.node_id == from {
            let peer = self.cluster.get(&to).ok_or_else(|| {
                Error::protocol(format!("copy: unknown destination {}", msg.to_id))
            })?;
            Ok(CopyRole::Source { peer })
        } else {
            Ok(CopyRole::Destination)
        }
    }

    /// Receive a peer's stream into the cache (destination side of a
    /// copy). An object already present for the key is a successful
    /// no-op, not an error.
    pub async fn install_from_stream(
        &self,
        bucket: &BucketName,
        key: &ObjectKey,
        stream: BoxStream<'static, std::io::Result<Bytes>>,
    ) -> Result<u64> {
        let mp = self.placement.resolve(bucket, key)?;
        let fqn = mp.fqn(bucket, key);
        if tokio::fs::try_exists(&fqn).await.unwrap_or(false) {
            debug!(fqn = %fqn.display(), "copy destination already cached, nothing to do");
            return Ok(0);
        }
        let _pin = self.pins.pin(fqn.clone());
        let written = self.install(&mp, &fqn, stream, None, bucket, key).await?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }

    async fn open_pinned(
        &self,
        fqn: &Path,
        bucket: &BucketName,
        key: &ObjectKey,
        pin: PinGuard,
    ) -> Result<CachedObject> {
        let file = tokio::fs::File::open(fqn).await.map_err(|e| Error::Fetch {
            bucket: bucket.as_str().to_string(),
            key: key.as_str().to_string(),
            reason: format!("open {}: {e}", fqn.display()),
        })?;
        let size = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        touch_atime(fqn);
        Ok(CachedObject {
            file,
            size,
            path: fqn.to_path_buf(),
            _pin: pin,
        })
    }

    /// Single-flight wrapper: simultaneous misses for one path queue on
    /// a per-path mutex and re-check before filling themselves, so a
    /// failed fill never poisons the waiters behind it.
    async fn coalesced_fill(
        &self,
        mp: &Arc<Mountpath>,
        fqn: &Path,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<()> {
        let gate = self
            .inflight
            .entry(fqn.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = gate.lock().await;
            if tokio::fs::try_exists(fqn).await.unwrap_or(false) {
                Ok(())
            } else {
                match self.backend.get_object(bucket, key).await {
                    Ok(body) => self
                        .install(mp, fqn, body.stream, body.checksum, bucket, key)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };
        self.inflight
            .remove_if(&fqn.to_path_buf(), |_, v| Arc::strong_count(v) <= 2);
        result
    }

    /// Stream into a staging file, verify, and atomically rename into
    /// place. Nothing is ever visible at the final path until the bytes
    /// are complete and verified.
    async fn install(
        &self,
        mp: &Arc<Mountpath>,
        fqn: &Path,
        mut stream: BoxStream<'static, std::io::Result<Bytes>>,
        reported: Option<Checksum>,
        bucket: &BucketName,
        key: &ObjectKey,
    ) -> Result<u64> {
        let Some(parent) = fqn.parent() else {
            return Err(Error::storage(fqn.display().to_string(), "no parent directory"));
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| self.degrade(mp, parent, "create dir", &e))?;

        let staging = staging_path(fqn);
        let _staging_pin = self.pins.pin(staging.clone());
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| self.degrade(mp, &staging, "create file", &e))?;

        let mut digests = DigestBuilder::new();
        let mut outcome: Result<()> = Ok(());
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    outcome = Err(Error::Fetch {
                        bucket: bucket.as_str().to_string(),
                        key: key.as_str().to_string(),
                        reason: format!("transfer: {e}"),
                    });
                    break;
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                outcome = Err(self.degrade(mp, &staging, "write", &e));
                break;
            }
            digests.update(&chunk);
        }
        if outcome.is_ok() {
            if let Err(e) = file.sync_all().await {
                outcome = Err(self.degrade(mp, &staging, "sync", &e));
            }
        }
        drop(file);

        if let Err(e) = outcome {
            scrub(&staging).await;
            return Err(e);
        }

        let written = digests.bytes();
        let computed = digests.finalize();
        match reported {
            Some(checksum) if !computed.matches(&checksum) => {
                let actual = computed.render_for(&checksum);
                warn!(
                    bucket = %bucket, key = %key,
                    expected = %checksum, actual = %actual,
                    "checksum mismatch, scrubbing"
                );
                scrub(&staging).await;
                return Err(Error::ChecksumMismatch {
                    bucket: bucket.as_str().to_string(),
                    key: key.as_str().to_string(),
                    expected: checksum.to_string(),
                    actual,
                });
            }
            Some(_) => {}
            None => {
                debug!(bucket = %bucket, key = %key, "no checksum reported, installing unverified");
            }
        }

        if let Err(e) = tokio::fs::rename(&staging, fqn).await {
            let err = self.degrade(mp, fqn, "rename", &e);
            scrub(&staging).await;
            return Err(err);
        }

        self.stats
            .bytes_fetched
            .fetch_add(written, Ordering::Relaxed);
        info!(bucket = %bucket, key = %key, bytes = written, fqn = %fqn.display(), "installed");
        Ok(written)
    }

    /// Local I/O failed: take the mountpath out of rotation and build
    /// the storage error to propagate
    fn degrade(&self, mp: &Arc<Mountpath>, path: &Path, what: &str, e: &std::io::Error) -> Error {
        mp.disable();
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        Error::storage(path.display().to_string(), format!("{what}: {e}"))
    }
}

/// Sibling staging path: dot-prefixed so eviction sweeps skip it,
/// unique so concurrent installs of different keys never collide
fn staging_path(fqn: &Path) -> PathBuf {
    let name = fqn
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = uuid::Uuid::new_v4().simple();
    fqn.with_file_name(format!(".{name}.{unique}.partial"))
}

async fn scrub(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}

/// Best-effort access-time bump so LRU eviction sees reads even on
/// noatime mounts
fn touch_atime(path: &Path) {
    let now = std::time::SystemTime::now();
    if let Ok(f) = std::fs::File::options().write(true).open(path) {
        let _ = f.set_times(std::fs::FileTimes::new().set_accessed(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::MemoryBackend;
    use cirrus_common::checksum::sha256_of;
    use cirrus_placement::MountpathSet;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        cache: Arc<ObjectCache>,
        backend: Arc<MemoryBackend>,
        mounts: Arc<MountpathSet>,
        stats: Arc<CacheStats>,
        _root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountpathSet::emulated(root.path(), 2).unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let stats = Arc::new(CacheStats::default());
        let cluster = Arc::new(ClusterMap::new());
        let cache = Arc::new(ObjectCache::new(
            NodeId::new("t1"),
            Placement::new(Arc::clone(&mounts)),
            cluster,
            Arc::clone(&backend) as Arc<dyn CloudBackend>,
            Arc::clone(&stats),
        ));
        Fixture {
            cache,
            backend,
            mounts,
            stats,
            _root: root,
        }
    }

    fn locator(key: &str) -> (BucketName, ObjectKey) {
        (
            BucketName::new_unchecked("b1"),
            ObjectKey::new_unchecked(key),
        )
    }

    async fn read_all(obj: &mut CachedObject) -> Vec<u8> {
        let mut buf = Vec::new();
        obj.file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn resolved_fqn(fx: &Fixture, bucket: &BucketName, key: &ObjectKey) -> PathBuf {
        Placement::new(Arc::clone(&fx.mounts))
            .resolve(bucket, key)
            .unwrap()
            .fqn(bucket, key)
    }

    #[tokio::test]
    async fn test_cold_get_fills_then_serves_warm() {
        let fx = fixture();
        fx.backend.insert("b1", "o1", &b"object body"[..]);
        let (bucket, key) = locator("o1");

        let mut obj = fx.cache.get(&bucket, &key).await.unwrap();
        assert_eq!(read_all(&mut obj).await, b"object body");
        assert_eq!(obj.size, 11);
        drop(obj);

        let fqn = resolved_fqn(&fx, &bucket, &key);
        assert_eq!(std::fs::read(&fqn).unwrap(), b"object body");

        // warm hit: no second backend fetch
        let mut again = fx.cache.get(&bucket, &key).await.unwrap();
        assert_eq!(read_all(&mut again).await, b"object body");
        assert_eq!(fx.backend.fetch_count(), 1);
        assert_eq!(fx.stats.snapshot().cold_gets, 1);
        assert_eq!(fx.stats.snapshot().bytes_fetched, 11);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_file() {
        let fx = fixture();
        fx.backend.insert_with_checksum(
            "b1",
            "bad",
            &b"actual bytes"[..],
            sha256_of(b"expected different bytes"),
        );
        let (bucket, key) = locator("bad");

        let err = fx.cache.get(&bucket, &key).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));

        let fqn = resolved_fqn(&fx, &bucket, &key);
        assert!(!fqn.exists());
        // no staging litter either
        for mp in fx.mounts.all() {
            for entry in walk(mp.path()) {
                panic!("unexpected leftover file {}", entry.display());
            }
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_fetch_error() {
        let fx = fixture();
        let (bucket, key) = locator("absent");
        let err = fx.cache.get(&bucket, &key).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert!(!resolved_fqn(&fx, &bucket, &key).exists());
    }

    #[tokio::test]
    async fn test_concurrent_cold_gets_fetch_once() {
        let fx = fixture();
        fx.backend.insert("b1", "hot", vec![7u8; 64 * 1024]);
        let (bucket, key) = locator("hot");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&fx.cache);
            let (bucket, key) = (bucket.clone(), key.clone());
            tasks.push(tokio::spawn(async move {
                let mut obj = cache.get(&bucket, &key).await.unwrap();
                let mut buf = Vec::new();
                obj.file.read_to_end(&mut buf).await.unwrap();
                buf.len()
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), 64 * 1024);
        }
        assert_eq!(fx.backend.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_install_is_noop_on_existing() {
        let fx = fixture();
        let (bucket, key) = locator("copied");

        let first = stream_of(b"first version");
        let written = fx
            .cache
            .install_from_stream(&bucket, &key, first)
            .await
            .unwrap();
        assert_eq!(written, 13);

        let second = stream_of(b"second version");
        let written = fx
            .cache
            .install_from_stream(&bucket, &key, second)
            .await
            .unwrap();
        assert_eq!(written, 0);

        let fqn = resolved_fqn(&fx, &bucket, &key);
        assert_eq!(std::fs::read(&fqn).unwrap(), b"first version");
    }

    #[tokio::test]
    async fn test_copy_role_validation() {
        let fx = fixture();
        fx.cache.cluster.add(Member::new(NodeId::new("t2"), "127.0.0.1", 8082));

        // neither source nor destination
        let err = fx
            .cache
            .copy_role(&CopyMsg {
                from_id: "x".into(),
                to_id: "y".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // source with known destination
        let role = fx
            .cache
            .copy_role(&CopyMsg {
                from_id: "t1".into(),
                to_id: "t2".into(),
            })
            .unwrap();
        assert!(matches!(role, CopyRole::Source { peer } if peer.id == NodeId::new("t2")));

        // source with unknown destination
        let err = fx
            .cache
            .copy_role(&CopyMsg {
                from_id: "t1".into(),
                to_id: "ghost".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // destination
        let role = fx
            .cache
            .copy_role(&CopyMsg {
                from_id: "t2".into(),
                to_id: "t1".into(),
            })
            .unwrap();
        assert!(matches!(role, CopyRole::Destination));
    }

    #[tokio::test]
    async fn test_open_for_send_requires_presence() {
        let fx = fixture();
        let (bucket, key) = locator("never-cached");
        let err = fx.cache.open_for_send(&bucket, &key).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    fn stream_of(bytes: &'static [u8]) -> BoxStream<'static, std::io::Result<Bytes>> {
        futures::stream::once(async move { Ok(Bytes::from_static(bytes)) }).boxed()
    }

    fn walk(root: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(root) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }
}
