//! Collaborator runners hosted alongside the service loop
//!
//! The signal runner converts external termination into the group's
//! uniform shutdown protocol; the stats runner logs counters and
//! capacity utilization on an interval; the eviction runner drives
//! periodic watchdog passes.

use async_trait::async_trait;
use cirrus_common::{Error, Result};
use cirrus_placement::MountpathSet;
use cirrus_runner::Runner;
use cirrus_store::{CacheStats, CapacityProbe, EvictionManager, StatvfsProbe};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Raise SIGINT against this process so internally-requested shutdown
/// takes the same path as an operator's Ctrl-C
pub fn raise_sigint() -> Result<()> {
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT)
        .map_err(|e| Error::DiskIo(std::io::Error::from_raw_os_error(e as i32)))
}

/// Converts SIGINT/SIGTERM into the terminal-error protocol
pub struct SignalRunner {
    shutdown: watch::Sender<bool>,
}

impl SignalRunner {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown }
    }
}

impl Default for SignalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for SignalRunner {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut rx = self.shutdown.subscribe();
        tokio::select! {
            _ = sigint.recv() => {
                info!("caught SIGINT");
                Err(Error::Shutdown)
            }
            _ = sigterm.recv() => {
                info!("caught SIGTERM");
                Err(Error::Shutdown)
            }
            _ = rx.wait_for(|stopped| *stopped) => Ok(()),
        }
    }

    async fn stop(&self, _reason: &Error) {
        let _ = self.shutdown.send(true);
    }
}

/// Logs the stats snapshot and per-mountpath capacity on an interval
pub struct StatsRunner {
    stats: Arc<CacheStats>,
    mounts: Option<Arc<MountpathSet>>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl StatsRunner {
    #[must_use]
    pub fn new(
        stats: Arc<CacheStats>,
        mounts: Option<Arc<MountpathSet>>,
        interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            stats,
            mounts,
            interval,
            shutdown,
        }
    }

    fn log_once(&self) {
        let snap = self.stats.snapshot();
        info!(
            gets = snap.gets,
            cold_gets = snap.cold_gets,
            puts = snap.puts,
            lists = snap.lists,
            errors = snap.errors,
            bytes_fetched = snap.bytes_fetched,
            evicted_objects = snap.evicted_objects,
            "stats"
        );
        if let Some(mounts) = &self.mounts {
            let probe = StatvfsProbe;
            for mp in mounts.all() {
                match probe.usage(mp.path()) {
                    Ok(usage) => info!(
                        path = %mp.path().display(),
                        used_percent = usage.used_percent(),
                        enabled = mp.is_enabled(),
                        "capacity"
                    ),
                    Err(e) => debug!(path = %mp.path().display(), error = %e, "capacity probe failed"),
                }
            }
        }
    }
}

#[async_trait]
impl Runner for StatsRunner {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        let mut rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_once(),
                _ = rx.wait_for(|stopped| *stopped) => return Ok(()),
            }
        }
    }

    async fn stop(&self, _reason: &Error) {
        let _ = self.shutdown.send(true);
    }
}

// (EvictionRunner below cannot hold the `watch::Ref` across the
// `spawn_blocking().await` in its sibling arm without making the future
// non-`Send`, so it drops the guard in an async block.)

/// Drives periodic eviction passes on the blocking pool
pub struct EvictionRunner {
    manager: Arc<EvictionManager>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl EvictionRunner {
    #[must_use]
    pub fn new(manager: Arc<EvictionManager>, interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            interval,
            shutdown,
        }
    }
}

#[async_trait]
impl Runner for EvictionRunner {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = Arc::clone(&self.manager);
                    if let Err(e) = tokio::task::spawn_blocking(move || manager.run_pass()).await {
                        warn!(error = %e, "eviction pass panicked");
                    }
                }
                _ = async { let _ = rx.wait_for(|stopped| *stopped).await; } => return Ok(()),
            }
        }
    }

    async fn stop(&self, _reason: &Error) {
        let _ = self.shutdown.send(true);
    }
}
