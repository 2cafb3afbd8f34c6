//! Cirrus Runner - process-wide supervisor for long-lived workers
//!
//! A daemon is a fixed set of named workers (service loop, stats
//! collector, eviction watchdog, signal handler) launched concurrently.
//! The first worker to return - success or failure - takes the whole
//! group down: every other worker gets a cooperative stop signal, and
//! the supervisor waits for all of them before returning the triggering
//! result. A dedicated signal worker converts SIGINT/SIGTERM into the
//! same protocol so shutdown is uniform whether triggered externally or
//! internally.

use async_trait::async_trait;
use cirrus_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

static SHUTDOWN_REASON: Error = Error::Shutdown;

/// A long-lived worker hosted by a [`RunGroup`].
///
/// `run` blocks for the worker's lifetime; `stop` must cause a pending
/// `run` to return at its next natural checkpoint and release any
/// resources the worker holds (listeners, file handles). Both may be
/// called from different tasks.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    async fn run(self: Arc<Self>) -> Result<()>;
    async fn stop(&self, reason: &Error);
}

struct Entry {
    name: String,
    runner: Arc<dyn Runner>,
}

/// Supervisor owning the registered workers
pub struct RunGroup {
    entries: Vec<Entry>,
    stop_tx: mpsc::Sender<Error>,
    stop_rx: mpsc::Receiver<Error>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// External handle for injecting a synthetic termination
#[derive(Clone)]
pub struct GroupHandle {
    stop_tx: mpsc::Sender<Error>,
    done_rx: watch::Receiver<bool>,
}

impl GroupHandle {
    /// Stop the group without waiting for a natural worker exit and wait
    /// until every worker has acknowledged
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(Error::Shutdown).await;
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for RunGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGroup {
    #[must_use]
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            entries: Vec::new(),
            stop_tx,
            stop_rx,
            done_tx,
            done_rx,
        }
    }

    /// Register a named worker; must happen before [`run`](Self::run)
    pub fn add(&mut self, runner: Arc<dyn Runner>, name: impl Into<String>) {
        self.entries.push(Entry {
            name: name.into(),
            runner,
        });
    }

    /// Handle for injecting an external stop
    #[must_use]
    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            stop_tx: self.stop_tx.clone(),
            done_rx: self.done_rx.clone(),
        }
    }

    /// Launch every registered worker, block until the first returns or
    /// an external stop arrives, then stop all workers exactly once each
    /// and wait for their completions before returning the triggering
    /// result.
    pub async fn run(mut self) -> Result<()> {
        let n = self.entries.len();
        if n == 0 {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<(usize, Result<()>)>(n);
        for (i, entry) in self.entries.iter().enumerate() {
            let tx = tx.clone();
            let runner = Arc::clone(&entry.runner);
            let name = entry.name.clone();
            tokio::spawn(async move {
                let res = runner.run().await;
                match &res {
                    Ok(()) => info!(worker = %name, "worker finished"),
                    Err(e) if e.is_shutdown() => info!(worker = %name, "worker shut down"),
                    Err(e) => error!(worker = %name, error = %e, "worker failed"),
                }
                let _ = tx.send((i, res)).await;
            });
        }
        drop(tx);

        // exactly one of these decides the outcome; self.stop_tx keeps
        // the injection channel open even when no handle exists
        let first = tokio::select! {
            completion = rx.recv() => completion.map(|(i, res)| (Some(i), res)),
            injected = self.stop_rx.recv() => injected.map(|e| (None, Err(e))),
        };
        let Some((first_idx, outcome)) = first else {
            let _ = self.done_tx.send(true);
            return Ok(());
        };
        match first_idx {
            Some(i) => {
                info!(worker = %self.entries[i].name, "first worker returned, stopping group");
            }
            None => info!("external stop requested"),
        }

        let reason = outcome.as_ref().err().unwrap_or(&SHUTDOWN_REASON);
        for entry in &self.entries {
            entry.runner.stop(reason).await;
        }

        // every worker's termination path runs before we return
        let remaining = if first_idx.is_some() { n - 1 } else { n };
        for _ in 0..remaining {
            let _ = rx.recv().await;
        }
        let _ = self.done_tx.send(true);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Waits until stopped; optionally fails immediately instead
    struct TestWorker {
        fail_with: Option<String>,
        stopped: Notify,
        stop_calls: AtomicUsize,
    }

    impl TestWorker {
        fn waiting() -> Arc<Self> {
            Arc::new(Self {
                fail_with: None,
                stopped: Notify::new(),
                stop_calls: AtomicUsize::new(0),
            })
        }

        fn failing(msg: &str) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Some(msg.to_string()),
                stopped: Notify::new(),
                stop_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Runner for TestWorker {
        async fn run(self: Arc<Self>) -> Result<()> {
            match &self.fail_with {
                Some(msg) => Err(Error::protocol(msg.clone())),
                None => {
                    self.stopped.notified().await;
                    Err(Error::Shutdown)
                }
            }
        }

        async fn stop(&self, _reason: &Error) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            // notify_one stores a permit, so a stop that lands before
            // run() reaches its await point is not lost
            self.stopped.notify_one();
        }
    }

    #[tokio::test]
    async fn test_failing_worker_stops_everyone_once() {
        let workers = vec![
            TestWorker::waiting(),
            TestWorker::failing("boom"),
            TestWorker::waiting(),
        ];
        let mut group = RunGroup::new();
        for (i, w) in workers.iter().enumerate() {
            group.add(Arc::clone(w) as Arc<dyn Runner>, format!("w{i}"));
        }

        let err = group.run().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "boom"));
        for w in &workers {
            assert_eq!(w.stop_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_external_stop() {
        let workers = vec![TestWorker::waiting(), TestWorker::waiting()];
        let mut group = RunGroup::new();
        for (i, w) in workers.iter().enumerate() {
            group.add(Arc::clone(w) as Arc<dyn Runner>, format!("w{i}"));
        }
        let handle = group.handle();

        let join = tokio::spawn(group.run());
        handle.stop().await;

        let res = join.await.unwrap();
        assert!(matches!(res, Err(Error::Shutdown)));
        for w in &workers {
            assert_eq!(w.stop_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_group_returns_ok() {
        let group = RunGroup::new();
        assert!(group.run().await.is_ok());
    }
}
