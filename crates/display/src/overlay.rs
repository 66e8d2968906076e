//! Overlay-plane committer.
//!
//! The render path drops plane updates into a single-slot mailbox; a
//! dedicated worker takes them out and performs the plane configuration
//! call. A newer submission overwrites one the worker has not picked up
//! yet, so producers never block and never queue.
//!
//! The mailbox lock is held only for field copies. The kernel call happens
//! with the lock released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use pj_common::{DisplayError, OverlayConfig, Rect};

use crate::fb_cache::FramebufferCache;
use crate::kms::{DmaBufFrame, FramebufferId, KmsDevice, PlaneCommit, PlaneUpdate};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Mailbox {
    pending: Option<PlaneUpdate>,
    /// Taken by the worker and not yet through `set_plane`.
    in_flight: Option<FramebufferId>,
    last_committed: Option<FramebufferId>,
    stats: OverlayStats,
}

#[derive(Debug, Default)]
struct Shared {
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
    stop: AtomicBool,
}

/// Overlay counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub submitted: u64,
    /// Submissions replaced before the worker picked them up.
    pub overwritten: u64,
    pub committed: u64,
    pub failed: u64,
}

/// How [`OverlayCommitter::shutdown`] ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Joined,
    /// The worker did not exit in time and was left running detached.
    Detached,
    AlreadyStopped,
}

// ---------------------------------------------------------------------------
// OverlayCommitter
// ---------------------------------------------------------------------------

/// Owns the overlay worker thread.
pub struct OverlayCommitter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl std::fmt::Debug for OverlayCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayCommitter")
            .field("running", &self.worker.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl OverlayCommitter {
    /// Start the worker; it owns `plane` from now on.
    pub fn spawn<P: PlaneCommit + 'static>(plane: P) -> Result<Self, DisplayError> {
        let shared = Arc::new(Shared::default());
        let (exit_tx, exited) = channel::bounded(1);

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("overlay-commit".into())
            .spawn(move || {
                run_worker(&worker_shared, plane);
                let _ = exit_tx.send(());
            })
            .map_err(DisplayError::WorkerSpawn)?;

        debug!("Overlay worker started");
        Ok(Self {
            shared,
            worker: Some(worker),
            exited,
        })
    }

    /// Hand the worker a new plane update, replacing any it has not taken.
    ///
    /// Never blocks on the kernel. Returns `true` if an older update was
    /// overwritten.
    pub fn submit(&self, update: PlaneUpdate) -> bool {
        let overwritten = {
            let mut mailbox = self.shared.mailbox.lock();
            let overwritten = mailbox.pending.replace(update).is_some();
            mailbox.stats.submitted += 1;
            if overwritten {
                mailbox.stats.overwritten += 1;
            }
            overwritten
        };
        self.shared.wake.notify_one();
        overwritten
    }

    /// Stop the worker.
    ///
    /// Sets the stop flag, wakes the worker and waits up to `timeout` for
    /// it to exit. A worker stuck in a kernel call past the timeout is
    /// detached; Rust offers no way to cancel it.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownOutcome {
        let Some(worker) = self.worker.take() else {
            return ShutdownOutcome::AlreadyStopped;
        };

        self.shared.stop.store(true, Ordering::Release);
        {
            // Taking the lock orders the store before a waiting worker's
            // re-check.
            let _mailbox = self.shared.mailbox.lock();
            self.shared.wake.notify_all();
        }

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    warn!("Overlay worker panicked");
                }
                info!(stats = ?self.stats(), "Overlay worker stopped");
                ShutdownOutcome::Joined
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Overlay worker did not exit in time, detaching"
                );
                drop(worker);
                ShutdownOutcome::Detached
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Framebuffer of the last successful plane configuration.
    pub fn last_committed(&self) -> Option<FramebufferId> {
        self.shared.mailbox.lock().last_committed
    }

    /// Update waiting for the worker, if any.
    pub fn pending(&self) -> Option<PlaneUpdate> {
        self.shared.mailbox.lock().pending
    }

    /// Framebuffer the worker is passing to the kernel right now.
    pub fn in_flight(&self) -> Option<FramebufferId> {
        self.shared.mailbox.lock().in_flight
    }

    /// Every framebuffer the worker still references (waiting, in the
    /// kernel call, or on the plane), read under one lock.
    fn referenced(&self) -> [Option<FramebufferId>; 3] {
        let mailbox = self.shared.mailbox.lock();
        [
            mailbox.pending.map(|update| update.fb),
            mailbox.in_flight,
            mailbox.last_committed,
        ]
    }

    pub fn stats(&self) -> OverlayStats {
        self.shared.mailbox.lock().stats
    }
}

impl Drop for OverlayCommitter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown(Duration::from_millis(pj_common::config::DEFAULT_OVERLAY_SHUTDOWN_MS));
        }
    }
}

fn run_worker<P: PlaneCommit>(shared: &Shared, mut plane: P) {
    loop {
        let update = {
            let mut mailbox = shared.mailbox.lock();
            while mailbox.pending.is_none() && !shared.stop.load(Ordering::Acquire) {
                shared.wake.wait(&mut mailbox);
            }
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            match mailbox.pending.take() {
                Some(update) => {
                    mailbox.in_flight = Some(update.fb);
                    update
                }
                None => continue,
            }
        };

        let result = plane.set_plane(&update);

        let mut mailbox = shared.mailbox.lock();
        mailbox.in_flight = None;
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        match result {
            Ok(()) => {
                mailbox.last_committed = Some(update.fb);
                mailbox.stats.committed += 1;
                trace!(fb = update.fb.0, "Overlay plane committed");
            }
            Err(e) => {
                mailbox.stats.failed += 1;
                drop(mailbox);
                warn!(fb = update.fb.0, error = %e, "Overlay plane configuration failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OverlayPath
// ---------------------------------------------------------------------------

/// Zero-copy overlay presentation: framebuffer registration on the main
/// loop plus the committer worker.
#[derive(Debug)]
pub struct OverlayPath {
    committer: OverlayCommitter,
    fb_cache: FramebufferCache,
    /// Framebuffers registered while the cache was full.
    transient: Vec<FramebufferId>,
    shutdown_timeout: Duration,
    torn_down: bool,
}

impl OverlayPath {
    pub fn new<P: PlaneCommit + 'static>(plane: P, config: &OverlayConfig) -> Result<Self, DisplayError> {
        Ok(Self {
            committer: OverlayCommitter::spawn(plane)?,
            fb_cache: FramebufferCache::new(config.framebuffer_cache_capacity),
            transient: Vec::new(),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            torn_down: false,
        })
    }

    /// Register (or reuse) a framebuffer for `frame` and submit it to the
    /// overlay plane at `dest`.
    pub fn present<K: KmsDevice>(
        &mut self,
        device: &mut K,
        frame: &DmaBufFrame,
        dest: Rect,
    ) -> Result<FramebufferId, DisplayError> {
        if self.torn_down {
            return Err(DisplayError::NotInitialized);
        }

        let fb = match self.fb_cache.get(frame.id) {
            Some(fb) => fb,
            None => {
                let fb = device.add_framebuffer(&frame.framebuffer_desc())?;
                if !self.fb_cache.insert(frame.id, fb) {
                    self.transient.push(fb);
                }
                fb
            }
        };

        // Sampled before the submit too, so a fast worker cannot make the
        // framebuffer still on the plane look stale.
        let on_plane = self.committer.last_committed();
        self.committer.submit(PlaneUpdate { fb, dest });
        let mut live = vec![fb];
        live.extend(on_plane);
        live.extend(self.committer.referenced().into_iter().flatten());
        self.reap_transient(device, &live);
        Ok(fb)
    }

    /// Stop the worker, then remove every framebuffer this path registered.
    /// Idempotent.
    ///
    /// A detached worker is still inside `set_plane`; its framebuffer is
    /// leaked rather than removed under it.
    pub fn teardown<K: KmsDevice>(&mut self, device: &mut K) -> ShutdownOutcome {
        let outcome = self.committer.shutdown(self.shutdown_timeout);
        if self.torn_down {
            return outcome;
        }
        self.torn_down = true;

        let busy = match outcome {
            ShutdownOutcome::Detached => self.committer.in_flight(),
            _ => None,
        };
        if let Some(fb) = busy {
            warn!(fb = fb.0, "Overlay worker still in set_plane, leaking its framebuffer");
        }

        let mut removed = 0;
        let registered = self.fb_cache.invalidate().into_iter().chain(self.transient.drain(..));
        for fb in registered.filter(|fb| Some(*fb) != busy) {
            match device.remove_framebuffer(fb) {
                Ok(()) => removed += 1,
                Err(e) => warn!(fb = fb.0, error = %e, "Failed to remove overlay framebuffer"),
            }
        }
        info!(removed, outcome = ?outcome, "Overlay path torn down");
        outcome
    }

    pub fn committer(&self) -> &OverlayCommitter {
        &self.committer
    }

    pub fn cached_framebuffers(&self) -> usize {
        self.fb_cache.len()
    }

    /// Remove uncached framebuffers the worker no longer references.
    fn reap_transient<K: KmsDevice>(&mut self, device: &mut K, live: &[FramebufferId]) {
        if self.transient.is_empty() {
            return;
        }
        let (keep, stale): (Vec<_>, Vec<_>) = self
            .transient
            .drain(..)
            .partition(|fb| live.contains(fb));
        self.transient = keep;
        for fb in stale {
            if let Err(e) = device.remove_framebuffer(fb) {
                warn!(fb = fb.0, error = %e, "Failed to remove overlay framebuffer");
            }
        }
    }
}
