//! Stall detection for decode attempts.
//!
//! A decoder that stays alive but stops producing PCM (dead socket, stuck
//! server) would otherwise hang the session forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::decoder::ProcessHandle;

/// Time of the last successful PCM read.
#[derive(Debug)]
pub struct StallClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl StallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record that data just arrived.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last [`StallClock::touch`] (or creation).
    pub fn idle(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for StallClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    pub stall_timeout: Duration,
    pub poll: Duration,
    pub terminate_grace: Duration,
}

/// Background thread terminating a decoder whose [`StallClock`] went idle.
///
/// Exits on its own when the decoder ends or `cancel` is set. Time spent
/// with `paused` set never counts as idle.
pub struct StallWatchdog {
    done_tx: Option<Sender<()>>,
    tripped: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StallWatchdog {
    pub fn spawn(
        handle: Arc<dyn ProcessHandle>,
        clock: Arc<StallClock>,
        cancel: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        cfg: WatchdogConfig,
    ) -> Result<Self> {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let tripped = Arc::new(AtomicBool::new(false));
        let tripped_thread = tripped.clone();

        let join = thread::Builder::new()
            .name("stall-watchdog".into())
            .spawn(move || {
                loop {
                    match done_rx.recv_timeout(cfg.poll) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                    if cancel.load(Ordering::Relaxed) || !handle.is_running() {
                        return;
                    }
                    if paused.load(Ordering::Relaxed) {
                        clock.touch();
                        continue;
                    }
                    let idle = clock.idle();
                    if idle >= cfg.stall_timeout {
                        tracing::warn!(
                            idle_ms = idle.as_millis() as u64,
                            pid = ?handle.id(),
                            "decoder stalled; terminating"
                        );
                        tripped_thread.store(true, Ordering::Relaxed);
                        handle.terminate(cfg.terminate_grace);
                        return;
                    }
                }
            })
            .context("spawn stall watchdog")?;

        Ok(Self {
            done_tx: Some(done_tx),
            tripped,
            join: Some(join),
        })
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Stop the watchdog, join it, and report whether it fired.
    pub fn finish(mut self) -> bool {
        self.shutdown();
        self.tripped()
    }

    fn shutdown(&mut self) {
        self.done_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
