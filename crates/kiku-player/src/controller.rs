//! Public playback surface: at most one worker session at a time.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kiku_types::{PlaybackEndReason, PlayerEvent, PlayerStatus};

use crate::config::PlayerConfig;
use crate::decoder::DecoderBackend;
use crate::events::{EventSink, emit};
use crate::output::OutputOpener;
use crate::sanitize::sanitize_url;
use crate::session::{SessionShared, VolumeState};
use crate::worker::{WorkerContext, run_session};

const JOIN_POLL: Duration = Duration::from_millis(10);
const FORCE_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

struct ActiveSession {
    shared: Arc<SessionShared>,
    join: JoinHandle<PlaybackEndReason>,
}

#[derive(Default)]
struct Recorded {
    last_event: Option<PlayerEvent>,
    end_reason: Option<PlaybackEndReason>,
}

/// Forwards to the caller's sink after remembering what was last reported.
struct RecordingSink {
    inner: Arc<dyn EventSink>,
    recorded: Mutex<Recorded>,
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: PlayerEvent) {
        {
            let mut rec = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            rec.last_event = Some(event);
            rec.end_reason = match event {
                PlayerEvent::Stopped => Some(PlaybackEndReason::Stopped),
                PlayerEvent::Ended => Some(PlaybackEndReason::Ended),
                PlayerEvent::Error => Some(PlaybackEndReason::Error),
                PlayerEvent::Opening => None,
                _ => rec.end_reason,
            };
        }
        self.inner.on_event(event);
    }
}

/// Coordinates play/stop/pause/volume against the worker thread.
///
/// `play`, `stop` and `pause_toggle` are serialised by a transition mutex.
/// Queries never wait on a transition in flight.
pub struct PlaybackController {
    ctx: WorkerContext,
    recorder: Arc<RecordingSink>,
    ready: AtomicBool,
    active: Mutex<Option<ActiveSession>>,
    current: Mutex<Option<Arc<SessionShared>>>,
    lingering: Mutex<Vec<JoinHandle<PlaybackEndReason>>>,
}

impl PlaybackController {
    pub fn new(
        config: PlayerConfig,
        backend: Arc<dyn DecoderBackend>,
        opener: Arc<dyn OutputOpener>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let recorder = Arc::new(RecordingSink {
            inner: sink,
            recorded: Mutex::new(Recorded::default()),
        });
        let ctx = WorkerContext {
            config: Arc::new(config),
            backend,
            opener,
            sink: recorder.clone(),
            volume: Arc::new(VolumeState::new(100, false)),
        };
        let controller = Self {
            ctx,
            recorder,
            ready: AtomicBool::new(false),
            active: Mutex::new(None),
            current: Mutex::new(None),
            lingering: Mutex::new(Vec::new()),
        };
        controller.reinitialize();
        controller
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Re-check the decoder backend. Emits `EngineInitFailed` when unusable.
    pub fn reinitialize(&self) -> bool {
        let ok = self.ctx.backend.is_available();
        self.ready.store(ok, Ordering::Release);
        if ok {
            tracing::info!(backend = self.ctx.backend.name(), "decoder backend ready");
        } else {
            tracing::error!(backend = self.ctx.backend.name(), "decoder backend unavailable");
            emit(&self.ctx.sink, PlayerEvent::EngineInitFailed);
        }
        ok
    }

    /// Start playing `url`, replacing any other session.
    ///
    /// Returns `true` when a session for `url` is running afterwards.
    pub fn play(&self, url: &str) -> bool {
        if !self.is_ready() {
            tracing::warn!("play requested but decoder backend is not ready");
            emit(&self.ctx.sink, PlayerEvent::Error);
            return false;
        }
        let url = sanitize_url(url);
        if url.is_empty() {
            tracing::warn!("play requested with an empty url");
            emit(&self.ctx.sink, PlayerEvent::Error);
            return false;
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = active.as_ref() {
            let s = &session.shared;
            if s.url == url && !s.is_finished() && !s.stop_requested() {
                tracing::debug!(url = %url, "already playing");
                return true;
            }
        }

        if let Some(previous) = active.take() {
            previous.shared.request_stop(Some(self.ctx.config.terminate_grace));
            reap(previous.join);
        }
        self.set_current(None);
        self.join_lingering();

        let shared = Arc::new(SessionShared::new(url.clone()));
        let ctx = self.ctx.clone();
        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("kiku-worker".into())
            .spawn(move || run_session(&ctx, &worker_shared));

        match spawned {
            Ok(join) => {
                tracing::info!(url = %url, "playback session started");
                self.set_current(Some(shared.clone()));
                *active = Some(ActiveSession { shared, join });
                true
            }
            Err(e) => {
                tracing::error!(url = %url, "failed to spawn playback worker: {e}");
                emit(&self.ctx.sink, PlayerEvent::Error);
                false
            }
        }
    }

    /// Stop the current session. Does nothing when idle.
    pub fn stop(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = active.take() else {
            return;
        };
        self.set_current(None);

        if session.shared.is_finished() {
            reap(session.join);
            emit(&self.ctx.sink, PlayerEvent::Stopped);
            return;
        }

        tracing::info!(url = %session.shared.url, "stopping playback");
        session.shared.request_stop(Some(self.ctx.config.terminate_grace));
        let shared = session.shared.clone();
        if let Some(join) = join_bounded(session, self.ctx.config.join_timeout) {
            tracing::warn!("playback worker did not stop in time; silencing output, will join before next play");
            shared.abort_output();
            self.lingering
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(join);
        }
    }

    /// Pause or resume output. The decoder keeps running while paused.
    ///
    /// Returns the new paused state, or `None` when nothing is playing.
    pub fn pause_toggle(&self) -> Option<bool> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let session = active.as_ref()?;
        let s = &session.shared;
        if s.is_finished() || s.stop_requested() {
            return None;
        }
        let paused = !s.paused.load(Ordering::Relaxed);
        s.paused.store(paused, Ordering::Relaxed);
        tracing::info!(paused, "pause toggled");
        emit(
            &self.ctx.sink,
            if paused {
                PlayerEvent::Paused
            } else {
                PlayerEvent::Playing
            },
        );
        Some(paused)
    }

    pub fn set_volume(&self, percent: u8) {
        self.ctx.volume.set_value(percent);
    }

    pub fn set_mute(&self, muted: bool) {
        self.ctx.volume.set_muted(muted);
    }

    pub fn volume(&self) -> u8 {
        self.ctx.volume.snapshot().0
    }

    pub fn is_muted(&self) -> bool {
        self.ctx.volume.snapshot().1
    }

    /// A worker is running and has not been asked to stop.
    pub fn is_playing(&self) -> bool {
        self.current()
            .is_some_and(|s| !s.is_finished() && !s.stop_requested())
    }

    pub fn is_paused(&self) -> bool {
        self.current()
            .is_some_and(|s| !s.is_finished() && s.is_paused())
    }

    /// URL of the current session, kept after it ends until `stop` or `play`.
    pub fn current_url(&self) -> Option<String> {
        self.current().map(|s| s.url.clone())
    }

    pub fn status(&self) -> PlayerStatus {
        let (volume, muted) = self.ctx.volume.snapshot();
        let rec = self
            .recorder
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        PlayerStatus {
            current_url: self.current_url(),
            playing: self.is_playing(),
            paused: self.is_paused(),
            volume,
            muted,
            ready: self.is_ready(),
            last_event: rec.last_event,
            end_reason: rec.end_reason,
        }
    }

    /// Emergency teardown for when `stop` is suspected to be stuck.
    ///
    /// Kills the decoder without grace, silences the output device, and only
    /// joins the worker if no other transition holds the lock. Never blocks on
    /// that lock and never panics.
    pub fn force_cleanup(&self) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if let Some(shared) = self.current() {
                tracing::warn!(url = %shared.url, "forcing playback cleanup");
                shared.request_stop(None);
                shared.abort_output();
            }
            let mut active = match self.active.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    tracing::warn!("transition in flight; skipping worker join");
                    return;
                }
            };
            if let Some(session) = active.take() {
                session.shared.request_stop(None);
                session.shared.abort_output();
                self.set_current(None);
                if let Some(join) = join_bounded(session, FORCE_JOIN_TIMEOUT) {
                    self.lingering
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(join);
                }
            }
        }));
        if result.is_err() {
            tracing::error!("force cleanup panicked");
        }
    }

    fn current(&self) -> Option<Arc<SessionShared>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, shared: Option<Arc<SessionShared>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = shared;
    }

    fn join_lingering(&self) {
        let handles: Vec<_> = self
            .lingering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for join in handles {
            reap(join);
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
        let lingering = self
            .lingering
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !lingering.is_empty() {
            tracing::warn!(count = lingering.len(), "detaching unfinished playback workers");
            lingering.clear();
        }
    }
}

/// Wait up to `timeout` for the worker; hand the handle back if it is still running.
fn join_bounded(session: ActiveSession, timeout: Duration) -> Option<JoinHandle<PlaybackEndReason>> {
    let deadline = Instant::now() + timeout;
    while !session.join.is_finished() && !is_current_thread(&session.join) {
        if Instant::now() >= deadline {
            return Some(session.join);
        }
        thread::sleep(JOIN_POLL);
    }
    reap(session.join);
    None
}

/// Join a worker, unless called from that worker (e.g. from an event sink).
fn reap(join: JoinHandle<PlaybackEndReason>) {
    if is_current_thread(&join) {
        return;
    }
    match join.join() {
        Ok(reason) => tracing::debug!(reason = ?reason, "playback worker joined"),
        Err(_) => tracing::error!("playback worker panicked"),
    }
}

fn is_current_thread(join: &JoinHandle<PlaybackEndReason>) -> bool {
    join.thread().id() == thread::current().id()
}
