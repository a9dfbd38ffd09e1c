//! State shared between the controller and one worker session.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::decoder::ProcessHandle;
use crate::output::OutputAbort;

/// Volume and mute, read by the worker once per chunk.
#[derive(Debug)]
pub(crate) struct VolumeState {
    value: AtomicU8,
    muted: AtomicBool,
}

impl VolumeState {
    pub(crate) fn new(value: u8, muted: bool) -> Self {
        Self {
            value: AtomicU8::new(value.min(100)),
            muted: AtomicBool::new(muted),
        }
    }

    pub(crate) fn snapshot(&self) -> (u8, bool) {
        (
            self.value.load(Ordering::Relaxed),
            self.muted.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_value(&self, value: u8) {
        self.value.store(value.min(100), Ordering::Relaxed);
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }
}

/// Flags and handles for a single playback session.
pub(crate) struct SessionShared {
    pub(crate) url: String,
    /// Cooperative stop request; also interrupts blocked output writes.
    pub(crate) stop: Arc<AtomicBool>,
    /// Output pause; read by the device callback as well.
    pub(crate) paused: Arc<AtomicBool>,
    /// Set once the worker has fully cleaned up.
    pub(crate) finished: AtomicBool,
    process: Mutex<Option<Arc<dyn ProcessHandle>>>,
    output: Mutex<Option<Arc<dyn OutputAbort>>>,
}

impl SessionShared {
    pub(crate) fn new(url: String) -> Self {
        Self {
            url,
            stop: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            process: Mutex::new(None),
            output: Mutex::new(None),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_process(&self, handle: Option<Arc<dyn ProcessHandle>>) {
        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    fn current_process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_output(&self, handle: Option<Arc<dyn OutputAbort>>) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    /// Silence and unblock the session's output from any thread.
    pub(crate) fn abort_output(&self) -> bool {
        let handle = self
            .output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handle {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }

    /// Request stop and terminate the decoder (with `grace`, or immediately).
    pub(crate) fn request_stop(&self, grace: Option<Duration>) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(process) = self.current_process() {
            match grace {
                Some(grace) => process.terminate(grace),
                None => process.kill(),
            }
        }
    }
}
