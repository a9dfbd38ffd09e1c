//! Playback worker: one thread per session.
//!
//! Opens the output, walks the candidate URLs, pumps decoder PCM into the
//! output, and classifies how the session ended.

use std::io::{ErrorKind, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use kiku_types::{PcmFormat, PlaybackEndReason, PlayerEvent};

use crate::config::PlayerConfig;
use crate::decoder::{DecoderBackend, LaunchRequest, ProcessHandle};
use crate::events::{EventSink, emit};
use crate::output::{AudioOutput, OutputOpener, open_with_fallback};
use crate::pcm::{SampleAssembler, gain_for_volume};
use crate::sanitize::candidate_urls;
use crate::session::{SessionShared, VolumeState};
use crate::watchdog::{StallClock, StallWatchdog, WatchdogConfig};

const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(50);
const PAUSED_BACKOFF: Duration = Duration::from_millis(20);
const EMPTY_READ_LOG_EVERY: u64 = 20;

/// Everything a session needs besides its own flags.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<PlayerConfig>,
    pub(crate) backend: Arc<dyn DecoderBackend>,
    pub(crate) opener: Arc<dyn OutputOpener>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) volume: Arc<VolumeState>,
}

/// Run one session to completion and emit its terminal event.
///
/// Never panics; the session is marked finished before the terminal event
/// is delivered.
pub(crate) fn run_session(ctx: &WorkerContext, session: &SessionShared) -> PlaybackEndReason {
    emit(&ctx.sink, PlayerEvent::Opening);

    let reason = match catch_unwind(AssertUnwindSafe(|| drive(ctx, session))) {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!(url = %session.url, "playback worker panicked");
            if session.stop_requested() {
                PlaybackEndReason::Stopped
            } else {
                PlaybackEndReason::Error
            }
        }
    };

    session.set_process(None);
    session.finished.store(true, Ordering::Release);
    tracing::info!(url = %session.url, reason = ?reason, "playback session finished");
    emit(&ctx.sink, reason.event());
    reason
}

/// Closes the output and unregisters it from the session on every exit path.
struct OutputGuard<'a> {
    output: Box<dyn AudioOutput>,
    session: &'a SessionShared,
}

impl<'a> OutputGuard<'a> {
    fn register(output: Box<dyn AudioOutput>, session: &'a SessionShared) -> Self {
        session.set_output(Some(output.abort_handle()));
        Self { output, session }
    }
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        self.session.set_output(None);
        self.output.close();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct AttemptOutcome {
    streamed: bool,
    forced_error: bool,
}

fn drive(ctx: &WorkerContext, session: &SessionShared) -> PlaybackEndReason {
    let cfg = &ctx.config;

    if !ctx.backend.is_available() {
        tracing::error!(backend = ctx.backend.name(), "decoder backend unavailable");
        return PlaybackEndReason::Error;
    }

    let output = match open_with_fallback(
        ctx.opener.as_ref(),
        cfg.device_index,
        cfg.format,
        session.paused.clone(),
    ) {
        Ok(out) => out,
        Err(e) => {
            tracing::error!("audio output unavailable: {e:#}");
            return PlaybackEndReason::Error;
        }
    };
    let mut output = OutputGuard::register(output, session);
    let format = output.output.format();

    let candidates = candidate_urls(&session.url, &cfg.fallbacks);
    let mut session_started = false;
    let mut last = AttemptOutcome::default();

    for (attempt, url) in candidates.iter().enumerate() {
        if session.stop_requested() {
            break;
        }
        tracing::info!(url = %url, attempt, backend = ctx.backend.name(), "opening stream");
        emit(&ctx.sink, PlayerEvent::Buffering(None));

        last = run_attempt(
            ctx,
            session,
            output.output.as_mut(),
            url,
            format,
            &mut session_started,
        );
        if last.streamed {
            break;
        }
        if !session.stop_requested() {
            tracing::warn!(url = %url, attempt, "stream produced no audio; trying next candidate");
        }
    }

    if session.stop_requested() {
        PlaybackEndReason::Stopped
    } else if last.forced_error || !session_started {
        PlaybackEndReason::Error
    } else {
        PlaybackEndReason::Ended
    }
}

/// Terminates the attempt's decoder and detaches it from the session.
struct AttemptGuard<'a> {
    session: &'a SessionShared,
    handle: Arc<dyn ProcessHandle>,
    grace: Duration,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.handle.is_running() {
            self.handle.terminate(self.grace);
        }
        self.session.set_process(None);
    }
}

fn run_attempt(
    ctx: &WorkerContext,
    session: &SessionShared,
    output: &mut dyn AudioOutput,
    url: &str,
    format: PcmFormat,
    session_started: &mut bool,
) -> AttemptOutcome {
    let cfg = &ctx.config;
    let request = LaunchRequest::new(url, format, cfg);
    let process = match ctx.backend.launch(&request) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(url = %url, "decoder launch failed: {e:#}");
            return AttemptOutcome {
                streamed: false,
                forced_error: true,
            };
        }
    };
    let mut reader = process.reader;
    let handle = process.handle;
    session.set_process(Some(handle.clone()));
    let guard = AttemptGuard {
        session,
        handle: handle.clone(),
        grace: cfg.terminate_grace,
    };
    // A stop that raced the launch did not see this process.
    if session.stop_requested() {
        return AttemptOutcome::default();
    }

    let clock = Arc::new(StallClock::new());
    let watchdog = match StallWatchdog::spawn(
        handle.clone(),
        clock.clone(),
        session.stop.clone(),
        session.paused.clone(),
        WatchdogConfig {
            stall_timeout: cfg.stall_timeout,
            poll: cfg.watchdog_poll,
            terminate_grace: cfg.terminate_grace,
        },
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("stall watchdog unavailable: {e:#}");
            None
        }
    };

    let mut outcome = AttemptOutcome::default();
    let mut buf = vec![0u8; cfg.chunk_bytes.max(2)];
    let mut assembler = SampleAssembler::new();
    let mut samples: Vec<i16> = Vec::with_capacity(buf.len() / 2 + 1);
    let mut empty_reads: u64 = 0;
    // A paused device does not drain, so pause also interrupts a blocked write.
    let write_interrupted = || session.stop_requested() || session.is_paused();

    while !session.stop_requested() {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                if handle.is_running() {
                    empty_reads += 1;
                    if empty_reads % EMPTY_READ_LOG_EVERY == 0 {
                        tracing::debug!(url = %url, empty_reads, "waiting for decoder output");
                    }
                    thread::sleep(EMPTY_READ_BACKOFF);
                    continue;
                }
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !session.stop_requested() {
                    tracing::warn!(url = %url, "decoder read failed: {e}");
                    outcome.forced_error = true;
                }
                break;
            }
        };

        clock.touch();
        empty_reads = 0;
        if !outcome.streamed {
            outcome.streamed = true;
            tracing::info!(url = %url, pid = ?handle.id(), "stream started");
            if !*session_started {
                *session_started = true;
                emit(&ctx.sink, PlayerEvent::Playing);
            }
        }

        let (volume, muted) = ctx.volume.snapshot();
        assembler.convert(&buf[..n], gain_for_volume(volume), muted, &mut samples);

        if session.is_paused() {
            if output.is_active() {
                if let Err(e) = output.set_active(false) {
                    tracing::warn!("output pause failed: {e:#}");
                }
            }
            thread::sleep(PAUSED_BACKOFF);
            continue;
        }
        if !output.is_active() {
            if let Err(e) = output.set_active(true) {
                tracing::warn!("output resume failed: {e:#}");
            }
        }
        if let Err(e) = output.write(&samples, &write_interrupted) {
            tracing::error!("output write failed: {e:#}");
            outcome.forced_error = true;
            break;
        }
    }

    if handle.is_running() {
        handle.terminate(cfg.terminate_grace);
    }
    let tripped = watchdog.map(StallWatchdog::finish).unwrap_or(false);
    let exit = handle.exit();
    let stderr = handle.stderr_text();
    drop(guard);

    tracing::info!(
        url = %url,
        exit = ?exit.map(|e| e.code),
        streamed = outcome.streamed,
        stalled = tripped,
        "decoder finished"
    );
    if !stderr.is_empty() {
        tracing::warn!(url = %url, "decoder diagnostics: {stderr}");
    }

    if !session.stop_requested() {
        if tripped {
            outcome.forced_error = true;
        }
        if exit.is_some_and(|e| !e.success()) {
            outcome.forced_error = true;
        }
        if !outcome.streamed && !stderr.is_empty() {
            outcome.forced_error = true;
        }
    }
    outcome
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decoder::{DecodeProcess, ProcessExit};
    use crate::events::EventSink;
    use crate::output::OutputAbort;
    use crate::queue::SharedAudio;
    use anyhow::{Result, anyhow};
    use crossbeam_channel::{Receiver, Sender};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Scripted decoder output for one launch.
    #[derive(Clone, Debug)]
    pub(crate) enum Script {
        /// Emit these chunks, then exit with `code`.
        Chunks { chunks: Vec<Vec<u8>>, code: i32, stderr: &'static str },
        /// Emit chunks forever until stopped.
        Endless,
        /// Stay alive without output.
        Silent,
        /// Launch fails.
        LaunchError,
    }

    pub(crate) struct FakeBackend {
        pub(crate) available: bool,
        scripts: Mutex<VecDeque<Script>>,
        pub(crate) launched: Mutex<Vec<String>>,
        pub(crate) live: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        pub(crate) fn new(scripts: Vec<Script>) -> Self {
            Self {
                available: true,
                scripts: Mutex::new(scripts.into()),
                launched: Mutex::new(Vec::new()),
                live: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn launched(&self) -> Vec<String> {
            self.launched.lock().unwrap().clone()
        }
    }

    struct FakeProcess {
        exit: Mutex<Option<ProcessExit>>,
        stderr: &'static str,
        live: Arc<AtomicUsize>,
    }

    impl FakeProcess {
        fn end(&self, code: Option<i32>) {
            let mut g = self.exit.lock().unwrap();
            if g.is_none() {
                *g = Some(ProcessExit { code });
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl ProcessHandle for FakeProcess {
        fn id(&self) -> Option<u32> {
            None
        }
        fn exit(&self) -> Option<ProcessExit> {
            *self.exit.lock().unwrap()
        }
        fn terminate(&self, _grace: Duration) {
            self.end(None);
        }
        fn kill(&self) {
            self.end(None);
        }
        fn stderr_text(&self) -> String {
            self.stderr.to_string()
        }
    }

    struct FakeReader {
        chunks: VecDeque<Vec<u8>>,
        endless: bool,
        code: i32,
        process: Arc<FakeProcess>,
    }

    impl Read for FakeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.process.exit().is_some() {
                return Ok(0);
            }
            if self.endless {
                thread::sleep(Duration::from_millis(2));
                let n = buf.len().min(64);
                buf[..n].fill(1);
                return Ok(n);
            }
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None if self.code == i32::MIN => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(0)
                }
                None => {
                    self.process.end(Some(self.code));
                    Ok(0)
                }
            }
        }
    }

    impl DecoderBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn launch(&self, request: &LaunchRequest) -> Result<DecodeProcess> {
            self.launched.lock().unwrap().push(request.url.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Chunks { chunks: vec![], code: 1, stderr: "" });
            let (chunks, endless, code, stderr) = match script {
                Script::LaunchError => return Err(anyhow!("spawn failed")),
                Script::Chunks { chunks, code, stderr } => (chunks, false, code, stderr),
                Script::Endless => (vec![], true, 0, ""),
                Script::Silent => (vec![], false, i32::MIN, ""),
            };
            self.live.fetch_add(1, Ordering::SeqCst);
            let process = Arc::new(FakeProcess {
                exit: Mutex::new(None),
                stderr,
                live: self.live.clone(),
            });
            Ok(DecodeProcess {
                reader: Box::new(FakeReader {
                    chunks: chunks.into(),
                    endless,
                    code,
                    process: process.clone(),
                }),
                handle: process,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct OutputLog {
        pub(crate) written: Mutex<Vec<i16>>,
        pub(crate) opened: Mutex<Vec<Option<usize>>>,
        pub(crate) open_now: AtomicUsize,
        pub(crate) max_open: AtomicUsize,
        pub(crate) deactivations: AtomicUsize,
        pub(crate) aborts: AtomicUsize,
    }

    impl OutputLog {
        fn mark_open(&self) {
            let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeOpener {
        pub(crate) log: Arc<OutputLog>,
        pub(crate) fail_indexed: bool,
        pub(crate) fail_all: bool,
        /// Each write sleeps this long and ignores interrupts.
        pub(crate) write_delay: Duration,
    }

    impl FakeOpener {
        pub(crate) fn new() -> Self {
            Self {
                log: Arc::new(OutputLog::default()),
                fail_indexed: false,
                fail_all: false,
                write_delay: Duration::ZERO,
            }
        }
    }

    struct FakeOutput {
        log: Arc<OutputLog>,
        format: PcmFormat,
        active: bool,
        closed: bool,
        write_delay: Duration,
    }

    struct CountingAbort(Arc<OutputLog>);

    impl OutputAbort for CountingAbort {
        fn abort(&self) {
            self.0.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioOutput for FakeOutput {
        fn format(&self) -> PcmFormat {
            self.format
        }
        fn write(&mut self, samples: &[i16], _interrupted: &dyn Fn() -> bool) -> Result<()> {
            if !self.write_delay.is_zero() {
                thread::sleep(self.write_delay);
            }
            self.log.written.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
        fn is_active(&self) -> bool {
            self.active
        }
        fn set_active(&mut self, active: bool) -> Result<()> {
            if !active {
                self.log.deactivations.fetch_add(1, Ordering::SeqCst);
            }
            self.active = active;
            Ok(())
        }
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.log.open_now.fetch_sub(1, Ordering::SeqCst);
            }
        }
        fn abort_handle(&self) -> Arc<dyn OutputAbort> {
            Arc::new(CountingAbort(self.log.clone()))
        }
    }

    impl OutputOpener for FakeOpener {
        fn open(
            &self,
            index: Option<usize>,
            format: PcmFormat,
            _paused: Arc<AtomicBool>,
        ) -> Result<Box<dyn AudioOutput>> {
            self.log.opened.lock().unwrap().push(index);
            if self.fail_all || (index.is_some() && self.fail_indexed) {
                return Err(anyhow!("no device"));
            }
            self.log.mark_open();
            Ok(Box::new(FakeOutput {
                log: self.log.clone(),
                format,
                active: true,
                closed: false,
                write_delay: self.write_delay,
            }))
        }
    }

    /// Output over a real [`SharedAudio`] with a drain thread standing in for
    /// the device callback. The drain halts while the session is paused.
    pub(crate) struct QueueOpener {
        pub(crate) log: Arc<OutputLog>,
        capacity: usize,
        /// Samples drained per millisecond; zero models a hung device.
        drain_per_ms: usize,
        /// Ignore write interrupts so only an abort can free the writer.
        wedged: bool,
    }

    impl QueueOpener {
        /// Drains slower than `Script::Endless` produces, so writes block.
        pub(crate) fn slow() -> Self {
            Self {
                log: Arc::new(OutputLog::default()),
                capacity: 128,
                drain_per_ms: 8,
                wedged: false,
            }
        }

        pub(crate) fn hung() -> Self {
            Self {
                drain_per_ms: 0,
                wedged: true,
                ..Self::slow()
            }
        }
    }

    struct QueueOutput {
        queue: Arc<SharedAudio>,
        log: Arc<OutputLog>,
        format: PcmFormat,
        active: bool,
        closed: bool,
        wedged: bool,
        drain: Option<thread::JoinHandle<()>>,
    }

    struct QueueAbort {
        queue: Arc<SharedAudio>,
        log: Arc<OutputLog>,
    }

    impl OutputAbort for QueueAbort {
        fn abort(&self) {
            self.log.aborts.fetch_add(1, Ordering::SeqCst);
            self.queue.close();
        }
    }

    impl AudioOutput for QueueOutput {
        fn format(&self) -> PcmFormat {
            self.format
        }
        fn write(&mut self, samples: &[i16], interrupted: &dyn Fn() -> bool) -> Result<()> {
            if self.queue.is_done() {
                return Err(anyhow!("output closed"));
            }
            let converted: Vec<f32> = samples.iter().map(|s| f32::from(*s)).collect();
            let ignore = || false;
            let check: &dyn Fn() -> bool = if self.wedged { &ignore } else { interrupted };
            let pushed = self.queue.push_interleaved_interruptible(&converted, check);
            self.log
                .written
                .lock()
                .unwrap()
                .extend_from_slice(&samples[..pushed]);
            Ok(())
        }
        fn is_active(&self) -> bool {
            self.active
        }
        fn set_active(&mut self, active: bool) -> Result<()> {
            if !active {
                self.log.deactivations.fetch_add(1, Ordering::SeqCst);
            }
            self.active = active;
            Ok(())
        }
        fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            self.queue.close();
            if let Some(drain) = self.drain.take() {
                drain.join().unwrap();
            }
            self.log.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        fn abort_handle(&self) -> Arc<dyn OutputAbort> {
            Arc::new(QueueAbort {
                queue: self.queue.clone(),
                log: self.log.clone(),
            })
        }
    }

    impl OutputOpener for QueueOpener {
        fn open(
            &self,
            index: Option<usize>,
            format: PcmFormat,
            paused: Arc<AtomicBool>,
        ) -> Result<Box<dyn AudioOutput>> {
            self.log.opened.lock().unwrap().push(index);
            self.log.mark_open();
            let queue = Arc::new(SharedAudio::new(format.channels as usize, self.capacity));
            let drain = (self.drain_per_ms > 0).then(|| {
                let queue = queue.clone();
                let per_ms = self.drain_per_ms;
                let channels = format.channels as usize;
                thread::spawn(move || {
                    while !queue.is_done() {
                        if !paused.load(Ordering::Relaxed) {
                            queue.pop_nonblocking(per_ms / channels.max(1));
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                })
            });
            Ok(Box::new(QueueOutput {
                queue,
                log: self.log.clone(),
                format,
                active: true,
                closed: false,
                wedged: self.wedged,
                drain,
            }))
        }
    }

    pub(crate) fn event_channel() -> (Arc<dyn EventSink>, Receiver<PlayerEvent>) {
        let (tx, rx): (Sender<PlayerEvent>, Receiver<PlayerEvent>) = crossbeam_channel::unbounded();
        (Arc::new(tx), rx)
    }

    pub(crate) fn test_config() -> PlayerConfig {
        PlayerConfig {
            stall_timeout: Duration::from_millis(100),
            watchdog_poll: Duration::from_millis(10),
            terminate_grace: Duration::from_millis(10),
            join_timeout: Duration::from_secs(2),
            ..PlayerConfig::default()
        }
    }

    fn context(
        backend: Arc<FakeBackend>,
        opener: Arc<FakeOpener>,
        config: PlayerConfig,
    ) -> (WorkerContext, Receiver<PlayerEvent>) {
        let (sink, rx) = event_channel();
        (
            WorkerContext {
                config: Arc::new(config),
                backend,
                opener,
                sink,
                volume: Arc::new(VolumeState::new(100, false)),
            },
            rx,
        )
    }

    fn le(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn events(rx: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn natural_end_after_audio_is_ended() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[1, 2]), le(&[3, 4])],
            code: 0,
            stderr: "",
        }]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener.clone(), test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Ended);
        assert_eq!(
            events(&rx),
            vec![
                PlayerEvent::Opening,
                PlayerEvent::Buffering(None),
                PlayerEvent::Playing,
                PlayerEvent::Ended
            ]
        );
        assert_eq!(*opener.log.written.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(opener.log.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert!(session.is_finished());
    }

    #[test]
    fn falls_back_to_next_candidate_when_primary_is_silent() {
        let backend = Arc::new(FakeBackend::new(vec![
            Script::Chunks { chunks: vec![], code: 1, stderr: "404 Not Found" },
            Script::Chunks { chunks: vec![le(&[7, 7])], code: 0, stderr: "" },
        ]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener, test_config());
        let session = SessionShared::new("https://listen.moe/stream/mp3".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Ended);
        assert_eq!(
            backend.launched(),
            vec![
                "https://listen.moe/stream/mp3".to_string(),
                "https://listen.moe/stream".to_string()
            ]
        );
        let evs = events(&rx);
        assert_eq!(evs.iter().filter(|e| **e == PlayerEvent::Playing).count(), 1);
        assert_eq!(evs.iter().filter(|e| **e == PlayerEvent::Buffering(None)).count(), 2);
    }

    #[test]
    fn all_candidates_failing_is_error() {
        let backend = Arc::new(FakeBackend::new(vec![
            Script::LaunchError,
            Script::Chunks { chunks: vec![], code: 1, stderr: "" },
            Script::Chunks { chunks: vec![], code: 0, stderr: "Connection refused" },
            Script::LaunchError,
        ]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener, test_config());
        let session = SessionShared::new("https://listen.moe/kpop/stream/mp3".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Error);
        assert_eq!(backend.launched().len(), 4);
        let evs = events(&rx);
        assert!(!evs.contains(&PlayerEvent::Playing));
        assert_eq!(evs.last(), Some(&PlayerEvent::Error));
    }

    #[test]
    fn nonzero_exit_after_audio_is_error_without_fallback() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[1, 1])],
            code: 1,
            stderr: "",
        }]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, _rx) = context(backend.clone(), opener, test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Error);
        assert_eq!(backend.launched().len(), 1);
    }

    #[test]
    fn stalled_decoder_is_terminated_as_error() {
        let backend = Arc::new(FakeBackend::new(vec![
            Script::Silent,
            Script::Silent,
            Script::Silent,
        ]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener, test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Error);
        assert_eq!(backend.launched().len(), 3);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert_eq!(events(&rx).last(), Some(&PlayerEvent::Error));
    }

    #[test]
    fn unavailable_backend_fails_before_opening_output() {
        let mut fake = FakeBackend::new(vec![]);
        fake.available = false;
        let backend = Arc::new(fake);
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener.clone(), test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Error);
        assert!(opener.log.opened.lock().unwrap().is_empty());
        assert!(backend.launched().is_empty());
        assert_eq!(events(&rx), vec![PlayerEvent::Opening, PlayerEvent::Error]);
    }

    #[test]
    fn configured_device_falls_back_to_default() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[5])],
            code: 0,
            stderr: "",
        }]));
        let mut opener = FakeOpener::new();
        opener.fail_indexed = true;
        let opener = Arc::new(opener);
        let config = PlayerConfig {
            device_index: Some(4),
            ..test_config()
        };
        let (ctx, _rx) = context(backend, opener.clone(), config);
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Ended);
        assert_eq!(*opener.log.opened.lock().unwrap(), vec![Some(4), None]);
    }

    #[test]
    fn output_failure_is_error_without_launching() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Endless]));
        let mut opener = FakeOpener::new();
        opener.fail_all = true;
        let (ctx, rx) = context(backend.clone(), Arc::new(opener), test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Error);
        assert!(backend.launched().is_empty());
        assert!(!events(&rx).contains(&PlayerEvent::Buffering(None)));
    }

    #[test]
    fn muted_session_writes_silence() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[1000, -1000, 42])],
            code: 0,
            stderr: "",
        }]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, _rx) = context(backend, opener.clone(), test_config());
        ctx.volume.set_muted(true);
        let session = SessionShared::new("https://listen.moe/stream".into());

        run_session(&ctx, &session);
        assert_eq!(*opener.log.written.lock().unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn volume_scales_written_samples() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[1000, -1000])],
            code: 0,
            stderr: "",
        }]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, _rx) = context(backend, opener.clone(), test_config());
        ctx.volume.set_value(25);
        let session = SessionShared::new("https://listen.moe/stream".into());

        run_session(&ctx, &session);
        assert_eq!(*opener.log.written.lock().unwrap(), vec![250, -250]);
    }

    #[test]
    fn paused_session_skips_writes_and_stops_device() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Chunks {
            chunks: vec![le(&[9, 9]), le(&[9, 9])],
            code: 0,
            stderr: "",
        }]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend, opener.clone(), test_config());
        let session = SessionShared::new("https://listen.moe/stream".into());
        session.paused.store(true, Ordering::Relaxed);

        assert_eq!(run_session(&ctx, &session), PlaybackEndReason::Ended);
        assert!(opener.log.written.lock().unwrap().is_empty());
        assert_eq!(opener.log.deactivations.load(Ordering::SeqCst), 1);
        assert!(events(&rx).contains(&PlayerEvent::Playing));
    }

    #[test]
    fn stop_request_ends_session_as_stopped() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Endless]));
        let opener = Arc::new(FakeOpener::new());
        let (ctx, rx) = context(backend.clone(), opener.clone(), test_config());
        let session = Arc::new(SessionShared::new("https://listen.moe/stream".into()));

        let worker_session = session.clone();
        let worker_ctx = ctx.clone();
        let join = thread::spawn(move || run_session(&worker_ctx, &worker_session));

        thread::sleep(Duration::from_millis(50));
        session.request_stop(Some(Duration::from_millis(10)));
        assert_eq!(join.join().unwrap(), PlaybackEndReason::Stopped);
        assert_eq!(events(&rx).last(), Some(&PlayerEvent::Stopped));
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert_eq!(opener.log.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(backend.launched().len(), 1);
    }

    #[test]
    fn pause_during_blocked_write_keeps_decoder_alive() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Endless]));
        let opener = Arc::new(QueueOpener::slow());
        let (sink, _rx) = event_channel();
        let ctx = WorkerContext {
            config: Arc::new(test_config()),
            backend: backend.clone(),
            opener: opener.clone(),
            sink,
            volume: Arc::new(VolumeState::new(100, false)),
        };
        let session = Arc::new(SessionShared::new("https://listen.moe/stream".into()));

        let worker_session = session.clone();
        let join = thread::spawn(move || run_session(&ctx, &worker_session));

        // Let the queue fill so the worker sits in back-pressure.
        thread::sleep(Duration::from_millis(200));
        session.paused.store(true, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(500));
        assert_eq!(backend.live.load(Ordering::SeqCst), 1);
        assert!(opener.log.deactivations.load(Ordering::SeqCst) >= 1);

        session.paused.store(false, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(backend.live.load(Ordering::SeqCst), 1);

        session.request_stop(Some(Duration::from_millis(10)));
        assert_eq!(join.join().unwrap(), PlaybackEndReason::Stopped);
        assert_eq!(backend.launched().len(), 1);
        assert_eq!(opener.log.open_now.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn aborting_output_frees_a_wedged_writer() {
        let backend = Arc::new(FakeBackend::new(vec![Script::Endless]));
        let opener = Arc::new(QueueOpener::hung());
        let (sink, _rx) = event_channel();
        let ctx = WorkerContext {
            config: Arc::new(test_config()),
            backend: backend.clone(),
            opener: opener.clone(),
            sink,
            volume: Arc::new(VolumeState::new(100, false)),
        };
        let session = Arc::new(SessionShared::new("https://listen.moe/stream".into()));

        let worker_session = session.clone();
        let join = thread::spawn(move || run_session(&ctx, &worker_session));

        thread::sleep(Duration::from_millis(100));
        session.request_stop(None);
        thread::sleep(Duration::from_millis(100));
        assert!(!join.is_finished());
        assert_eq!(opener.log.open_now.load(Ordering::SeqCst), 1);

        assert!(session.abort_output());
        assert_eq!(join.join().unwrap(), PlaybackEndReason::Stopped);
        assert_eq!(opener.log.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(opener.log.open_now.load(Ordering::SeqCst), 0);
        assert!(!session.abort_output());
    }
}
