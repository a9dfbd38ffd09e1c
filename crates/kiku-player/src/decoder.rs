//! Decoder backends that turn a stream URL into raw s16le PCM.
//!
//! A backend launches a [`DecodeProcess`]: a byte reader plus a shared
//! [`ProcessHandle`] used by the worker, the stall watchdog, and the
//! controller to observe and terminate the decoder.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use kiku_types::PcmFormat;

use crate::config::PlayerConfig;
use crate::sanitize::is_mp3_url;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(20);
const STDERR_CAP_BYTES: usize = 8 * 1024;

/// How a decoder finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit status; `None` when terminated by a signal or cancelled.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated"),
        }
    }
}

/// Control surface of a running decoder.
pub trait ProcessHandle: Send + Sync {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Exit status if the decoder already finished. Never blocks.
    fn exit(&self) -> Option<ProcessExit>;

    fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Ask the decoder to stop, escalating to [`ProcessHandle::kill`] after `grace`.
    fn terminate(&self, grace: Duration);

    /// Stop immediately.
    fn kill(&self);

    /// Diagnostics collected from the decoder so far.
    fn stderr_text(&self) -> String;
}

/// A launched decoder: PCM byte stream plus its control handle.
pub struct DecodeProcess {
    pub reader: Box<dyn Read + Send>,
    pub handle: Arc<dyn ProcessHandle>,
}

/// Per-attempt decoder parameters.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub url: String,
    pub format: PcmFormat,
    pub user_agent: String,
    pub read_timeout: Duration,
    pub reconnect_delay_max: Duration,
}

impl LaunchRequest {
    pub fn new(url: &str, format: PcmFormat, config: &PlayerConfig) -> Self {
        Self {
            url: url.to_string(),
            format,
            user_agent: config.user_agent.clone(),
            read_timeout: config.read_timeout,
            reconnect_delay_max: config.reconnect_delay_max,
        }
    }
}

/// A way of decoding network streams.
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap check that the backend can run at all.
    fn is_available(&self) -> bool;

    fn launch(&self, request: &LaunchRequest) -> Result<DecodeProcess>;
}

/// External `ffmpeg` process writing PCM to stdout.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    binary: String,
}

impl FfmpegBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}

impl DecoderBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn is_available(&self) -> bool {
        let child = self
            .command()
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(binary = %self.binary, "decoder not found: {e}");
                return false;
            }
        };

        let deadline = Instant::now() + AVAILABILITY_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.success(),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => {
                    tracing::warn!(binary = %self.binary, "decoder version check timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                Err(e) => {
                    tracing::warn!(binary = %self.binary, "decoder version check failed: {e}");
                    return false;
                }
            }
        }
    }

    fn launch(&self, request: &LaunchRequest) -> Result<DecodeProcess> {
        let args = ffmpeg_args(request);
        tracing::debug!(binary = %self.binary, args = ?args, "spawning decoder");

        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("decoder stdout not captured"))?;
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, stderr_buf.clone(), child.id());
        }

        let handle = ChildHandle {
            pid: child.id(),
            child: Mutex::new(child),
            exit: Mutex::new(None),
            stderr: stderr_buf,
        };
        Ok(DecodeProcess {
            reader: Box::new(stdout),
            handle: Arc::new(handle),
        })
    }
}

/// Command line for decoding `request.url` into raw PCM on stdout.
pub fn ffmpeg_args(request: &LaunchRequest) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-nostdin",
        "-rw_timeout",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(request.read_timeout.as_micros().to_string());
    args.push("-user_agent".into());
    args.push(request.user_agent.clone());
    for (flag, value) in [
        ("-reconnect", "1".to_string()),
        ("-reconnect_streamed", "1".to_string()),
        ("-reconnect_at_eof", "1".to_string()),
        (
            "-reconnect_delay_max",
            request.reconnect_delay_max.as_secs().max(1).to_string(),
        ),
        ("-reconnect_on_network_error", "1".to_string()),
    ] {
        args.push(flag.into());
        args.push(value);
    }
    if is_mp3_url(&request.url) {
        args.push("-headers".into());
        args.push("Accept: audio/mpeg\r\nIcy-MetaData: 0\r\n".into());
    }
    args.push("-i".into());
    args.push(request.url.clone());
    for s in ["-vn", "-fflags", "nobuffer", "-f", "s16le", "-ar"] {
        args.push(s.into());
    }
    args.push(request.format.sample_rate.to_string());
    args.push("-ac".into());
    args.push(request.format.channels.to_string());
    for s in ["-acodec", "pcm_s16le", "-loglevel", "error", "-"] {
        args.push(s.into());
    }
    args
}

fn spawn_stderr_drain(stderr: std::process::ChildStderr, buf: Arc<Mutex<String>>, pid: u32) {
    let spawned = thread::Builder::new()
        .name("decoder-stderr".into())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(pid, "decoder: {line}");
                if let Ok(mut g) = buf.lock() {
                    if g.len() < STDERR_CAP_BYTES {
                        g.push_str(line);
                        g.push('\n');
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(pid, "failed to spawn stderr drain: {e}");
    }
}

struct ChildHandle {
    pid: u32,
    child: Mutex<Child>,
    exit: Mutex<Option<ProcessExit>>,
    stderr: Arc<Mutex<String>>,
}

impl ChildHandle {
    fn poll_exit(&self) -> Option<ProcessExit> {
        let mut cached = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        if cached.is_some() {
            return *cached;
        }
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait() {
            Ok(Some(status)) => {
                *cached = Some(ProcessExit {
                    code: status.code(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = self.pid, "decoder wait failed: {e}");
                *cached = Some(ProcessExit { code: None });
            }
        }
        *cached
    }

    #[cfg(unix)]
    fn send_terminate(&self) {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        // SAFETY: signalling our own child process id; a stale id only yields ESRCH.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            tracing::debug!(pid = self.pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&self) {
        self.kill_now();
    }

    fn kill_now(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let _ = child.kill();
    }
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit(&self) -> Option<ProcessExit> {
        self.poll_exit()
    }

    fn terminate(&self, grace: Duration) {
        if self.poll_exit().is_some() {
            return;
        }
        tracing::debug!(pid = self.pid, "terminating decoder");
        self.send_terminate();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.poll_exit().is_some() {
                return;
            }
            thread::sleep(EXIT_POLL);
        }
        self.kill();
    }

    fn kill(&self) {
        if self.poll_exit().is_some() {
            return;
        }
        tracing::debug!(pid = self.pid, "killing decoder");
        self.kill_now();
        let deadline = Instant::now() + Duration::from_millis(500);
        while self.poll_exit().is_none() && Instant::now() < deadline {
            thread::sleep(EXIT_POLL);
        }
    }

    fn stderr_text(&self) -> String {
        self.stderr
            .lock()
            .map(|g| g.trim().to_string())
            .unwrap_or_default()
    }
}
