//! In-process decode engine.
//!
//! Streams the HTTP body with `ureq`, decodes it with Symphonia, resamples
//! with Rubato when the source rate differs from the requested one, and
//! exposes the result as an s16le byte reader, the same shape an external
//! decoder process provides.
//!
//! Threads per launch:
//! - fetch: playlist resolution + HTTP body → byte chunks
//! - decode: Symphonia + Rubato → PCM chunks

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use kiku_types::PcmFormat;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use ureq::Agent;
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::time::Duration as WaitDuration;
use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, DefaultConnector, NextTimeout, Transport,
};

use crate::decoder::{DecodeProcess, DecoderBackend, LaunchRequest, ProcessExit, ProcessHandle};
use crate::sanitize::{is_mp3_url, sanitize_url};

const FETCH_CHUNK_BYTES: usize = 16 * 1024;
const FETCH_QUEUE_CHUNKS: usize = 64;
const PCM_QUEUE_CHUNKS: usize = 16;
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Symphonia-based backend; needs no external binaries.
#[derive(Clone, Debug)]
pub struct NativeBackend {
    /// How long the PCM reader waits before reporting an empty read.
    pub poll_interval: Duration,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DecoderBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn launch(&self, request: &LaunchRequest) -> Result<DecodeProcess> {
        let state = Arc::new(EngineState::default());
        let (byte_tx, byte_rx) = crossbeam_channel::bounded::<Vec<u8>>(FETCH_QUEUE_CHUNKS);
        let (pcm_tx, pcm_rx) = crossbeam_channel::bounded::<Vec<u8>>(PCM_QUEUE_CHUNKS);
        let poll = self.poll_interval;

        let fetch_state = state.clone();
        let fetch_request = request.clone();
        thread::Builder::new()
            .name("native-fetch".into())
            .spawn(move || {
                if let Err(e) = fetch_loop(&fetch_request, &byte_tx, &fetch_state, poll) {
                    if !fetch_state.cancelled() {
                        tracing::warn!(url = %fetch_request.url, "stream fetch failed: {e:#}");
                        fetch_state.record_error(&format!("{e:#}"));
                    }
                }
            })
            .context("spawn fetch thread")?;

        let mut hint = Hint::new();
        hint.with_extension(if is_mp3_url(&request.url) { "mp3" } else { "ogg" });
        let source = ChannelSource {
            rx: byte_rx,
            buf: Vec::new(),
            pos: 0,
            consumed: 0,
            state: state.clone(),
            poll,
        };
        let decode_state = state.clone();
        let target = request.format;
        thread::Builder::new()
            .name("native-decode".into())
            .spawn(move || {
                let result = decode_loop(source, hint, target, &pcm_tx, &decode_state, poll);
                let exit = match result {
                    _ if decode_state.cancelled() => ProcessExit { code: None },
                    Ok(()) if !decode_state.has_errors() => ProcessExit { code: Some(0) },
                    Ok(()) => ProcessExit { code: Some(1) },
                    Err(e) => {
                        tracing::warn!("native decode failed: {e:#}");
                        decode_state.record_error(&format!("{e:#}"));
                        ProcessExit { code: Some(1) }
                    }
                };
                decode_state.finish(exit);
                // `pcm_tx` drops here, after the exit status is visible.
            })
            .context("spawn decode thread")?;

        Ok(DecodeProcess {
            reader: Box::new(PcmReader {
                rx: pcm_rx,
                pending: Vec::new(),
                pos: 0,
                poll,
            }),
            handle: Arc::new(NativeHandle { state }),
        })
    }
}

#[derive(Default)]
struct EngineState {
    cancel: AtomicBool,
    exit: Mutex<Option<ProcessExit>>,
    errors: Mutex<String>,
}

impl EngineState {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn record_error(&self, text: &str) {
        let mut g = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        if !g.is_empty() {
            g.push('\n');
        }
        g.push_str(text);
    }

    fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    fn finish(&self, exit: ProcessExit) {
        let mut g = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        if g.is_none() {
            *g = Some(exit);
        }
    }
}

struct NativeHandle {
    state: Arc<EngineState>,
}

impl ProcessHandle for NativeHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn exit(&self) -> Option<ProcessExit> {
        *self.state.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn terminate(&self, grace: Duration) {
        self.state.cancel.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + grace;
        while self.exit().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn kill(&self) {
        self.state.cancel.store(true, Ordering::Relaxed);
    }

    fn stderr_text(&self) -> String {
        self.state
            .errors
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

/// Send `item`, giving up when the engine is cancelled or the receiver is gone.
fn send_cancellable<T>(tx: &Sender<T>, mut item: T, state: &EngineState, poll: Duration) -> bool {
    loop {
        match tx.send_timeout(item, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if state.cancelled() {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn fetch_loop(
    request: &LaunchRequest,
    tx: &Sender<Vec<u8>>,
    state: &EngineState,
    poll: Duration,
) -> Result<()> {
    let url = resolve_stream_url(request)?;
    tracing::debug!(url = %url, "native fetch connecting");

    let mut builder = stream_agent(request.read_timeout)
        .get(&url)
        .header("User-Agent", &request.user_agent);
    if is_mp3_url(&url) {
        builder = builder
            .header("Accept", "audio/mpeg")
            .header("Icy-MetaData", "0");
    }
    let resp = builder.call().with_context(|| format!("GET {url}"))?;
    let (_, body) = resp.into_parts();
    let mut reader = body.into_reader();

    let mut buf = vec![0u8; FETCH_CHUNK_BYTES];
    loop {
        if state.cancelled() {
            return Ok(());
        }
        let n = reader.read(&mut buf).context("read stream body")?;
        if n == 0 {
            tracing::debug!(url = %url, "stream body ended");
            return Ok(());
        }
        if !send_cancellable(tx, buf[..n].to_vec(), state, poll) {
            return Ok(());
        }
    }
}

/// Agent for an endless body: every socket read gives up after `idle`
/// without data, however long the stream has been running.
fn stream_agent(idle: Duration) -> Agent {
    let config = Agent::config_builder()
        .timeout_connect(Some(idle))
        .timeout_recv_response(Some(idle))
        .build();
    let connector = DefaultConnector::new().chain(IdleTimeoutConnector { idle });
    Agent::with_parts(config, connector, DefaultResolver::default())
}

#[derive(Debug)]
struct IdleTimeoutConnector {
    idle: Duration,
}

impl Connector<Box<dyn Transport>> for IdleTimeoutConnector {
    type Out = IdleTimeoutTransport;

    fn connect(
        &self,
        _: &ConnectionDetails,
        chained: Option<Box<dyn Transport>>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        Ok(chained.map(|inner| IdleTimeoutTransport {
            inner,
            idle: self.idle,
        }))
    }
}

#[derive(Debug)]
struct IdleTimeoutTransport {
    inner: Box<dyn Transport>,
    idle: Duration,
}

impl Transport for IdleTimeoutTransport {
    fn buffers(&mut self) -> &mut dyn Buffers {
        self.inner.buffers()
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        self.inner.transmit_output(amount, timeout)
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        self.inner.await_input(cap_wait(timeout, self.idle))
    }

    fn is_open(&mut self) -> bool {
        self.inner.is_open()
    }

    fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }
}

fn cap_wait(timeout: NextTimeout, idle: Duration) -> NextTimeout {
    if *timeout.after > idle {
        NextTimeout {
            after: WaitDuration::Exact(idle),
            reason: timeout.reason,
        }
    } else {
        timeout
    }
}

/// Follow one level of `.m3u`/`.m3u8`/`.pls` indirection.
fn resolve_stream_url(request: &LaunchRequest) -> Result<String> {
    let Some(kind) = PlaylistKind::from_url(&request.url) else {
        return Ok(request.url.clone());
    };
    let mut resp = ureq::get(&request.url)
        .config()
        .timeout_global(Some(request.read_timeout))
        .build()
        .header("User-Agent", &request.user_agent)
        .call()
        .with_context(|| format!("GET playlist {}", request.url))?;
    let text = resp
        .body_mut()
        .read_to_string()
        .context("read playlist body")?;
    let url = parse_playlist(kind, &text)
        .ok_or_else(|| anyhow!("playlist {} has no stream entries", request.url))?;
    tracing::debug!(playlist = %request.url, url = %url, "playlist resolved");
    Ok(url)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlaylistKind {
    M3u,
    Pls,
}

impl PlaylistKind {
    fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or(&lower);
        if path.ends_with(".m3u") || path.ends_with(".m3u8") {
            Some(PlaylistKind::M3u)
        } else if path.ends_with(".pls") {
            Some(PlaylistKind::Pls)
        } else {
            None
        }
    }
}

fn parse_playlist(kind: PlaylistKind, text: &str) -> Option<String> {
    let entry = match kind {
        PlaylistKind::M3u => text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string),
        PlaylistKind::Pls => text.lines().map(str::trim).find_map(|line| {
            let (key, value) = line.split_once('=')?;
            key.trim()
                .to_ascii_lowercase()
                .starts_with("file")
                .then(|| value.trim().to_string())
        }),
    }?;
    let url = sanitize_url(&entry);
    (url.starts_with("http://") || url.starts_with("https://")).then_some(url)
}

/// Non-seekable Symphonia source fed by the fetch thread.
struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
    consumed: u64,
    state: Arc<EngineState>,
    poll: Duration,
}

impl Read for ChannelSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            if self.state.cancelled() {
                return Err(io::Error::other("decode cancelled"));
            }
            match self.rx.recv_timeout(self.poll) {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        self.consumed += n as u64;
        Ok(n)
    }
}

impl Seek for ChannelSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.consumed),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "live stream is not seekable",
            )),
        }
    }
}

impl MediaSource for ChannelSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// PCM byte stream handed to the worker.
///
/// Returns `Ok(0)` when nothing arrived within `poll`; callers check the
/// handle to tell a gap from the end of the stream.
struct PcmReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    poll: Duration,
}

impl Read for PcmReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv_timeout(self.poll) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(0);
                }
            }
        }
        let n = out.len().min(self.pending.len() - self.pos);
        out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn make_decoder(format: &dyn FormatReader) -> Result<(u32, Box<dyn Decoder>)> {
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("create codec")?;
    Ok((track.id, decoder))
}

fn decode_loop(
    source: ChannelSource,
    hint: Hint,
    target: PcmFormat,
    tx: &Sender<Vec<u8>>,
    state: &EngineState,
    poll: Duration,
) -> Result<()> {
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let detected = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("detect stream format")?;
    let mut format = detected.format;
    let (mut track_id, mut decoder) = make_decoder(format.as_ref())?;

    let mut converter: Option<RateConverter> = None;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut emit = |samples: &[f32]| -> bool {
        send_cancellable(tx, f32_to_s16le(samples), state, poll)
    };

    loop {
        if state.cancelled() {
            return Ok(());
        }
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::ResetRequired) => {
                // Chained Ogg streams start a new logical bitstream per track.
                (track_id, decoder) = make_decoder(format.as_ref())?;
                continue;
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) if state.cancelled() => {
                tracing::debug!("decode interrupted: {e}");
                return Ok(());
            }
            Err(e) => return Err(e).context("read packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e).context("decode packet"),
        };
        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();
        if sample_buf.as_ref().is_none_or(|b| b.capacity() < needed) {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        let src_channels = spec.channels.count();
        let remixed = remix_channels(buf.samples(), src_channels, target.channels as usize);

        let needs_new = converter
            .as_ref()
            .map(|c| c.src_rate != spec.rate)
            .unwrap_or(true);
        if needs_new {
            if let Some(mut old) = converter.take() {
                old.flush(&mut emit)?;
            }
            tracing::debug!(
                src_rate_hz = spec.rate,
                dst_rate_hz = target.sample_rate,
                src_channels,
                "native decode format"
            );
            converter = Some(RateConverter::new(
                spec.rate,
                target.sample_rate,
                target.channels as usize,
            )?);
        }
        if let Some(conv) = converter.as_mut() {
            if !conv.process(&remixed, &mut emit)? {
                return Ok(());
            }
        }
    }

    if let Some(mut conv) = converter.take() {
        conv.flush(&mut emit)?;
    }
    Ok(())
}

/// Map interleaved samples from `src` to `dst` channels.
///
/// Mono is duplicated, stereo is averaged down to mono, and other layouts
/// keep the first channels (repeating the last one when upmixing).
fn remix_channels(samples: &[f32], src: usize, dst: usize) -> Vec<f32> {
    if src == dst || src == 0 || dst == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / src;
    let mut out = Vec::with_capacity(frames * dst);
    for frame in samples.chunks_exact(src) {
        if dst == 1 {
            out.push(frame.iter().sum::<f32>() / src as f32);
        } else {
            for ch in 0..dst {
                out.push(frame[ch.min(src - 1)]);
            }
        }
    }
    out
}

fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Streaming sample-rate converter; a pass-through when rates match.
struct RateConverter {
    src_rate: u32,
    channels: usize,
    resampler: Option<Box<dyn Resampler<f32>>>,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl RateConverter {
    fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Result<Self> {
        let channels = channels.max(1);
        if src_rate == dst_rate || src_rate == 0 {
            return Ok(Self {
                src_rate,
                channels,
                resampler: None,
                pending: Vec::new(),
                out: Vec::new(),
            });
        }

        let f_ratio = dst_rate as f64 / src_rate as f64;
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            RESAMPLE_CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;

        let out_frames = (RESAMPLE_CHUNK_FRAMES as f64 * f_ratio * 1.1).ceil() as usize + 64;
        Ok(Self {
            src_rate,
            channels,
            resampler: Some(Box::new(resampler)),
            pending: Vec::with_capacity(RESAMPLE_CHUNK_FRAMES * channels * 2),
            out: vec![0.0; out_frames * channels],
        })
    }

    /// Convert `input`; returns `false` once `emit` refuses more data.
    fn process(&mut self, input: &[f32], emit: &mut dyn FnMut(&[f32]) -> bool) -> Result<bool> {
        if self.resampler.is_none() {
            return Ok(input.is_empty() || emit(input));
        }
        self.pending.extend_from_slice(input);
        let chunk_samples = RESAMPLE_CHUNK_FRAMES * self.channels;
        while self.pending.len() >= chunk_samples {
            let produced = self.run(chunk_samples, None)?;
            self.pending.drain(..chunk_samples);
            if produced > 0 && !emit(&self.out[..produced]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Push out any buffered tail.
    fn flush(&mut self, emit: &mut dyn FnMut(&[f32]) -> bool) -> Result<()> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Ok(());
        }
        let tail_frames = self.pending.len() / self.channels;
        let chunk_samples = RESAMPLE_CHUNK_FRAMES * self.channels;
        self.pending.resize(chunk_samples, 0.0);
        let produced = self.run(chunk_samples, Some(tail_frames))?;
        self.pending.clear();
        if produced > 0 {
            emit(&self.out[..produced]);
        }
        Ok(())
    }

    fn run(&mut self, input_samples: usize, partial_len: Option<usize>) -> Result<usize> {
        let channels = self.channels;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(0);
        };
        let input = InterleavedSlice::new(&self.pending[..input_samples], channels, input_samples / channels)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let out_capacity_frames = self.out.len() / channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out, channels, out_capacity_frames)
            .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;
        Ok(nbr_out * channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn m3u_takes_first_non_comment_line() {
        let text = "#EXTM3U\n\n#EXTINF:-1,LISTEN.moe\nhttps://listen.moe/stream\nhttps://other\n";
        assert_eq!(
            parse_playlist(PlaylistKind::M3u, text),
            Some("https://listen.moe/stream".to_string())
        );
    }

    #[test]
    fn pls_takes_first_file_entry() {
        let text = "[playlist]\nNumberOfEntries=1\nFile1=http://listen.moe:9999/stream\nTitle1=x\n";
        assert_eq!(
            parse_playlist(PlaylistKind::Pls, text),
            Some("http://listen.moe:9999/stream".to_string())
        );
    }

    #[test]
    fn playlist_without_urls_is_rejected() {
        assert_eq!(parse_playlist(PlaylistKind::M3u, "#EXTM3U\n# nothing\n"), None);
        assert_eq!(parse_playlist(PlaylistKind::M3u, "local/file.ogg\n"), None);
    }

    #[test]
    fn playlist_kind_from_url() {
        assert_eq!(
            PlaylistKind::from_url("https://listen.moe/stream.m3u"),
            Some(PlaylistKind::M3u)
        );
        assert_eq!(
            PlaylistKind::from_url("https://x/radio.PLS?token=1"),
            Some(PlaylistKind::Pls)
        );
        assert_eq!(PlaylistKind::from_url("https://listen.moe/stream"), None);
    }

    #[test]
    fn remix_mono_to_stereo_duplicates() {
        assert_eq!(remix_channels(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn remix_stereo_to_mono_averages() {
        assert_eq!(remix_channels(&[0.25, 0.75], 2, 1), vec![0.5]);
    }

    #[test]
    fn remix_surround_to_stereo_keeps_front() {
        assert_eq!(
            remix_channels(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 6, 2),
            vec![0.1, 0.2]
        );
    }

    #[test]
    fn f32_to_s16le_saturates() {
        let bytes = f32_to_s16le(&[0.0, 2.0, -2.0]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![0, i16::MAX, -i16::MAX]);
    }

    #[test]
    fn matching_rates_pass_through() {
        let mut conv = RateConverter::new(44_100, 44_100, 2).unwrap();
        let mut got = Vec::new();
        let mut emit = |s: &[f32]| {
            got.extend_from_slice(s);
            true
        };
        assert!(conv.process(&[0.5, -0.5], &mut emit).unwrap());
        assert_eq!(got, vec![0.5, -0.5]);
    }

    #[test]
    fn resampling_produces_roughly_scaled_frame_count() {
        let mut conv = RateConverter::new(48_000, 44_100, 2).unwrap();
        let input = vec![0.0f32; 48_000 * 2];
        let mut frames = 0usize;
        let mut emit = |s: &[f32]| {
            frames += s.len() / 2;
            true
        };
        conv.process(&input, &mut emit).unwrap();
        conv.flush(&mut emit).unwrap();
        assert!(frames > 40_000 && frames < 46_000, "frames = {frames}");
    }

    #[test]
    fn pcm_reader_reports_gap_as_empty_read() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut reader = PcmReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            poll: Duration::from_millis(5),
        };
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        tx.send(vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[5, 6]);
    }

    #[test]
    fn channel_source_ends_when_fetch_disconnects() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let mut source = ChannelSource {
            rx,
            buf: Vec::new(),
            pos: 0,
            consumed: 0,
            state: Arc::new(EngineState::default()),
            poll: Duration::from_millis(5),
        };
        tx.send(vec![9, 8]).unwrap();
        drop(tx);
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(source.seek(SeekFrom::Current(0)).unwrap(), 2);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert!(source.seek(SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn cancelled_handle_reports_terminated_exit() {
        let state = Arc::new(EngineState::default());
        let handle = NativeHandle {
            state: state.clone(),
        };
        assert!(handle.is_running());
        handle.kill();
        assert!(state.cancelled());
        state.finish(ProcessExit { code: None });
        assert!(!handle.is_running());
        assert_eq!(handle.exit(), Some(ProcessExit { code: None }));
    }

    fn serve_once(respond: impl FnOnce(std::net::TcpStream) + Send + 'static) -> String {
        use std::io::{BufRead, BufReader};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut lines = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while lines.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            respond(stream);
        });
        format!("http://127.0.0.1:{port}/stream")
    }

    fn stream_request(url: String, read_timeout: Duration) -> LaunchRequest {
        LaunchRequest {
            url,
            format: PcmFormat::default(),
            user_agent: "kiku-test".into(),
            read_timeout,
            reconnect_delay_max: Duration::from_secs(1),
        }
    }

    const STREAM_HEAD: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: audio/ogg\r\nConnection: close\r\n\r\n";

    #[test]
    fn stalled_stream_body_times_out() {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let url = serve_once(move |mut stream| {
            use std::io::Write;
            stream.write_all(STREAM_HEAD).unwrap();
            stream.write_all(b"OggS").unwrap();
            stream.flush().unwrap();
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
        });
        let request = stream_request(url, Duration::from_millis(200));
        let (tx, rx) = crossbeam_channel::bounded(8);
        let state = EngineState::default();
        let started = Instant::now();
        let result = fetch_loop(&request, &tx, &state, Duration::from_millis(10));
        drop(done_tx);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
        let got: Vec<u8> = rx.try_iter().flatten().collect();
        assert_eq!(got, b"OggS");
    }

    #[test]
    fn steady_stream_outlives_read_timeout() {
        let url = serve_once(|mut stream| {
            use std::io::Write;
            stream.write_all(STREAM_HEAD).unwrap();
            for _ in 0..8 {
                stream.write_all(b"data").unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(50));
            }
        });
        let request = stream_request(url, Duration::from_millis(150));
        let (tx, rx) = crossbeam_channel::bounded(64);
        let state = EngineState::default();
        fetch_loop(&request, &tx, &state, Duration::from_millis(10)).unwrap();
        let received: usize = rx.try_iter().map(|c| c.len()).sum();
        assert_eq!(received, 32);
    }

    #[test]
    fn wait_is_capped_at_idle_limit() {
        let idle = Duration::from_millis(200);
        let endless = NextTimeout {
            after: WaitDuration::NotHappening,
            reason: ureq::Timeout::RecvBody,
        };
        assert_eq!(*cap_wait(endless, idle).after, idle);
        assert_eq!(cap_wait(endless, idle).reason, ureq::Timeout::RecvBody);

        let sooner = NextTimeout {
            after: WaitDuration::from_millis(50),
            reason: ureq::Timeout::RecvResponse,
        };
        assert_eq!(cap_wait(sooner, idle), sooner);
    }
}
