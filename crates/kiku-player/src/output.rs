//! Audio output stage.
//!
//! [`AudioOutput`] is what the worker writes PCM to; [`OutputOpener`] creates
//! one per session. The CPAL implementation feeds a bounded [`SharedAudio`]
//! queue drained by the real-time callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use kiku_types::PcmFormat;

use crate::device;
use crate::queue::{SharedAudio, calc_max_buffered_samples};

/// An open output stream owned by the worker thread.
pub trait AudioOutput {
    /// Format the output accepts (the device rate may differ from the request).
    fn format(&self) -> PcmFormat;

    /// Write interleaved samples, blocking on back-pressure.
    ///
    /// Returns early, dropping the rest, once `interrupted()` turns true.
    fn write(&mut self, samples: &[i16], interrupted: &dyn Fn() -> bool) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Start or stop the device stream without closing it.
    fn set_active(&mut self, active: bool) -> Result<()>;

    /// Release the device. Idempotent.
    fn close(&mut self);

    /// Handle that silences this output from another thread.
    fn abort_handle(&self) -> Arc<dyn OutputAbort>;
}

/// Cross-thread teardown for an output whose owning thread may be stuck.
pub trait OutputAbort: Send + Sync {
    /// Drop buffered audio, render silence from now on, and fail pending
    /// and future writes. Idempotent.
    fn abort(&self);
}

/// Factory for [`AudioOutput`]s, shared between controller and workers.
pub trait OutputOpener: Send + Sync {
    /// Open an output on device `index` (`None` = default).
    ///
    /// While `paused` is set the output must render silence.
    fn open(
        &self,
        index: Option<usize>,
        format: PcmFormat,
        paused: Arc<AtomicBool>,
    ) -> Result<Box<dyn AudioOutput>>;
}

/// Open on the configured device, retrying once on the default device.
pub fn open_with_fallback(
    opener: &dyn OutputOpener,
    index: Option<usize>,
    format: PcmFormat,
    paused: Arc<AtomicBool>,
) -> Result<Box<dyn AudioOutput>> {
    match opener.open(index, format, paused.clone()) {
        Ok(out) => Ok(out),
        Err(e) if index.is_some() => {
            tracing::warn!(index = ?index, "output device open failed, trying default: {e:#}");
            opener
                .open(None, format, paused)
                .context("open default output device")
        }
        Err(e) => Err(e),
    }
}

/// Opens CPAL output streams on the default host.
#[derive(Clone, Debug)]
pub struct CpalOpener {
    /// Target buffering between the worker and the callback.
    pub buffer_seconds: f32,
}

impl Default for CpalOpener {
    fn default() -> Self {
        Self {
            buffer_seconds: 0.5,
        }
    }
}

impl OutputOpener for CpalOpener {
    fn open(
        &self,
        index: Option<usize>,
        format: PcmFormat,
        paused: Arc<AtomicBool>,
    ) -> Result<Box<dyn AudioOutput>> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, index)?;
        let config = device::pick_output_config(&device, format.sample_rate, format.channels)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }

        let opened = PcmFormat {
            sample_rate: stream_config.sample_rate,
            channels: format.channels,
        };
        let queue = Arc::new(SharedAudio::new(
            opened.channels as usize,
            calc_max_buffered_samples(
                opened.sample_rate,
                opened.channels as usize,
                self.buffer_seconds,
            ),
        ));

        let silenced = Arc::new(AtomicBool::new(false));
        let stream = build_output_stream(
            &device,
            &stream_config,
            config.sample_format(),
            &queue,
            Gate {
                paused: paused.clone(),
                silenced: silenced.clone(),
            },
        )?;
        if !paused.load(Ordering::Relaxed) {
            stream.play().context("start output stream")?;
        }

        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = opened.sample_rate,
            device_channels = stream_config.channels,
            sample_format = ?config.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            "output opened"
        );

        Ok(Box::new(CpalOutput {
            stream: Some(stream),
            queue,
            silenced,
            active: true,
            format: opened,
            scratch: Vec::new(),
        }))
    }
}

struct CpalOutput {
    stream: Option<cpal::Stream>,
    queue: Arc<SharedAudio>,
    silenced: Arc<AtomicBool>,
    active: bool,
    format: PcmFormat,
    scratch: Vec<f32>,
}

struct CpalAbort {
    queue: Arc<SharedAudio>,
    silenced: Arc<AtomicBool>,
}

impl OutputAbort for CpalAbort {
    fn abort(&self) {
        self.silenced.store(true, Ordering::Relaxed);
        self.queue.close();
    }
}

impl AudioOutput for CpalOutput {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn write(&mut self, samples: &[i16], interrupted: &dyn Fn() -> bool) -> Result<()> {
        if self.stream.is_none() || self.queue.is_done() {
            return Err(anyhow!("output closed"));
        }
        self.scratch.clear();
        self.scratch
            .extend(samples.iter().map(|s| <f32 as cpal::Sample>::from_sample(*s)));
        self.queue
            .push_interleaved_interruptible(&self.scratch, interrupted);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) -> Result<()> {
        if self.active == active {
            return Ok(());
        }
        let stream = self.stream.as_ref().ok_or_else(|| anyhow!("output closed"))?;
        if active {
            stream.play().context("resume output stream")?;
        } else if let Err(e) = stream.pause() {
            // Some hosts cannot pause; the callback already renders silence.
            tracing::debug!("output stream pause unsupported: {e}");
        }
        self.active = active;
        Ok(())
    }

    fn close(&mut self) {
        self.queue.close();
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
            tracing::debug!("output closed");
        }
        self.active = false;
    }

    fn abort_handle(&self) -> Arc<dyn OutputAbort> {
        Arc::new(CpalAbort {
            queue: self.queue.clone(),
            silenced: self.silenced.clone(),
        })
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Flags that make the callback render silence instead of draining.
struct Gate {
    paused: Arc<AtomicBool>,
    silenced: Arc<AtomicBool>,
}

impl Gate {
    fn closed(&self) -> bool {
        self.paused.load(Ordering::Relaxed) || self.silenced.load(Ordering::Relaxed)
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
    gate: Gate,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, gate),
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, gate),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, gate),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, gate),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Stream whose callback drains `queue` without blocking.
///
/// Underruns, pause and abort are rendered as silence; a gated stream does
/// not drain the queue.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
    gate: Gate,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = (config.channels as usize).max(1);
    let refill_max_frames = 2048;

    let state = Mutex::new(CallbackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    });
    let queue_cb = queue.clone();
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if gate.closed() {
                data.fill(silence);
                return;
            }

            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            let frames = data.len() / channels_out;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    match queue_cb.pop_nonblocking(refill_max_frames) {
                        Some(v) => st.src = v,
                        None => {
                            data[frame * channels_out..].fill(silence);
                            return;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Samples fetched from the queue but not yet rendered.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Next output sample for `dst_ch`, mapping channel layouts.
///
/// Mono is duplicated to stereo, stereo is averaged to mono, and other
/// layouts clamp to the last available source channel. `pos` advances after
/// the last destination channel.
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(src_channels: usize, src: Vec<f32>) -> CallbackState {
        CallbackState {
            pos: 0,
            src_channels,
            src,
        }
    }

    fn render(st: &mut CallbackState, dst_channels: usize, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for _ in 0..frames {
            for ch in 0..dst_channels {
                out.push(next_sample_mapped(st, dst_channels, ch));
            }
        }
        out
    }

    #[test]
    fn stereo_passes_through() {
        let mut st = state(2, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(render(&mut st, 2, 2), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let mut st = state(2, vec![0.25, 0.75, -1.0, 1.0]);
        assert_eq!(render(&mut st, 1, 2), vec![0.5, 0.0]);
    }

    #[test]
    fn stereo_to_surround_clamps_channels() {
        let mut st = state(2, vec![0.1, 0.2]);
        assert_eq!(render(&mut st, 4, 1), vec![0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn abort_silences_and_closes_queue() {
        let queue = Arc::new(SharedAudio::new(2, 8));
        let silenced = Arc::new(AtomicBool::new(false));
        let gate = Gate {
            paused: Arc::new(AtomicBool::new(false)),
            silenced: silenced.clone(),
        };
        queue.push_interleaved_interruptible(&[0.5, 0.5], &|| false);
        assert!(!gate.closed());

        let abort = CpalAbort {
            queue: queue.clone(),
            silenced,
        };
        abort.abort();
        abort.abort();
        assert!(gate.closed());
        assert!(queue.is_done());
        assert!(queue.pop_nonblocking(1).is_none());
    }

    #[test]
    fn pause_closes_the_gate() {
        let paused = Arc::new(AtomicBool::new(false));
        let gate = Gate {
            paused: paused.clone(),
            silenced: Arc::new(AtomicBool::new(false)),
        };
        paused.store(true, Ordering::Relaxed);
        assert!(gate.closed());
    }

    #[test]
    fn exhausted_buffer_yields_silence() {
        let mut st = state(2, vec![]);
        assert_eq!(render(&mut st, 2, 1), vec![0.0, 0.0]);
    }

    struct FailingOpener {
        fail_index: bool,
        calls: Mutex<Vec<Option<usize>>>,
    }

    struct NullOutput(PcmFormat);

    impl AudioOutput for NullOutput {
        fn format(&self) -> PcmFormat {
            self.0
        }
        fn write(&mut self, _samples: &[i16], _interrupted: &dyn Fn() -> bool) -> Result<()> {
            Ok(())
        }
        fn is_active(&self) -> bool {
            true
        }
        fn set_active(&mut self, _active: bool) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn abort_handle(&self) -> Arc<dyn OutputAbort> {
            Arc::new(NoAbort)
        }
    }

    struct NoAbort;

    impl OutputAbort for NoAbort {
        fn abort(&self) {}
    }

    impl OutputOpener for FailingOpener {
        fn open(
            &self,
            index: Option<usize>,
            format: PcmFormat,
            _paused: Arc<AtomicBool>,
        ) -> Result<Box<dyn AudioOutput>> {
            self.calls.lock().unwrap().push(index);
            if index.is_some() && self.fail_index {
                return Err(anyhow!("device gone"));
            }
            Ok(Box::new(NullOutput(format)))
        }
    }

    #[test]
    fn open_with_fallback_retries_default_once() {
        let opener = FailingOpener {
            fail_index: true,
            calls: Mutex::new(Vec::new()),
        };
        let out = open_with_fallback(
            &opener,
            Some(3),
            PcmFormat::default(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(out.is_ok());
        assert_eq!(*opener.calls.lock().unwrap(), vec![Some(3), None]);
    }

    #[test]
    fn open_with_fallback_does_not_retry_default() {
        struct AlwaysFail;
        impl OutputOpener for AlwaysFail {
            fn open(
                &self,
                _index: Option<usize>,
                _format: PcmFormat,
                _paused: Arc<AtomicBool>,
            ) -> Result<Box<dyn AudioOutput>> {
                Err(anyhow!("no audio"))
            }
        }
        let out = open_with_fallback(
            &AlwaysFail,
            None,
            PcmFormat::default(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(out.is_err());
    }
}
