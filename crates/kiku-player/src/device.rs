//! Output device discovery and selection.
//!
//! Devices are addressed by their index in host enumeration order, which is
//! what settings files persist.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

/// Frames per device callback requested when the host lets us choose.
pub const PREFERRED_BUFFER_FRAMES: u32 = 1024;

/// Pick an output device by enumeration index, or the host default.
pub fn pick_device(host: &cpal::Host, index: Option<usize>) -> Result<cpal::Device> {
    match index {
        Some(idx) => host
            .output_devices()
            .context("No output devices")?
            .nth(idx)
            .ok_or_else(|| anyhow!("No output device at index {idx}")),
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device")),
    }
}

/// Choose the supported output config closest to `target_rate`.
///
/// Ranges with exactly `channels` channels win; then a rate at or below the
/// target; then the higher rate; then the sample format rank.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query supported output configs")?
        .collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if sample_format_rank(range.sample_format()) >= UNSUPPORTED_RANK {
            continue;
        }
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            channels_match: range.channels() == channels,
            below: rate <= target_rate,
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((current, _)) => candidate.is_better_than(current),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed buffer size near [`PREFERRED_BUFFER_FRAMES`] when the device reports a range.
///
/// Returns `None` so CPAL uses the device default when the size is unknown.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => Some(cpal::BufferSize::Fixed(
            PREFERRED_BUFFER_FRAMES.clamp(*min, (*max).max(*min)),
        )),
        cpal::SupportedBufferSize::Unknown => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    channels_match: bool,
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.channels_match != other.channels_match {
            self.channels_match
        } else if self.below != other.below {
            self.below
        } else if self.rate != other.rate {
            // Below the target the highest rate wins; above it the lowest.
            if self.below {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            }
        } else {
            self.format_rank < other.format_rank
        }
    }
}

const UNSUPPORTED_RANK: u8 = 10;

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => UNSUPPORTED_RANK,
    }
}

/// Output device metadata for listings and settings UIs.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub min_rate: Option<u32>,
    pub max_rate: Option<u32>,
}

/// Enumerate output devices with their selection index.
pub fn list_device_infos(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.to_string());

    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for (index, d) in devices.enumerate() {
        let name = match d.description() {
            Ok(desc) => desc.to_string(),
            Err(e) => {
                tracing::warn!(index, "device description unavailable: {e}");
                format!("device #{index}")
            }
        };
        let (min_rate, max_rate) = match d.supported_output_configs() {
            Ok(ranges) => ranges.fold((None, None), |(lo, hi), r| {
                let lo = Some(lo.map_or(r.min_sample_rate(), |v: u32| v.min(r.min_sample_rate())));
                let hi = Some(hi.map_or(r.max_sample_rate(), |v: u32| v.max(r.max_sample_rate())));
                (lo, hi)
            }),
            Err(_) => (None, None),
        };
        out.push(DeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(channels_match: bool, below: bool, rate: u32, format_rank: u8) -> Candidate {
        Candidate {
            channels_match,
            below,
            rate,
            format_rank,
        }
    }

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        assert_eq!(pick_rate_for_range(8_000, 96_000, 44_100), 44_100);
    }

    #[test]
    fn pick_rate_for_range_clamps_below_min() {
        assert_eq!(pick_rate_for_range(48_000, 96_000, 44_100), 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps_above_max() {
        assert_eq!(pick_rate_for_range(8_000, 32_000, 44_100), 32_000);
    }

    #[test]
    fn pick_rate_for_range_tolerates_inverted_bounds() {
        assert_eq!(pick_rate_for_range(48_000, 44_100, 44_100), 48_000);
    }

    #[test]
    fn matching_channels_beat_everything() {
        assert!(cand(true, false, 96_000, 3).is_better_than(&cand(false, true, 44_100, 0)));
    }

    #[test]
    fn below_target_beats_above() {
        assert!(cand(true, true, 32_000, 2).is_better_than(&cand(true, false, 48_000, 0)));
    }

    #[test]
    fn above_target_prefers_closest_rate() {
        assert!(cand(true, false, 48_000, 0).is_better_than(&cand(true, false, 96_000, 0)));
    }

    #[test]
    fn same_rate_prefers_i16() {
        assert_eq!(sample_format_rank(cpal::SampleFormat::I16), 0);
        assert!(cand(true, true, 44_100, 0).is_better_than(&cand(true, true, 44_100, 1)));
    }
}
