//! mm:ss text for the now-playing line.

use kiku_types::NowPlayingTrack;
use time::OffsetDateTime;

/// Tolerance past the track's end before the start time is treated as clock skew.
pub const DEFAULT_SLACK_SECS: u32 = 5;

pub const NO_DURATION: &str = "--:--";

pub fn format_mmss(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Seconds left in the track, floored at zero.
pub fn compute_remaining(
    duration_seconds: Option<u32>,
    start_epoch: Option<f64>,
    now: f64,
) -> Option<u32> {
    let duration = duration_seconds?;
    let elapsed = (now - start_epoch?).max(0.0) as u64;
    Some(u64::from(duration).saturating_sub(elapsed) as u32)
}

/// `(text, is_remaining)` for a track.
///
/// Remaining time when `now` falls within `[start, start + duration + slack]`,
/// otherwise the total duration, or `--:--` when the duration is unknown.
pub fn display_mmss(
    duration_seconds: Option<u32>,
    start_epoch: Option<f64>,
    now: f64,
    slack_secs: u32,
) -> (String, bool) {
    if let (Some(duration), Some(start)) = (duration_seconds, start_epoch) {
        let elapsed = now - start;
        let limit = f64::from(duration) + f64::from(slack_secs);
        if (0.0..=limit).contains(&elapsed) {
            if let Some(left) = compute_remaining(duration_seconds, start_epoch, now) {
                return (format_mmss(i64::from(left)), true);
            }
        }
    }
    match duration_seconds {
        Some(d) => (format_mmss(i64::from(d)), false),
        None => (NO_DURATION.to_string(), false),
    }
}

pub fn now_epoch() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1_000_000_000.0
}

/// One-line summary, e.g. `Title - Artist [03:12 left]`.
pub fn now_playing_line(track: &NowPlayingTrack, now: f64) -> String {
    let mut line = track.title.clone();
    if !track.artist.is_empty() {
        line.push_str(" - ");
        line.push_str(&track.artist);
    }
    let (mmss, remaining) = display_mmss(
        track.duration_seconds,
        track.start_epoch,
        now,
        DEFAULT_SLACK_SECS,
    );
    if remaining {
        line.push_str(&format!(" [{mmss} left]"));
    } else if track.duration_seconds.is_some() {
        line.push_str(&format!(" [{mmss}]"));
    }
    line
}
