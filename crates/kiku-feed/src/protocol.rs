//! LISTEN.moe gateway messages.
//!
//! Parsing is lenient: anything malformed is dropped or defaulted, never an error.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use kiku_types::NowPlayingTrack;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const OP_HELLO: u64 = 0;
pub const OP_EVENT: u64 = 1;
pub const OP_HEARTBEAT: u64 = 9;

pub const TRACK_EVENTS: [&str; 2] = ["TRACK_UPDATE", "TRACK_UPDATE_REQUEST"];

const UNKNOWN_TITLE: &str = "Unknown";

/// Predicate over a track event's `d` object; `false` drops the update.
pub type TrackFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A gateway message the client acts on.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayMessage {
    /// op 0: start heartbeating at this interval.
    Hello { heartbeat: Duration },
    /// op 1 with a track event type; carries the raw `d` payload.
    Track(Value),
}

/// Client heartbeat frame, `{"op":9}`.
pub fn heartbeat_payload() -> String {
    serde_json::json!({ "op": OP_HEARTBEAT }).to_string()
}

/// Parse one text frame. Unknown opcodes and bad JSON yield `None`.
pub fn parse_message(text: &str) -> Option<GatewayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let op = value.get("op")?.as_u64()?;
    match op {
        OP_HELLO => {
            let ms = value.get("d")?.get("heartbeat")?.as_u64()?;
            (ms > 0).then(|| GatewayMessage::Hello {
                heartbeat: Duration::from_millis(ms),
            })
        }
        OP_EVENT => {
            let t = value.get("t")?.as_str()?;
            if !TRACK_EVENTS.contains(&t) {
                return None;
            }
            let d = match value.get("d") {
                Some(d) if d.is_object() => d.clone(),
                _ => Value::Object(Default::default()),
            };
            Some(GatewayMessage::Track(d))
        }
        _ => None,
    }
}

/// Run `filter` over a track payload. A panicking filter lets the update through.
pub fn passes_filter(filter: Option<&TrackFilter>, d: &Value) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    match catch_unwind(AssertUnwindSafe(|| filter(d))) {
        Ok(keep) => keep,
        Err(_) => {
            tracing::warn!("track filter panicked; keeping update");
            true
        }
    }
}

/// Filter keeping only updates that carry a non-null `startTime`.
pub fn timed_tracks_only() -> TrackFilter {
    Arc::new(|d: &Value| d.get("startTime").is_some_and(|v| !v.is_null()))
}

/// Build a track from a track event's `d` payload.
pub fn parse_track(d: &Value) -> NowPlayingTrack {
    let song = d.get("song").filter(|s| s.is_object());

    let title = song
        .and_then(|s| s.get("title"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNKNOWN_TITLE)
        .to_string();

    let artist = song
        .and_then(|s| s.get("artists"))
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let duration_seconds = parse_duration(song.and_then(|s| s.get("duration")));
    let start_epoch = d
        .get("startTime")
        .and_then(Value::as_str)
        .and_then(parse_start_time);

    NowPlayingTrack {
        title,
        artist,
        duration_seconds,
        start_epoch,
    }
}

/// Seconds from an integer, a float (truncated) or a numeric string.
pub fn parse_duration(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                return u32::try_from(secs).ok();
            }
            let f = n.as_f64()?;
            (f.is_finite() && f >= 0.0 && f < u32::MAX as f64).then(|| f.trunc() as u32)
        }
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// ISO-8601 timestamp to UTC epoch seconds. A missing offset means UTC.
pub fn parse_start_time(text: &str) -> Option<f64> {
    let text = text.trim();
    let parsed = OffsetDateTime::parse(text, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(&format!("{text}Z"), &Rfc3339))
        .ok()?;
    Some(parsed.unix_timestamp() as f64 + f64::from(parsed.nanosecond()) / 1_000_000_000.0)
}
