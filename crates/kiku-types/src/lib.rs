use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle event emitted by the playback worker and controller.
///
/// The wire vocabulary (see [`PlayerEvent::code`]) is stable and shared with
/// log lines and any UI string mapping.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", content = "value", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// A session was started and the output is being opened.
    Opening,
    /// A candidate URL is being connected; percentage when known.
    Buffering(Option<u8>),
    /// Audio is flowing (first chunk of a session, or resume from pause).
    Playing,
    /// Output paused while the decoder keeps running.
    Paused,
    /// Session ended by an explicit stop.
    Stopped,
    /// Stream ended on its own after producing audio.
    Ended,
    /// Session failed (decoder, stall, or output device).
    Error,
    /// The playback engine could not be initialised at all.
    #[serde(rename = "libvlc_init_failed")]
    EngineInitFailed,
}

impl PlayerEvent {
    /// Stable lifecycle code for this event.
    pub fn code(&self) -> &'static str {
        match self {
            PlayerEvent::Opening => "opening",
            PlayerEvent::Buffering(_) => "buffering",
            PlayerEvent::Playing => "playing",
            PlayerEvent::Paused => "paused",
            PlayerEvent::Stopped => "stopped",
            PlayerEvent::Ended => "ended",
            PlayerEvent::Error => "error",
            PlayerEvent::EngineInitFailed => "libvlc_init_failed",
        }
    }

    /// Optional integer payload (buffering percentage, 0..=100).
    pub fn value(&self) -> Option<u8> {
        match self {
            PlayerEvent::Buffering(pct) => pct.map(|p| p.min(100)),
            _ => None,
        }
    }

    /// `true` for the events that close a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlayerEvent::Stopped | PlayerEvent::Ended | PlayerEvent::Error
        )
    }
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{} ({v}%)", self.code()),
            None => f.write_str(self.code()),
        }
    }
}

/// Reason why a playback session finished.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Stream produced audio and then ended on its own.
    Ended,
    /// Decoder, stall, transport, or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

impl PlaybackEndReason {
    /// Terminal lifecycle event for this reason.
    pub fn event(self) -> PlayerEvent {
        match self {
            PlaybackEndReason::Ended => PlayerEvent::Ended,
            PlaybackEndReason::Error => PlayerEvent::Error,
            PlaybackEndReason::Stopped => PlayerEvent::Stopped,
        }
    }
}

/// Raw PCM layout produced by decoders and consumed by the output.
///
/// Samples are always signed 16-bit little-endian, interleaved.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

/// Point-in-time view of a playback controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    /// URL bound to the active session, if any.
    pub current_url: Option<String>,
    /// `true` while a worker session is alive.
    pub playing: bool,
    /// `true` when output is paused (decoder still running).
    pub paused: bool,
    /// User-facing volume in percent.
    pub volume: u8,
    /// Mute flag.
    pub muted: bool,
    /// Whether the decode backend is available.
    pub ready: bool,
    /// Last lifecycle code observed.
    pub last_event: Option<PlayerEvent>,
    /// Outcome of the last finished session.
    pub end_reason: Option<PlaybackEndReason>,
}

/// Track metadata pushed by the now-playing gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NowPlayingTrack {
    pub title: String,
    /// First credited artist, empty when unknown.
    pub artist: String,
    pub duration_seconds: Option<u32>,
    /// UTC seconds since the epoch when the track began.
    pub start_epoch: Option<f64>,
}

/// Radio channel served by LISTEN.moe.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Channel {
    #[default]
    #[serde(rename = "J-POP", alias = "jpop")]
    Jpop,
    #[serde(rename = "K-POP", alias = "kpop")]
    Kpop,
}

impl Channel {
    pub fn label(self) -> &'static str {
        match self {
            Channel::Jpop => "J-POP",
            Channel::Kpop => "K-POP",
        }
    }

    /// Stream URL for this channel in the requested format.
    pub fn stream_url(self, format: StreamFormat) -> &'static str {
        match (self, format) {
            (Channel::Jpop, StreamFormat::Vorbis) => "https://listen.moe/stream",
            (Channel::Jpop, StreamFormat::Mp3) => "https://listen.moe/stream/mp3",
            (Channel::Kpop, StreamFormat::Vorbis) => "https://listen.moe/kpop/stream",
            (Channel::Kpop, StreamFormat::Mp3) => "https://listen.moe/kpop/stream/mp3",
        }
    }

    /// WebSocket gateway pushing now-playing updates for this channel.
    pub fn gateway_url(self) -> &'static str {
        match self {
            Channel::Jpop => "wss://listen.moe/gateway_v2",
            Channel::Kpop => "wss://listen.moe/kpop/gateway_v2",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Channel::Jpop => Channel::Kpop,
            Channel::Kpop => Channel::Jpop,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "jpop" => Ok(Channel::Jpop),
            "kpop" => Ok(Channel::Kpop),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Encoding of the radio stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[default]
    Vorbis,
    Mp3,
}

impl StreamFormat {
    pub fn label(self) -> &'static str {
        match self {
            StreamFormat::Vorbis => "Vorbis",
            StreamFormat::Mp3 => "MP3",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vorbis" | "ogg" => Ok(StreamFormat::Vorbis),
            "mp3" => Ok(StreamFormat::Mp3),
            other => Err(format!("unknown stream format: {other}")),
        }
    }
}
