use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use kiku_types::PcmFormat;
use serde::Deserialize;

/// Which decode pipeline turns a stream URL into PCM.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// External `ffmpeg` process writing s16le to stdout.
    #[default]
    Ffmpeg,
    /// In-process HTTP fetch + Symphonia decode.
    Native,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Ffmpeg => "ffmpeg",
            Backend::Native => "native",
        })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(Backend::Ffmpeg),
            "native" | "symphonia" => Ok(Backend::Native),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Alternate transports tried after the primary URL, per channel.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackTable {
    pub jpop: Vec<String>,
    pub kpop: Vec<String>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self {
            jpop: vec![
                "https://listen.moe/stream".to_string(),
                "https://listen.moe/stream.m3u".to_string(),
                "http://listen.moe:9999/stream".to_string(),
            ],
            kpop: vec![
                "https://listen.moe/kpop/stream".to_string(),
                "https://listen.moe/kpop/stream.m3u".to_string(),
                "http://listen.moe:9999/kpop/stream".to_string(),
            ],
        }
    }
}

impl FallbackTable {
    /// Fallback list for the channel the URL belongs to.
    pub fn for_url(&self, url: &str) -> &[String] {
        if url.to_ascii_lowercase().contains("/kpop/") {
            &self.kpop
        } else {
            &self.jpop
        }
    }
}

/// Playback parameters resolved once at startup and handed to the controller.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Output device index in host enumeration order; `None` means system default.
    pub device_index: Option<usize>,
    /// PCM layout requested from the decoder and the device.
    pub format: PcmFormat,
    /// External decoder executable (name on `PATH` or absolute path).
    pub decoder_binary: String,
    /// User-Agent sent with stream requests.
    pub user_agent: String,
    /// Network read timeout for the decoder.
    pub read_timeout: Duration,
    /// Upper bound for the decoder's internal reconnect backoff.
    pub reconnect_delay_max: Duration,
    /// No-data interval after which the watchdog kills the decoder.
    pub stall_timeout: Duration,
    /// Watchdog polling period.
    pub watchdog_poll: Duration,
    /// Bytes per PCM read.
    pub chunk_bytes: usize,
    /// Target buffering between worker and device callback.
    pub buffer_seconds: f32,
    /// Wait between terminate and kill.
    pub terminate_grace: Duration,
    /// Bound on joining the worker during `stop()`.
    pub join_timeout: Duration,
    pub fallbacks: FallbackTable,
}

pub const DEFAULT_USER_AGENT: &str = concat!("KikuMoe/", env!("CARGO_PKG_VERSION"));

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            format: PcmFormat::default(),
            decoder_binary: "ffmpeg".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            read_timeout: Duration::from_secs(15),
            reconnect_delay_max: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(10),
            watchdog_poll: Duration::from_millis(500),
            chunk_bytes: 4096,
            buffer_seconds: 0.5,
            terminate_grace: Duration::from_millis(500),
            join_timeout: Duration::from_secs(2),
            fallbacks: FallbackTable::default(),
        }
    }
}
