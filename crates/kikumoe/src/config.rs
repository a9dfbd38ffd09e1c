//! Application configuration.
//!
//! Values come from CLI flags first, then the TOML file, then built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kiku_feed::{FeedConfig, TrackFilter, timed_tracks_only};
use kiku_player::{Backend, FallbackTable, PlayerConfig};
use kiku_types::{Channel, PcmFormat, StreamFormat};
use serde::Deserialize;

use crate::cli::PlayArgs;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Top-level config loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub player: PlayerSection,
    pub stream: StreamSection,
    pub feed: FeedSection,
    /// Replaces the built-in fallback URL lists when present.
    pub fallbacks: Option<FallbackTable>,
}

/// `[player]`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlayerSection {
    pub backend: Option<Backend>,
    pub decoder_binary: Option<String>,
    pub device_index: Option<usize>,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub user_agent: Option<String>,
    pub stall_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub buffer_seconds: Option<f32>,
}

/// `[stream]`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub channel: Option<Channel>,
    pub format: Option<StreamFormat>,
    /// Overrides the channel stream URL.
    pub url: Option<String>,
    pub retry_delay_ms: Option<u64>,
}

/// `[feed]`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub enabled: Option<bool>,
    /// Overrides the channel gateway URL.
    pub url: Option<String>,
    pub reconnect_delay_secs: Option<u64>,
    /// Ignore track updates that carry no `startTime`.
    pub require_start_time: Option<bool>,
}

impl AppConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<AppConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Explicit path if given (must exist), else `config.toml` beside the executable, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn feed_config(&self, channel: Channel) -> FeedConfig {
        let mut feed = FeedConfig::for_channel(channel);
        if let Some(url) = self.feed.url.as_ref() {
            feed.url = url.clone();
        }
        if let Some(secs) = self.feed.reconnect_delay_secs {
            feed.reconnect_delay = Duration::from_secs(secs);
        }
        feed
    }

    pub fn track_filter(&self) -> Option<TrackFilter> {
        track_filter(self.feed.require_start_time.unwrap_or(false))
    }
}

fn track_filter(require_start_time: bool) -> Option<TrackFilter> {
    require_start_time.then(timed_tracks_only)
}

fn default_config_path() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")))
}

/// Everything `play` needs, with all layers applied.
#[derive(Clone, Debug)]
pub struct PlaySettings {
    pub player: PlayerConfig,
    pub backend: Backend,
    pub channel: Channel,
    pub format: StreamFormat,
    /// Fixed URL from `--url` or `[stream] url`; the channel stream otherwise.
    pub url_override: Option<String>,
    pub volume: u8,
    pub muted: bool,
    pub feed: Option<FeedConfig>,
    pub require_start_time: bool,
    pub retry_delay: Duration,
}

impl PlaySettings {
    pub fn stream_url(&self) -> String {
        self.url_override
            .clone()
            .unwrap_or_else(|| self.channel.stream_url(self.format).to_string())
    }

    pub fn track_filter(&self) -> Option<TrackFilter> {
        track_filter(self.require_start_time)
    }
}

pub fn resolve_play(cfg: &AppConfig, args: &PlayArgs) -> PlaySettings {
    let p = &cfg.player;
    let mut player = PlayerConfig::default();

    player.device_index = args.device_index.or(p.device_index);
    if let Some(bin) = args.decoder.clone().or_else(|| p.decoder_binary.clone()) {
        player.decoder_binary = bin;
    }
    if let Some(ua) = p.user_agent.clone() {
        player.user_agent = ua;
    }
    player.format = PcmFormat {
        sample_rate: p.sample_rate.unwrap_or(player.format.sample_rate),
        channels: p.channels.unwrap_or(player.format.channels),
    };
    if let Some(secs) = p.stall_timeout_secs {
        player.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = p.read_timeout_secs {
        player.read_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = p.buffer_seconds {
        player.buffer_seconds = secs;
    }
    if let Some(table) = cfg.fallbacks.clone() {
        player.fallbacks = table;
    }

    let channel = args.channel.or(cfg.stream.channel).unwrap_or_default();
    let format = args.format.or(cfg.stream.format).unwrap_or_default();
    let url_override = args.url.clone().or_else(|| cfg.stream.url.clone());

    let feed_enabled = !args.no_feed && cfg.feed.enabled.unwrap_or(true);
    PlaySettings {
        player,
        backend: args.backend.or(p.backend).unwrap_or_default(),
        channel,
        format,
        url_override,
        volume: args.volume.or(p.volume).unwrap_or(100).min(100),
        muted: args.mute || p.muted.unwrap_or(false),
        feed: feed_enabled.then(|| cfg.feed_config(channel)),
        require_start_time: cfg.feed.require_start_time.unwrap_or(false),
        retry_delay: cfg
            .stream
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY),
    }
}
