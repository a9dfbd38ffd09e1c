//! LISTEN.moe now-playing feed.

pub mod client;
pub mod display;
pub mod protocol;

pub use client::{FeedConfig, FeedEvent, FeedListener, NowPlayingClient};
pub use protocol::{TrackFilter, timed_tracks_only};
