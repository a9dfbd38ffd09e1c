pub mod config;
pub mod controller;
pub mod decoder;
pub mod device;
pub mod events;
pub mod native;
pub mod output;
pub mod pcm;
pub mod queue;
pub mod sanitize;
pub mod watchdog;

mod session;
mod worker;

pub use config::{Backend, FallbackTable, PlayerConfig};
pub use controller::PlaybackController;
pub use events::EventSink;
