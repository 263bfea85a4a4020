//! Real-time audio playback engine built on lock-free block pipelines.
//!
//! Decoded audio moves through fixed-size [`pipe`] blocks from per-stream
//! decoder threads, through format adaptation to the output rate, into a
//! mixer that crossfades any number of concurrent streams into one stereo
//! feed for the output device.
//!
//! The public surface is [`AudioSystem`]: create players, bind streams,
//! and drive the whole engine from one control-thread poll loop. Render
//! work happens on the device callback; the control loop only moves
//! lifecycle state and reclaims spent blocks.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod mixer;
pub mod pipe;
pub mod player;
pub mod source;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{PlayerEvent, PlayerEventListener};
pub use player::{AudioPlayer, PlayerState};
pub use system::{AudioSystem, CaptureListener, PollSchedule};
