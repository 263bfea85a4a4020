//! External collaborator interfaces
//!
//! The engine core talks to the outside world through two seams: a
//! [`SinkBackend`] wrapping the audio output device, and a [`Decoder`]
//! wrapping a media decoder. Both are traits so the bundled cpal/symphonia
//! implementations can be swapped for test doubles or platform adapters.
//! Everything behind these traits is thin glue; the pipeline semantics live
//! on the engine side of the seam.

mod decoder;
mod output;

pub use decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};
pub use output::CpalSink;

use crate::error::{Error, Result};
use crate::mixer::SinkFeed;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Output format the engine renders; the sink adapts it to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub sample_rate: u32,
    pub channels: u16,

    /// Frames per sink-pipe block; a latency floor for the device buffer
    pub block_frames: usize,
}

/// Where a decoder reads its bytes from
///
/// `Uri` accepts `file://` URIs only; anything else is rejected with
/// `ContentUnsupported` when the decoder opens it. `File` reads the byte
/// window `offset..offset + length` of an already-open file.
#[derive(Debug)]
pub enum DataSource {
    Path(PathBuf),
    Uri(String),
    File { file: File, offset: u64, length: u64 },
}

impl DataSource {
    /// Duplicate the source so a second decoder session can open it
    ///
    /// The `File` variant clones the descriptor; reads through the window
    /// are positioned, so clones do not disturb each other's progress.
    pub fn try_clone(&self) -> Result<DataSource> {
        match self {
            DataSource::Path(path) => Ok(DataSource::Path(path.clone())),
            DataSource::Uri(uri) => Ok(DataSource::Uri(uri.clone())),
            DataSource::File {
                file,
                offset,
                length,
            } => {
                let file = file
                    .try_clone()
                    .map_err(|e| Error::Internal(format!("clone data source fd: {}", e)))?;
                Ok(DataSource::File {
                    file,
                    offset: *offset,
                    length: *length,
                })
            }
        }
    }

    /// Short human-readable form for log lines
    pub fn describe(&self) -> String {
        match self {
            DataSource::Path(path) => path.display().to_string(),
            DataSource::Uri(uri) => uri.clone(),
            DataSource::File { offset, length, .. } => {
                format!("fd[{}..+{}]", offset, length)
            }
        }
    }
}

/// Stream properties reported once probing completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,

    /// Total duration, when the container declares one
    pub duration_ms: Option<u32>,
}

/// Result of one non-blocking preparation poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStatus {
    /// Not done yet; poll again on the next cadence
    NeedRetry,

    /// Preparation finished; dependent operations may proceed
    Ready,
}

/// Flow control returned by the delivery consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryControl {
    Continue,

    /// The consumer is shutting down; end the delivery session
    Stop,
}

/// Consumer of decoded PCM, invoked on the decoder's delivery thread
///
/// Blocks arrive as interleaved 16-bit samples at the stream's native rate
/// and channel count, always exactly the frame count given to
/// [`Decoder::set_output`]. The final partial block is zero-padded to full
/// size; `on_end_of_stream` then carries the exact position of the last
/// real frame.
pub trait DecoderOutput: Send + Sync {
    fn on_block(&self, samples: &[i16], position_ms: u32) -> DeliveryControl;

    fn on_end_of_stream(&self, position_ms: u32);

    /// A fatal decode failure; no further callbacks follow
    fn on_error(&self, error: Error);
}

/// One decoder session over one data source
///
/// Preparation is split into `start_preparing` (kick off probing) and
/// `poll_preparing` (non-blocking progress check) so the control thread
/// never blocks on I/O. Delivery, once started, runs on the decoder's own
/// thread and is gated by `start`/`pause`; `stop` tears the session down and
/// is idempotent.
pub trait Decoder: Send {
    fn set_data_source(&mut self, source: DataSource) -> Result<()>;

    /// Install the delivery consumer and the per-block frame count
    fn set_output(&mut self, block_frames: usize, output: Arc<dyn DecoderOutput>) -> Result<()>;

    fn start_preparing(&mut self) -> Result<()>;

    fn poll_preparing(&mut self) -> Result<PrepareStatus>;

    /// Stream properties; valid once preparation reports `Ready`
    fn stream_info(&self) -> Result<StreamInfo>;

    /// Reposition the next delivery to `position_ms`
    fn seek_to(&mut self, position_ms: u32) -> Result<()>;

    /// Begin the delivery session (initially running)
    fn start_delivery(&mut self) -> Result<()>;

    /// Resume a paused delivery session
    fn start(&mut self) -> Result<()>;

    /// Halt delivery without losing position
    fn pause(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn duration_ms(&self) -> Option<u32>;

    /// Position of the next frame to be delivered
    fn current_position_ms(&self) -> u32;

    /// How far ahead of playback decoded data extends
    fn buffered_position_ms(&self) -> u32;
}

/// Creates one fresh [`Decoder`] per source session
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Decoder>>;
}

/// The audio output device seam
///
/// `initialize` receives the [`SinkFeed`]; the backend pulls it once per
/// hardware buffer period from its callback (or write loop). The feed
/// renders on demand and substitutes silence on underrun, so the backend
/// never needs its own starvation handling. Implementations may be tied to
/// the thread that created them (device streams often are), so the trait
/// does not require `Send`.
pub trait SinkBackend {
    fn initialize(&mut self, config: &SinkConfig, feed: SinkFeed) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Device buffering depth, for latency estimates
    fn latency_frames(&self) -> usize;

    /// Master gain applied after mixing, clamped to 0..=1
    fn set_volume(&mut self, volume: f32);
}
