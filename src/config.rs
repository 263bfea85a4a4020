//! Engine configuration
//!
//! All tunables live in [`EngineConfig`], loadable from a TOML file or built
//! from defaults. The configuration is validated once at
//! [`AudioSystem::new`](crate::system::AudioSystem::new); the engine never
//! re-reads it while running.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Resampler quality selection for the format adapter
///
/// Trades aliasing/SNR for CPU:
/// - `Low`: polynomial interpolation, cheapest
/// - `Mid`: windowed sinc, linear inter-filter interpolation
/// - `High`: windowed sinc, cubic inter-filter interpolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleQuality {
    Low,
    Mid,
    High,
}

/// Engine-wide configuration
///
/// Every field has a built-in default; a TOML file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Output sample rate in Hz (sink pipe and mixer operate at this rate)
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Frames per block, shared by source and sink pipes
    #[serde(default = "default_block_frames")]
    pub block_frames: usize,

    /// Blocks per source pipe (per-source buffering depth)
    #[serde(default = "default_source_pipe_blocks")]
    pub source_pipe_blocks: usize,

    /// Blocks in the sink pipe
    #[serde(default = "default_sink_pipe_blocks")]
    pub sink_pipe_blocks: usize,

    /// Blocks in the capture pipe
    #[serde(default = "default_capture_pipe_blocks")]
    pub capture_pipe_blocks: usize,

    /// Number of source pipes in the pool (upper bound on concurrent sources)
    #[serde(default = "default_source_pipe_count")]
    pub source_pipe_count: usize,

    /// Short fade duration in ms (pause/resume, seek splices)
    #[serde(default = "default_short_fade_ms")]
    pub short_fade_ms: u32,

    /// Long fade duration in ms (crossfades)
    #[serde(default = "default_long_fade_ms")]
    pub long_fade_ms: u32,

    /// Minimum interval between applied seeks; requests inside the window
    /// coalesce into the newest target
    #[serde(default = "default_seek_debounce_ms")]
    pub seek_debounce_ms: u32,

    /// Control-thread poll cadence when periodic work is pending
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u32,

    /// Producer backoff: maximum timed waits before a decode-thread push is
    /// abandoned (data loss preferred to deadlock)
    #[serde(default = "default_producer_max_retries")]
    pub producer_max_retries: u32,

    /// Producer backoff: wait per retry in ms
    #[serde(default = "default_producer_retry_wait_ms")]
    pub producer_retry_wait_ms: u32,

    /// Upper bound for a synchronous prepare() call
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u32,

    /// Blocks that must be queued before queue prefetch completes
    #[serde(default = "default_prefetch_blocks")]
    pub prefetch_blocks: usize,

    /// Resampler quality for format adaptation
    #[serde(default = "default_resample_quality")]
    pub resample_quality: ResampleQuality,

    /// Enable the capture tap (mixed output copied to the capture pipe)
    #[serde(default)]
    pub capture_enabled: bool,
}

fn default_output_sample_rate() -> u32 {
    44100
}

fn default_block_frames() -> usize {
    1024
}

fn default_source_pipe_blocks() -> usize {
    32
}

fn default_sink_pipe_blocks() -> usize {
    4
}

fn default_capture_pipe_blocks() -> usize {
    8
}

fn default_source_pipe_count() -> usize {
    16
}

fn default_short_fade_ms() -> u32 {
    20
}

fn default_long_fade_ms() -> u32 {
    500
}

fn default_seek_debounce_ms() -> u32 {
    100
}

fn default_poll_interval_ms() -> u32 {
    30
}

fn default_producer_max_retries() -> u32 {
    10
}

fn default_producer_retry_wait_ms() -> u32 {
    100
}

fn default_prepare_timeout_ms() -> u32 {
    10_000
}

fn default_prefetch_blocks() -> usize {
    4
}

fn default_resample_quality() -> ResampleQuality {
    ResampleQuality::Mid
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: default_output_sample_rate(),
            block_frames: default_block_frames(),
            source_pipe_blocks: default_source_pipe_blocks(),
            sink_pipe_blocks: default_sink_pipe_blocks(),
            capture_pipe_blocks: default_capture_pipe_blocks(),
            source_pipe_count: default_source_pipe_count(),
            short_fade_ms: default_short_fade_ms(),
            long_fade_ms: default_long_fade_ms(),
            seek_debounce_ms: default_seek_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            producer_max_retries: default_producer_max_retries(),
            producer_retry_wait_ms: default_producer_retry_wait_ms(),
            prepare_timeout_ms: default_prepare_timeout_ms(),
            prefetch_blocks: default_prefetch_blocks(),
            resample_quality: default_resample_quality(),
            capture_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing fields fall back to built-in defaults. The result is not yet
    /// validated; call [`validate`](Self::validate).
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ContentNotFound(format!("config {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| Error::IllegalArgument(format!("config {}: {}", path.display(), e)))
    }

    /// Validate internal consistency
    ///
    /// Returns `IllegalArgument` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.output_sample_rate < 8000 || self.output_sample_rate > 192_000 {
            return Err(Error::IllegalArgument(format!(
                "output_sample_rate {} outside 8000..=192000",
                self.output_sample_rate
            )));
        }
        if self.block_frames == 0 || self.block_frames > 65_536 {
            return Err(Error::IllegalArgument(format!(
                "block_frames {} outside 1..=65536",
                self.block_frames
            )));
        }
        // The prefetch target must fit in a source pipe with slack for the
        // in-flight write block.
        if self.source_pipe_blocks < 2 {
            return Err(Error::IllegalArgument(format!(
                "source_pipe_blocks {} must be >= 2",
                self.source_pipe_blocks
            )));
        }
        if self.prefetch_blocks >= self.source_pipe_blocks {
            return Err(Error::IllegalArgument(format!(
                "prefetch_blocks {} must be < source_pipe_blocks {}",
                self.prefetch_blocks, self.source_pipe_blocks
            )));
        }
        if self.sink_pipe_blocks < 2 {
            return Err(Error::IllegalArgument(format!(
                "sink_pipe_blocks {} must be >= 2",
                self.sink_pipe_blocks
            )));
        }
        if self.source_pipe_count == 0 || self.source_pipe_count > 64 {
            return Err(Error::IllegalArgument(format!(
                "source_pipe_count {} outside 1..=64",
                self.source_pipe_count
            )));
        }
        if self.short_fade_ms == 0 || self.long_fade_ms == 0 {
            return Err(Error::IllegalArgument(
                "fade durations must be non-zero".to_string(),
            ));
        }
        if self.producer_max_retries == 0 || self.producer_retry_wait_ms == 0 {
            return Err(Error::IllegalArgument(
                "producer backoff must allow at least one timed wait".to_string(),
            ));
        }
        Ok(())
    }

    /// Duration of one block at the output rate
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.output_sample_rate as f64)
    }

    /// Milliseconds represented by `frames` at the output rate
    pub fn frames_to_ms(&self, frames: u64) -> u32 {
        (frames * 1000 / self.output_sample_rate as u64) as u32
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms as u64)
    }

    pub fn producer_retry_wait(&self) -> Duration {
        Duration::from_millis(self.producer_retry_wait_ms as u64)
    }
}
