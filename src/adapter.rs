//! Format adapter: decoder PCM → mixer blocks
//!
//! Converts fixed-size blocks of 16-bit PCM (mono or stereo, one of the
//! standard rates) into fixed-size float-stereo blocks at the engine output
//! rate using rubato.
//!
//! ## Contract
//!
//! - `put_input_data` accepts exactly one input block, and only while
//!   `is_output_data_ready()` is false — the caller drains before feeding.
//! - `get_output_data` fills exactly one output block, and must only be
//!   called while ready.
//! - `flush()` drains the resampler tail at end-of-stream; the final partial
//!   block comes out zero-padded.
//!
//! A fixed-output resampler keeps the internal pooling bounded: at most one
//! input block of slack is staged ahead of the resampler and the flush tail
//! is materialized once, so there is no unbounded queueing.

use crate::config::ResampleQuality;
use crate::error::{Error, Result};
use rubato::{
    FastFixedOut, PolynomialDegree, Resampler as RubatoResampler, SincFixedOut,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Input rates the adapter accepts
pub const STANDARD_RATES: [u32; 9] = [
    8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000,
];

/// Output channel count; the mixer is stereo-only
const OUT_CHANNELS: usize = 2;

/// Fixed geometry of one adapter instance
#[derive(Debug, Clone, Copy)]
pub struct AdapterSpec {
    /// Decoder sample rate in Hz (must be in [`STANDARD_RATES`])
    pub input_rate: u32,

    /// Decoder channels: 1 (duplicated to stereo) or 2
    pub input_channels: u16,

    /// Engine output rate in Hz
    pub output_rate: u32,

    /// Frames per input block (what the decoder delivers)
    pub input_block_frames: usize,

    /// Frames per output block (what the source pipe carries)
    pub output_block_frames: usize,

    pub quality: ResampleQuality,
}

enum Inner {
    Fast(FastFixedOut<f32>),
    Sinc(SincFixedOut<f32>),
}

impl Inner {
    fn input_frames_next(&self) -> usize {
        match self {
            Inner::Fast(r) => r.input_frames_next(),
            Inner::Sinc(r) => r.input_frames_next(),
        }
    }

    fn process(&mut self, input: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let result = match self {
            Inner::Fast(r) => r.process(input, None),
            Inner::Sinc(r) => r.process(input, None),
        };
        result.map_err(|e| Error::Internal(format!("resampler process: {}", e)))
    }

    fn process_partial(&mut self, input: Option<&[Vec<f32>]>) -> Result<Vec<Vec<f32>>> {
        let result = match self {
            Inner::Fast(r) => r.process_partial(input, None),
            Inner::Sinc(r) => r.process_partial(input, None),
        };
        result.map_err(|e| Error::Internal(format!("resampler flush: {}", e)))
    }
}

/// Sample-rate and format conversion between one decoder and one source pipe
pub struct FormatAdapter {
    spec: AdapterSpec,

    /// None when input and output rates match (unity bypass)
    inner: Option<Inner>,

    /// Converted input frames staged ahead of the resampler, planar per
    /// input channel
    staging: Vec<Vec<f32>>,

    /// Real (unpadded) flush output, interleaved stereo
    tail: Vec<f32>,

    /// Total input frames accepted
    frames_in: u64,

    /// Total real output frames emitted
    frames_out: u64,

    flushed: bool,
}

impl std::fmt::Debug for FormatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatAdapter")
            .field("spec", &self.spec)
            .field("frames_in", &self.frames_in)
            .field("frames_out", &self.frames_out)
            .field("flushed", &self.flushed)
            .finish_non_exhaustive()
    }
}

impl FormatAdapter {
    pub fn new(spec: AdapterSpec) -> Result<Self> {
        if !STANDARD_RATES.contains(&spec.input_rate) {
            return Err(Error::IllegalArgument(format!(
                "input rate {} not in the standard set",
                spec.input_rate
            )));
        }
        if spec.input_channels != 1 && spec.input_channels != 2 {
            return Err(Error::IllegalArgument(format!(
                "input channels {} (must be 1 or 2)",
                spec.input_channels
            )));
        }
        if spec.input_block_frames == 0 || spec.output_block_frames == 0 {
            return Err(Error::IllegalArgument("zero block size".to_string()));
        }

        let inner = if spec.input_rate == spec.output_rate {
            debug!("adapter: unity rate {}Hz, resampler bypassed", spec.input_rate);
            None
        } else {
            Some(Self::create_resampler(&spec)?)
        };

        let channels = spec.input_channels as usize;
        Ok(Self {
            spec,
            inner,
            staging: vec![Vec::new(); channels],
            tail: Vec::new(),
            frames_in: 0,
            frames_out: 0,
            flushed: false,
        })
    }

    /// Build the quality-selected rubato resampler
    ///
    /// Fixed-output variants: each process call yields exactly one output
    /// block, which is what keeps the one-in/one-out contract cheap.
    fn create_resampler(spec: &AdapterSpec) -> Result<Inner> {
        let ratio = spec.output_rate as f64 / spec.input_rate as f64;
        let channels = spec.input_channels as usize;

        let inner = match spec.quality {
            ResampleQuality::Low => {
                let r = FastFixedOut::<f32>::new(
                    ratio,
                    1.0, // fixed ratio, no runtime changes
                    PolynomialDegree::Cubic,
                    spec.output_block_frames,
                    channels,
                )
                .map_err(|e| Error::Internal(format!("create resampler: {}", e)))?;
                Inner::Fast(r)
            }
            ResampleQuality::Mid => {
                let params = SincInterpolationParameters {
                    sinc_len: 128,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 128,
                    window: WindowFunction::Blackman2,
                };
                let r = SincFixedOut::<f32>::new(
                    ratio,
                    1.0,
                    params,
                    spec.output_block_frames,
                    channels,
                )
                .map_err(|e| Error::Internal(format!("create resampler: {}", e)))?;
                Inner::Sinc(r)
            }
            ResampleQuality::High => {
                let params = SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Cubic,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                };
                let r = SincFixedOut::<f32>::new(
                    ratio,
                    1.0,
                    params,
                    spec.output_block_frames,
                    channels,
                )
                .map_err(|e| Error::Internal(format!("create resampler: {}", e)))?;
                Inner::Sinc(r)
            }
        };
        Ok(inner)
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    /// Accept exactly one input block of interleaved 16-bit PCM
    ///
    /// Rejected with `IllegalState` while output is pending or after
    /// `flush()`; rejected with `IllegalArgument` on a wrong-sized chunk.
    pub fn put_input_data(&mut self, input: &[i16]) -> Result<()> {
        if self.flushed {
            return Err(Error::IllegalState("adapter already flushed".to_string()));
        }
        if self.is_output_data_ready() {
            return Err(Error::IllegalState(
                "output pending; drain before feeding".to_string(),
            ));
        }
        let expected = self.spec.input_block_frames * self.spec.input_channels as usize;
        if input.len() != expected {
            return Err(Error::IllegalArgument(format!(
                "input chunk {} samples, expected {}",
                input.len(),
                expected
            )));
        }

        let channels = self.spec.input_channels as usize;
        for (i, &sample) in input.iter().enumerate() {
            self.staging[i % channels].push(sample as f32 / 32768.0);
        }
        self.frames_in += self.spec.input_block_frames as u64;
        Ok(())
    }

    /// True when `get_output_data` will succeed
    pub fn is_output_data_ready(&self) -> bool {
        if self.flushed {
            return !self.tail.is_empty();
        }
        match &self.inner {
            Some(inner) => self.staged_frames() >= inner.input_frames_next(),
            None => self.staged_frames() >= self.spec.output_block_frames,
        }
    }

    /// Fill exactly one output block of interleaved float stereo
    ///
    /// `out` must be `output_block_frames * 2` samples. After a flush the
    /// final partial block is zero-padded.
    pub fn get_output_data(&mut self, out: &mut [f32]) -> Result<()> {
        let out_samples = self.spec.output_block_frames * OUT_CHANNELS;
        if out.len() != out_samples {
            return Err(Error::IllegalArgument(format!(
                "output chunk {} samples, expected {}",
                out.len(),
                out_samples
            )));
        }
        if !self.is_output_data_ready() {
            return Err(Error::IllegalState("no output data ready".to_string()));
        }

        if self.flushed {
            let n = self.tail.len().min(out_samples);
            out[..n].copy_from_slice(&self.tail[..n]);
            out[n..].fill(0.0);
            self.tail.drain(..n);
            self.frames_out += (n / OUT_CHANNELS) as u64;
            return Ok(());
        }

        match &mut self.inner {
            Some(inner) => {
                let need = inner.input_frames_next();
                let chunk: Vec<Vec<f32>> = self
                    .staging
                    .iter_mut()
                    .map(|ch| ch.drain(..need).collect())
                    .collect();
                let planar = inner.process(&chunk)?;
                interleave_stereo(&planar, out);
                self.frames_out += self.spec.output_block_frames as u64;
            }
            None => {
                let frames = self.spec.output_block_frames;
                let channels = self.spec.input_channels as usize;
                for frame in 0..frames {
                    let left = self.staging[0][frame];
                    let right = if channels == 2 {
                        self.staging[1][frame]
                    } else {
                        left
                    };
                    out[frame * 2] = left;
                    out[frame * 2 + 1] = right;
                }
                for ch in self.staging.iter_mut() {
                    ch.drain(..frames);
                }
                self.frames_out += frames as u64;
            }
        }
        Ok(())
    }

    /// Drain the resampler at end-of-stream
    ///
    /// Materializes the remaining real output so the final partial block is
    /// not lost inside the filter taps. Idempotent.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;

        // Real frames still owed: round(frames_in * ratio) - emitted
        let expected_total = (self.frames_in * self.spec.output_rate as u64
            + self.spec.input_rate as u64 / 2)
            / self.spec.input_rate as u64;
        let remaining = expected_total.saturating_sub(self.frames_out) as usize;

        let staged_frames = self.staged_frames();
        match &mut self.inner {
            Some(inner) => {
                let mut produced: Vec<f32> = Vec::with_capacity(remaining * OUT_CHANNELS);

                // Push the leftover staged input through first
                if staged_frames > 0 {
                    let chunk: Vec<Vec<f32>> =
                        self.staging.iter_mut().map(std::mem::take).collect();
                    let planar = inner.process_partial(Some(&chunk))?;
                    append_interleaved_stereo(&planar, &mut produced);
                }

                // Then drain the filter history. Each call yields one output
                // block; bound the loop in case the resampler underestimates.
                let max_calls = remaining / self.spec.output_block_frames + 4;
                for _ in 0..max_calls {
                    if produced.len() >= remaining * OUT_CHANNELS {
                        break;
                    }
                    let planar = inner.process_partial(None::<&[Vec<f32>]>)?;
                    append_interleaved_stereo(&planar, &mut produced);
                }
                produced.truncate(remaining * OUT_CHANNELS);
                self.tail = produced;
            }
            None => {
                let frames = self.staged_frames().min(remaining);
                let channels = self.spec.input_channels as usize;
                let mut produced = Vec::with_capacity(frames * OUT_CHANNELS);
                for frame in 0..frames {
                    let left = self.staging[0][frame];
                    let right = if channels == 2 {
                        self.staging[1][frame]
                    } else {
                        left
                    };
                    produced.push(left);
                    produced.push(right);
                }
                for ch in self.staging.iter_mut() {
                    ch.clear();
                }
                self.tail = produced;
            }
        }

        debug!(
            "adapter flush: {} real frames in tail ({} in, {} out so far)",
            self.tail.len() / OUT_CHANNELS,
            self.frames_in,
            self.frames_out
        );
        Ok(())
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn staged_frames(&self) -> usize {
        self.staging[0].len()
    }
}

/// Planar (1 or 2 channel) → interleaved stereo, filling `out` exactly
fn interleave_stereo(planar: &[Vec<f32>], out: &mut [f32]) {
    let frames = out.len() / OUT_CHANNELS;
    for frame in 0..frames {
        let left = planar[0][frame];
        let right = if planar.len() > 1 { planar[1][frame] } else { left };
        out[frame * 2] = left;
        out[frame * 2 + 1] = right;
    }
}

/// Planar (1 or 2 channel) → interleaved stereo, appended to `out`
fn append_interleaved_stereo(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    if planar.is_empty() {
        return;
    }
    for frame in 0..planar[0].len() {
        let left = planar[0][frame];
        let right = if planar.len() > 1 { planar[1][frame] } else { left };
        out.push(left);
        out.push(right);
    }
}

// ======== Tests ========
