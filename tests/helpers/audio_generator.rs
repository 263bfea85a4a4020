//! Deterministic WAV fixtures for pipeline testing

use hound::{SampleFormat, WavSpec, WavWriter};
use std::f32::consts::PI;
use std::path::Path;

const TEST_SAMPLE_RATE: u32 = 44_100;

/// Write a stereo 16-bit sine wave, both channels identical.
///
/// Amplitude 0.5 keeps plenty of headroom for crossfade overlap.
pub fn generate_sine_wav(
    path: &Path,
    duration_ms: u64,
    frequency_hz: f32,
    amplitude: f32,
) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    let frames = TEST_SAMPLE_RATE as u64 * duration_ms / 1000;
    for n in 0..frames {
        let t = n as f32 / TEST_SAMPLE_RATE as f32;
        let value = (amplitude * (2.0 * PI * frequency_hz * t).sin() * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
        writer.write_sample(value)?;
    }
    writer.finalize()
}
