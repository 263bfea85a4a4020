//! Audio output through cpal
//!
//! [`CpalSink`] is the bundled [`SinkBackend`]: it opens an output device,
//! builds a stream for whatever sample format the device wants, and pulls
//! rendered stereo float audio from the [`SinkFeed`] inside the device
//! callback. Device selection falls back to the default device when a
//! requested device is missing.

use crate::backend::{SinkBackend, SinkConfig};
use crate::error::{Error, Result};
use crate::mixer::SinkFeed;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Sink backend over a cpal output stream
pub struct CpalSink {
    requested_device: Option<String>,
    requested_buffer_frames: Option<u32>,
    device: Option<Device>,
    config: Option<StreamConfig>,
    sample_format: SampleFormat,
    feed: Option<SinkFeed>,
    stream: Option<Stream>,
    volume: Arc<Mutex<f32>>,
    latency_frames: usize,
}

impl CpalSink {
    /// Create an unopened sink
    ///
    /// `device_name` of `None` means the default output device.
    /// `buffer_frames` requests a device buffer size; `None` uses the
    /// device default.
    pub fn new(device_name: Option<String>, buffer_frames: Option<u32>) -> Self {
        Self {
            requested_device: device_name,
            requested_buffer_frames: buffer_frames,
            device: None,
            config: None,
            sample_format: SampleFormat::F32,
            feed: None,
            stream: None,
            volume: Arc::new(Mutex::new(1.0)),
            latency_frames: 0,
        }
    }

    /// List available output device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| {
                Error::ResourceAllocationFailed(format!("enumerate output devices: {}", e))
            })?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("found {} output devices", devices.len());
        Ok(devices)
    }

    fn open_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.requested_device.as_ref() {
            let mut devices = host.output_devices().map_err(|e| {
                Error::ResourceAllocationFailed(format!("enumerate output devices: {}", e))
            })?;
            if let Some(device) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                info!("using requested audio device: {}", name);
                return Ok(device);
            }
            warn!(
                "requested device '{}' not found, falling back to default device",
                name
            );
        }

        let device = host.default_output_device().ok_or_else(|| {
            Error::ResourceAllocationFailed("no default output device".to_string())
        })?;
        info!(
            "using default audio device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );
        Ok(device)
    }

    /// Pick the device config closest to the engine output format
    ///
    /// Prefers the engine rate, stereo, f32; falls back to the device
    /// default config otherwise.
    fn best_config(device: &Device, want: &SinkConfig) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported = device.supported_output_configs().map_err(|e| {
            Error::ResourceAllocationFailed(format!("query device configs: {}", e))
        })?;

        let preferred = supported.find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= want.sample_rate
                && config.max_sample_rate().0 >= want.sample_rate
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(want.sample_rate))
                .config();
            return Ok((config, sample_format));
        }

        let supported_config = device.default_output_config().map_err(|e| {
            Error::ResourceAllocationFailed(format!("query default device config: {}", e))
        })?;
        let sample_format = supported_config.sample_format();
        Ok((supported_config.config(), sample_format))
    }

    fn build_stream(&self) -> Result<Stream> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::IllegalState("sink not initialized".to_string()))?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::IllegalState("sink not initialized".to_string()))?;
        let feed = self
            .feed
            .as_ref()
            .ok_or_else(|| Error::IllegalState("sink not initialized".to_string()))?
            .clone();
        let volume = Arc::clone(&self.volume);
        let channels = config.channels as usize;

        let err_fn = |err: cpal::StreamError| {
            error!("audio stream error: {}", err);
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => {
                let mut scratch: Vec<f32> = Vec::new();
                device
                    .build_output_stream(
                        config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let gain = *volume.lock().unwrap();
                            if channels == 2 {
                                feed.fill(data);
                                for sample in data.iter_mut() {
                                    *sample = (*sample * gain).clamp(-1.0, 1.0);
                                }
                            } else {
                                let frames = data.len() / channels;
                                render_stereo(&feed, &mut scratch, frames, gain);
                                for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                                    write_frame(frame, &scratch, frame_idx, |v| v);
                                }
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| {
                        Error::ResourceAllocationFailed(format!("build output stream: {}", e))
                    })?
            }
            SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                device
                    .build_output_stream(
                        config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            let gain = *volume.lock().unwrap();
                            let frames = data.len() / channels;
                            render_stereo(&feed, &mut scratch, frames, gain);
                            for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                                write_frame(frame, &scratch, frame_idx, |v| {
                                    (v * i16::MAX as f32) as i16
                                });
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| {
                        Error::ResourceAllocationFailed(format!("build output stream: {}", e))
                    })?
            }
            SampleFormat::U16 => {
                let mut scratch: Vec<f32> = Vec::new();
                device
                    .build_output_stream(
                        config,
                        move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                            let gain = *volume.lock().unwrap();
                            let frames = data.len() / channels;
                            render_stereo(&feed, &mut scratch, frames, gain);
                            for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                                write_frame(frame, &scratch, frame_idx, |v| {
                                    ((v + 1.0) * 32767.5) as u16
                                });
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| {
                        Error::ResourceAllocationFailed(format!("build output stream: {}", e))
                    })?
            }
            other => {
                return Err(Error::ResourceAllocationFailed(format!(
                    "device sample format {:?} not supported",
                    other
                )));
            }
        };

        Ok(stream)
    }
}

/// Fill `scratch` with `frames` stereo frames from the feed, gain applied
fn render_stereo(feed: &SinkFeed, scratch: &mut Vec<f32>, frames: usize, gain: f32) {
    scratch.resize(frames * 2, 0.0);
    feed.fill(scratch);
    for sample in scratch.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

/// Map one rendered stereo frame onto a device frame of any channel count
///
/// Mono devices get the channel average; extra channels beyond two are
/// zeroed.
fn write_frame<T: Copy>(frame: &mut [T], stereo: &[f32], frame_idx: usize, convert: impl Fn(f32) -> T) {
    let left = stereo[frame_idx * 2];
    let right = stereo[frame_idx * 2 + 1];
    if frame.len() == 1 {
        frame[0] = convert(0.5 * (left + right));
        return;
    }
    frame[0] = convert(left);
    frame[1] = convert(right);
    for extra in frame.iter_mut().skip(2) {
        *extra = convert(0.0);
    }
}

impl SinkBackend for CpalSink {
    fn initialize(&mut self, config: &SinkConfig, feed: SinkFeed) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::IllegalState("sink already initialized".to_string()));
        }

        let device = self.open_device()?;
        let (mut stream_config, sample_format) = Self::best_config(&device, config)?;

        if let Some(frames) = self.requested_buffer_frames {
            stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
            debug!("using requested buffer size: {} frames", frames);
        }

        self.latency_frames = match stream_config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames as usize,
            // Device default period is unknown until the stream runs; a
            // typical value serves for latency estimates.
            cpal::BufferSize::Default => 512,
        };

        if stream_config.sample_rate.0 != config.sample_rate {
            warn!(
                "device runs at {} Hz, engine renders at {} Hz",
                stream_config.sample_rate.0, config.sample_rate
            );
        }

        debug!(
            "sink config: rate={}, channels={}, format={:?}, buffer={:?}",
            stream_config.sample_rate.0,
            stream_config.channels,
            sample_format,
            stream_config.buffer_size
        );

        self.device = Some(device);
        self.config = Some(stream_config);
        self.sample_format = sample_format;
        self.feed = Some(feed);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::IllegalState("sink already started".to_string()));
        }
        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| Error::ResourceAllocationFailed(format!("start stream: {}", e)))?;
        self.stream = Some(stream);
        info!("audio stream started");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::IllegalState("sink not started".to_string()))?;
        stream
            .pause()
            .map_err(|e| Error::Internal(format!("pause stream: {}", e)))?;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::IllegalState("sink not started".to_string()))?;
        stream
            .play()
            .map_err(|e| Error::Internal(format!("resume stream: {}", e)))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("pause during stop failed: {}", e);
            }
            drop(stream);
            info!("audio stream stopped");
        }
        Ok(())
    }

    fn latency_frames(&self) -> usize {
        self.latency_frames
    }

    fn set_volume(&mut self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        *self.volume.lock().unwrap() = clamped;
        debug!("sink volume set to {:.2}", clamped);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Needs audio hardware to return devices; either outcome is fine.
        let _ = CpalSink::list_devices();
    }

    #[test]
    fn test_write_frame_mono_averages() {
        let stereo = [0.4_f32, 0.8];
        let mut frame = [0.0_f32];
        write_frame(&mut frame, &stereo, 0, |v| v);
        assert!((frame[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_write_frame_zeroes_extra_channels() {
        let stereo = [0.25_f32, -0.25];
        let mut frame = [9.0_f32; 6];
        write_frame(&mut frame, &stereo, 0, |v| v);
        assert_eq!(frame[0], 0.25);
        assert_eq!(frame[1], -0.25);
        assert!(frame[2..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_write_frame_i16_conversion() {
        let stereo = [1.0_f32, -1.0];
        let mut frame = [0_i16; 2];
        write_frame(&mut frame, &stereo, 0, |v| (v * i16::MAX as f32) as i16);
        assert_eq!(frame[0], i16::MAX);
        assert_eq!(frame[1], -i16::MAX);
    }

    #[test]
    fn test_uninitialized_sink_rejects_start() {
        let mut sink = CpalSink::new(None, None);
        assert!(matches!(sink.start(), Err(Error::IllegalState(_))));
        assert!(matches!(sink.pause(), Err(Error::IllegalState(_))));
        // stop is idempotent even before start
        assert!(sink.stop().is_ok());
    }
}
