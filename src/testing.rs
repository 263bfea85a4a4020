//! Scripted decoder doubles shared by unit tests in the player and system
//! modules.
//!
//! The decoder delivers a deterministic sample ramp synchronously the moment
//! delivery starts, then reports end of stream, so tests can drive a whole
//! prepare cycle without threads or timing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{
    DataSource, Decoder, DecoderFactory, DecoderOutput, DeliveryControl, PrepareStatus, StreamInfo,
};
use crate::error::{Error, Result};

pub(crate) struct ScriptedDecoder {
    info: StreamInfo,
    prepare_polls_left: u32,
    preparing: bool,
    total_frames: usize,
    output: Option<(usize, Arc<dyn DecoderOutput>)>,
    delivered: bool,
    position_ms: u32,
    buffered_ms: u32,
    seeks: Arc<Mutex<Vec<u32>>>,
    playing: bool,
}

impl ScriptedDecoder {
    fn deliver_all(&mut self) {
        let Some((block_frames, output)) = self.output.clone() else {
            return;
        };
        let channels = self.info.channels as usize;
        let rate = self.info.sample_rate;
        let start_frame = self.position_ms as u64 * rate as u64 / 1000;
        let mut frame = 0usize;
        while frame < self.total_frames {
            let mut chunk = vec![0i16; block_frames * channels];
            for i in 0..block_frames.min(self.total_frames - frame) {
                let value = ((frame + i) % 100) as i16 * 100;
                for ch in 0..channels {
                    chunk[i * channels + ch] = value;
                }
            }
            let position = ((start_frame + frame as u64) * 1000 / rate as u64) as u32;
            if matches!(output.on_block(&chunk, position), DeliveryControl::Stop) {
                return;
            }
            frame += block_frames;
        }
        let final_frame = start_frame + self.total_frames as u64;
        let final_ms = (final_frame * 1000 / rate as u64) as u32;
        output.on_end_of_stream(final_ms);
        self.buffered_ms = final_ms;
        self.delivered = true;
    }
}

impl Decoder for ScriptedDecoder {
    fn set_data_source(&mut self, _source: DataSource) -> Result<()> {
        Ok(())
    }

    fn set_output(&mut self, block_frames: usize, output: Arc<dyn DecoderOutput>) -> Result<()> {
        self.output = Some((block_frames, output));
        Ok(())
    }

    fn start_preparing(&mut self) -> Result<()> {
        self.preparing = true;
        Ok(())
    }

    fn poll_preparing(&mut self) -> Result<PrepareStatus> {
        if !self.preparing {
            return Err(Error::IllegalState("not preparing".to_string()));
        }
        if self.prepare_polls_left > 0 {
            self.prepare_polls_left -= 1;
            return Ok(PrepareStatus::NeedRetry);
        }
        Ok(PrepareStatus::Ready)
    }

    fn stream_info(&self) -> Result<StreamInfo> {
        Ok(self.info)
    }

    fn seek_to(&mut self, position_ms: u32) -> Result<()> {
        self.seeks.lock().unwrap().push(position_ms);
        self.position_ms = position_ms;
        self.buffered_ms = position_ms;
        Ok(())
    }

    fn start_delivery(&mut self) -> Result<()> {
        if !self.delivered {
            self.deliver_all();
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.playing = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn duration_ms(&self) -> Option<u32> {
        Some((self.total_frames as u64 * 1000 / self.info.sample_rate as u64) as u32)
    }

    fn current_position_ms(&self) -> u32 {
        self.position_ms
    }

    fn buffered_position_ms(&self) -> u32 {
        self.buffered_ms
    }
}

/// Factory minting any number of scripted decoders over one shared seek log.
pub(crate) struct ScriptedFactory {
    info: StreamInfo,
    prepare_polls: u32,
    total_frames: usize,
    created: AtomicUsize,
    seeks: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedFactory {
    pub(crate) fn new(info: StreamInfo, total_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            info,
            prepare_polls: 0,
            total_frames,
            created: AtomicUsize::new(0),
            seeks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of decoders handed out so far; one per source preparation.
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Every position any minted decoder was seeked to, in order.
    pub(crate) fn seeks(&self) -> Vec<u32> {
        self.seeks.lock().unwrap().clone()
    }
}

impl DecoderFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn Decoder>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ScriptedDecoder {
            info: self.info,
            prepare_polls_left: self.prepare_polls,
            preparing: false,
            total_frames: self.total_frames,
            output: None,
            delivered: false,
            position_ms: 0,
            buffered_ms: 0,
            seeks: Arc::clone(&self.seeks),
            playing: false,
        }))
    }
}
