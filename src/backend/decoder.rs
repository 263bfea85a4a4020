//! Media decoding through symphonia
//!
//! [`SymphoniaDecoder`] is the bundled [`Decoder`]: probing and packet
//! decoding run on a dedicated worker thread so the control thread's
//! `poll_preparing` calls never touch I/O. Decoded audio is re-chunked into
//! fixed-size interleaved 16-bit blocks and handed to the installed
//! [`DecoderOutput`] at the stream's native rate; the engine's format
//! adapter takes it from there.

use crate::backend::{
    DataSource, Decoder, DecoderFactory, DecoderOutput, DeliveryControl, PrepareStatus, StreamInfo,
};
use crate::error::{Error, ErrorKind, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, pos)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, pos)
}

/// A byte window of an open file, read with positioned I/O
///
/// Positioned reads leave the underlying descriptor's cursor alone, so
/// windows over cloned descriptors never disturb each other.
struct FileWindow {
    file: File,
    offset: u64,
    length: u64,
    pos: u64,
}

impl FileWindow {
    fn new(file: File, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
            pos: 0,
        }
    }
}

impl Read for FileWindow {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let read = read_at(&self.file, &mut buf[..want], self.offset + self.pos)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for FileWindow {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.length as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before window start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl MediaSource for FileWindow {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Where decoded blocks go, snapshotted per decode iteration
#[derive(Clone)]
struct DeliveryTarget {
    block_frames: usize,
    output: Arc<dyn DecoderOutput>,
}

enum PrepareState {
    Idle,
    Probing,
    Ready(StreamInfo),
    Failed { kind: ErrorKind, message: String },
}

struct DecoderControl {
    source: Option<DataSource>,
    output: Option<DeliveryTarget>,
    prepare: PrepareState,
    playing: bool,
    delivering: bool,
    pending_seek: Option<u32>,
}

struct DecoderShared {
    control: Mutex<DecoderControl>,
    condvar: Condvar,
    stop_flag: AtomicBool,

    /// Decode front: stream time of the next frame to be delivered
    position_ms: AtomicU32,
}

impl DecoderShared {
    fn fail(&self, kind: ErrorKind, message: String) {
        let mut control = self.control.lock().unwrap();
        control.prepare = PrepareState::Failed { kind, message };
        control.delivering = false;
    }

    fn set_delivering(&self, delivering: bool) {
        self.control.lock().unwrap().delivering = delivering;
    }
}

fn frames_to_ms(frames: u64, sample_rate: u32) -> u32 {
    (frames * 1000 / sample_rate as u64) as u32
}

fn time_to_ms(time: Time) -> u32 {
    (time.seconds * 1000 + (time.frac * 1000.0) as u64) as u32
}

fn time_to_frames(time: Time, sample_rate: u32) -> u64 {
    time.seconds * sample_rate as u64 + (time.frac * sample_rate as f64) as u64
}

/// One probed stream: reader, codec decoder, and stream properties
struct DecodeSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_buf: Option<SampleBuffer<i16>>,
    info: StreamInfo,
}

impl DecodeSession {
    /// Decode packets until this track yields samples
    ///
    /// Returns interleaved samples at the native rate and channel count, or
    /// `None` at end of stream. Corrupt packets are skipped.
    fn decode_next(&mut self) -> Result<Option<&[i16]>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(Error::Internal(format!("read packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let needed = decoded.frames() * decoded.spec().channels.count();
                    let recreate = match &self.sample_buf {
                        Some(buf) => buf.capacity() < needed,
                        None => true,
                    };
                    if recreate {
                        self.sample_buf =
                            Some(SampleBuffer::new(decoded.capacity() as u64, *decoded.spec()));
                    }
                    let Some(buf) = self.sample_buf.as_mut() else {
                        return Err(Error::Internal("sample buffer missing".to_string()));
                    };
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(buf.samples()));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("skipping undecodable packet: {}", e);
                    continue;
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Internal(format!("decode: {}", e))),
            }
        }
    }

    /// Reposition the stream; returns the landing position in frames
    fn seek(&mut self, position_ms: u32) -> Result<u64> {
        let time = Time::new(
            position_ms as u64 / 1000,
            (position_ms % 1000) as f64 / 1000.0,
        );
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Internal(format!("seek to {}ms: {}", position_ms, e)))?;
        self.decoder.reset();

        let frame = match self.time_base {
            Some(time_base) => {
                time_to_frames(time_base.calc_time(seeked.actual_ts), self.info.sample_rate)
            }
            None => seeked.actual_ts,
        };
        Ok(frame)
    }
}

/// Open the source and probe it down to a ready-to-decode session
fn open_session(source: DataSource) -> Result<DecodeSession> {
    let mut hint = Hint::new();

    let media: Box<dyn MediaSource> = match source {
        DataSource::Path(path) => {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
            let file = File::open(&path)
                .map_err(|e| Error::ContentNotFound(format!("{}: {}", path.display(), e)))?;
            Box::new(file)
        }
        DataSource::Uri(uri) => {
            let path = uri.strip_prefix("file://").ok_or_else(|| {
                Error::ContentUnsupported(format!("uri scheme not supported: {}", uri))
            })?;
            let path = std::path::Path::new(path);
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
            let file = File::open(path)
                .map_err(|e| Error::ContentNotFound(format!("{}: {}", path.display(), e)))?;
            Box::new(file)
        }
        DataSource::File {
            file,
            offset,
            length,
        } => Box::new(FileWindow::new(file, offset, length)),
    };

    let mss = MediaSourceStream::new(media, Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::ContentUnsupported(format!("probe format: {}", e)))?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::ContentUnsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| Error::ContentUnsupported("sample rate missing".to_string()))?;
    let channels = codec_params
        .channels
        .map(|c| c.count() as u16)
        .ok_or_else(|| Error::ContentUnsupported("channel count missing".to_string()))?;

    let time_base = codec_params.time_base;
    let duration_ms = match (codec_params.n_frames, time_base) {
        (Some(frames), Some(time_base)) => Some(time_to_ms(time_base.calc_time(frames))),
        (Some(frames), None) => Some(frames_to_ms(frames, sample_rate)),
        _ => None,
    };

    let decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| Error::ContentUnsupported(format!("create decoder: {}", e)))?;

    debug!(
        "probed stream: rate={}, channels={}, duration={:?}ms",
        sample_rate, channels, duration_ms
    );

    Ok(DecodeSession {
        format,
        decoder,
        track_id,
        time_base,
        sample_buf: None,
        info: StreamInfo {
            sample_rate,
            channels,
            duration_ms,
        },
    })
}

enum WorkerAction {
    Exit,
    Seek(u32),
    Decode(DeliveryTarget),
}

fn worker_loop(shared: Arc<DecoderShared>) {
    let source = shared.control.lock().unwrap().source.take();
    let Some(source) = source else {
        shared.fail(ErrorKind::IllegalState, "no data source".to_string());
        return;
    };

    let description = source.describe();
    let mut session = match open_session(source) {
        Ok(session) => {
            shared.control.lock().unwrap().prepare = PrepareState::Ready(session.info);
            session
        }
        Err(e) => {
            debug!("probe failed for {}: {}", description, e);
            shared.fail(e.kind(), e.to_string());
            return;
        }
    };

    let rate = session.info.sample_rate;
    let channels = session.info.channels as usize;
    let mut carry: Vec<i16> = Vec::new();
    let mut block_start_frame: u64 = 0;

    loop {
        let action = {
            let mut control = shared.control.lock().unwrap();
            loop {
                if shared.stop_flag.load(Ordering::Relaxed) {
                    break WorkerAction::Exit;
                }
                if let Some(target_ms) = control.pending_seek.take() {
                    break WorkerAction::Seek(target_ms);
                }
                if control.delivering && control.playing {
                    if let Some(target) = control.output.clone() {
                        break WorkerAction::Decode(target);
                    }
                }
                control = shared.condvar.wait(control).unwrap();
            }
        };

        match action {
            WorkerAction::Exit => break,
            WorkerAction::Seek(target_ms) => match session.seek(target_ms) {
                Ok(frame) => {
                    carry.clear();
                    block_start_frame = frame;
                    shared
                        .position_ms
                        .store(frames_to_ms(frame, rate), Ordering::Relaxed);
                    debug!("seek applied: {}ms landed on frame {}", target_ms, frame);
                }
                Err(e) => {
                    warn!("seek failed: {}", e);
                    let target = shared.control.lock().unwrap().output.clone();
                    if let Some(target) = target {
                        target.output.on_error(e);
                    }
                    shared.set_delivering(false);
                }
            },
            WorkerAction::Decode(target) => {
                let block_samples = target.block_frames * channels;
                match session.decode_next() {
                    Ok(Some(samples)) => {
                        carry.extend_from_slice(samples);
                        let mut consumer_stopped = false;
                        while carry.len() >= block_samples && !consumer_stopped {
                            let position = frames_to_ms(block_start_frame, rate);
                            let chunk: Vec<i16> = carry.drain(..block_samples).collect();
                            match target.output.on_block(&chunk, position) {
                                DeliveryControl::Continue => {}
                                DeliveryControl::Stop => consumer_stopped = true,
                            }
                            block_start_frame += target.block_frames as u64;
                        }
                        let buffered = block_start_frame + (carry.len() / channels) as u64;
                        shared
                            .position_ms
                            .store(frames_to_ms(buffered, rate), Ordering::Relaxed);
                        if consumer_stopped {
                            shared.set_delivering(false);
                        }
                    }
                    Ok(None) => {
                        let final_frame = block_start_frame + (carry.len() / channels) as u64;
                        let final_ms = frames_to_ms(final_frame, rate);
                        if !carry.is_empty() {
                            // Zero-pad the final partial block to full size;
                            // the end-of-stream position still names the last
                            // real frame.
                            carry.resize(block_samples, 0);
                            let position = frames_to_ms(block_start_frame, rate);
                            let _ = target.output.on_block(&carry, position);
                            carry.clear();
                        }
                        target.output.on_end_of_stream(final_ms);
                        shared.position_ms.store(final_ms, Ordering::Relaxed);
                        shared.set_delivering(false);
                        debug!("end of stream at {}ms", final_ms);
                    }
                    Err(e) => {
                        warn!("decode failed: {}", e);
                        target.output.on_error(e);
                        shared.set_delivering(false);
                    }
                }
            }
        }
    }
}

/// Decoder backed by a symphonia worker thread
pub struct SymphoniaDecoder {
    shared: Arc<DecoderShared>,
    worker: Option<JoinHandle<()>>,
}

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DecoderShared {
                control: Mutex::new(DecoderControl {
                    source: None,
                    output: None,
                    prepare: PrepareState::Idle,
                    playing: false,
                    delivering: false,
                    pending_seek: None,
                }),
                condvar: Condvar::new(),
                stop_flag: AtomicBool::new(false),
                position_ms: AtomicU32::new(0),
            }),
            worker: None,
        }
    }
}

impl Default for SymphoniaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SymphoniaDecoder {
    fn set_data_source(&mut self, source: DataSource) -> Result<()> {
        let mut control = self.shared.control.lock().unwrap();
        if !matches!(control.prepare, PrepareState::Idle) {
            return Err(Error::IllegalState(
                "data source is fixed once preparing".to_string(),
            ));
        }
        control.source = Some(source);
        Ok(())
    }

    fn set_output(&mut self, block_frames: usize, output: Arc<dyn DecoderOutput>) -> Result<()> {
        if block_frames == 0 {
            return Err(Error::IllegalArgument(
                "block_frames must be non-zero".to_string(),
            ));
        }
        let mut control = self.shared.control.lock().unwrap();
        if control.delivering {
            return Err(Error::IllegalState(
                "output is fixed while delivering".to_string(),
            ));
        }
        control.output = Some(DeliveryTarget {
            block_frames,
            output,
        });
        Ok(())
    }

    fn start_preparing(&mut self) -> Result<()> {
        {
            let mut control = self.shared.control.lock().unwrap();
            if control.source.is_none() {
                return Err(Error::IllegalState("no data source set".to_string()));
            }
            if !matches!(control.prepare, PrepareState::Idle) {
                return Err(Error::IllegalState("already preparing".to_string()));
            }
            control.prepare = PrepareState::Probing;
        }
        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || worker_loop(shared)));
        Ok(())
    }

    fn poll_preparing(&mut self) -> Result<PrepareStatus> {
        let control = self.shared.control.lock().unwrap();
        match &control.prepare {
            PrepareState::Idle => Err(Error::IllegalState("preparation not started".to_string())),
            PrepareState::Probing => Ok(PrepareStatus::NeedRetry),
            PrepareState::Ready(_) => Ok(PrepareStatus::Ready),
            PrepareState::Failed { kind, message } => Err(kind.with_message(message.clone())),
        }
    }

    fn stream_info(&self) -> Result<StreamInfo> {
        let control = self.shared.control.lock().unwrap();
        match control.prepare {
            PrepareState::Ready(info) => Ok(info),
            _ => Err(Error::IllegalState("stream not probed yet".to_string())),
        }
    }

    fn seek_to(&mut self, position_ms: u32) -> Result<()> {
        {
            let mut control = self.shared.control.lock().unwrap();
            if !matches!(control.prepare, PrepareState::Ready(_)) {
                return Err(Error::IllegalState("seek before prepared".to_string()));
            }
            control.pending_seek = Some(position_ms);
        }
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn start_delivery(&mut self) -> Result<()> {
        {
            let mut control = self.shared.control.lock().unwrap();
            if !matches!(control.prepare, PrepareState::Ready(_)) {
                return Err(Error::IllegalState("delivery before prepared".to_string()));
            }
            if control.output.is_none() {
                return Err(Error::IllegalState("no output installed".to_string()));
            }
            if control.delivering {
                return Err(Error::IllegalState("delivery already running".to_string()));
            }
            control.delivering = true;
            control.playing = true;
        }
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.shared.control.lock().unwrap().playing = true;
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.shared.control.lock().unwrap().playing = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.stop_flag.store(true, Ordering::Relaxed);
        {
            let mut control = self.shared.control.lock().unwrap();
            control.delivering = false;
            control.playing = false;
        }
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                return Err(Error::Internal("decoder worker panicked".to_string()));
            }
        }
        Ok(())
    }

    fn duration_ms(&self) -> Option<u32> {
        let control = self.shared.control.lock().unwrap();
        match control.prepare {
            PrepareState::Ready(info) => info.duration_ms,
            _ => None,
        }
    }

    fn current_position_ms(&self) -> u32 {
        self.shared.position_ms.load(Ordering::Relaxed)
    }

    fn buffered_position_ms(&self) -> u32 {
        self.shared.position_ms.load(Ordering::Relaxed)
    }
}

impl Drop for SymphoniaDecoder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Factory handing out fresh symphonia sessions
pub struct SymphoniaDecoderFactory;

impl SymphoniaDecoderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SymphoniaDecoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderFactory for SymphoniaDecoderFactory {
    fn create(&self) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(SymphoniaDecoder::new()))
    }
}
