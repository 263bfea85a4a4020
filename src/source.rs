//! One playback stream: decoder session, format adapter, source pipe
//!
//! An [`AudioSource`] ties a [`Decoder`](crate::backend::Decoder) session to
//! one source pipe. Preparation walks an explicit phase chain, one phase per
//! `poll_prepare` call, so the control thread never blocks on decoder I/O.
//! Once delivery starts, the decode thread pushes blocks through the
//! [`FormatAdapter`] into the pipe via [`PipeWriter`], backing off with a
//! bounded timed wait when the pipe is full.

use crate::adapter::{AdapterSpec, FormatAdapter, STANDARD_RATES};
use crate::backend::{
    DataSource, Decoder, DecoderFactory, DecoderOutput, DeliveryControl, PrepareStatus, StreamInfo,
};
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::pipe::{
    BlockTag, PipeManager, PortDirection, PortUser, RecycledBlock, SourcePipe,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Why a source is being prepared; decides where the player files it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareReason {
    /// First playback of the stream, or resume-from-stop
    Start,

    /// Replacement stream for a debounced seek
    Seek,

    /// Stream restarted from the top ahead of a loop handoff
    Rewind,
}

/// Preparation phase chain, advanced one step per `poll_prepare`
///
/// `None` is the torn-down/idle value; a freshly created source starts at
/// `MakeSource`. The two `Wait*` phases repeat until their data is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparePhase {
    None,
    MakeSource,
    SetupCallbacks,
    StartDecoderPrefetch,
    WaitDecoderPrefetch,
    GetMetadata,
    CreateFormatAdapter,
    SeekToInitialPosition,
    SetupDecoderQueue,
    StartQueuePrefetch,
    WaitQueuePrefetch,
    Completed,
}

/// State behind the writer mutex; touched by the decode thread per callback
/// and by the control thread during prepare
struct WriterInner {
    adapter: Option<FormatAdapter>,
    pipe: Option<Arc<SourcePipe>>,

    /// Stream position of the first delivered input block; output positions
    /// are derived from it
    base_ms: Option<u32>,

    /// Output frames pushed (or dropped) so far
    out_frames: u64,

    error: Option<(ErrorKind, String)>,
}

/// Outcome of claiming a free pipe block under backoff
enum Claim {
    Block(crate::pipe::Block),
    Dropped,
    Stopped,
}

/// Decode-thread side of an [`AudioSource`]
///
/// Implements [`DecoderOutput`]: adapts each delivered block and writes the
/// results into the source pipe. When the pipe is full the push waits on a
/// condition variable with a bounded retry count; exhausting the retries
/// drops the output block so the decode thread can never deadlock against a
/// stalled consumer.
struct PipeWriter {
    inner: Mutex<WriterInner>,
    space: Condvar,

    /// Set by `stop`; every wait loop re-checks it on wake
    stopped: AtomicBool,

    /// The end-of-data block (or its dropped substitute) has been issued
    eos_seen: AtomicBool,

    /// Sampled at end-of-stream to pick the end-of-data tag
    looping: AtomicBool,

    /// Stream position of the most recently recycled audio block
    last_recycled_ms: AtomicU32,
    has_recycled: AtomicBool,

    dropped_blocks: AtomicU64,

    output_rate: u32,
    output_block_frames: usize,
    max_retries: u32,
    retry_wait: Duration,
}

impl PipeWriter {
    fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Mutex::new(WriterInner {
                adapter: None,
                pipe: None,
                base_ms: None,
                out_frames: 0,
                error: None,
            }),
            space: Condvar::new(),
            stopped: AtomicBool::new(false),
            eos_seen: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            last_recycled_ms: AtomicU32::new(0),
            has_recycled: AtomicBool::new(false),
            dropped_blocks: AtomicU64::new(0),
            output_rate: config.output_sample_rate,
            output_block_frames: config.block_frames,
            max_retries: config.producer_max_retries,
            retry_wait: config.producer_retry_wait(),
        }
    }

    fn install_adapter(&self, adapter: FormatAdapter) {
        self.inner.lock().unwrap().adapter = Some(adapter);
    }

    fn install_pipe(&self, pipe: Arc<SourcePipe>) {
        self.inner.lock().unwrap().pipe = Some(pipe);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.space.notify_all();
    }

    fn notify_space(&self) {
        self.space.notify_all();
    }

    fn is_eos_seen(&self) -> bool {
        self.eos_seen.load(Ordering::Relaxed)
    }

    fn take_error(&self) -> Option<Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .error
            .take()
            .map(|(kind, message)| kind.with_message(message))
    }

    fn record_error(&self, error: &Error) {
        let mut inner = self.inner.lock().unwrap();
        if inner.error.is_none() {
            inner.error = Some((error.kind(), error.to_string()));
        }
    }

    /// Stream position of the next output block, from the delivery base
    fn next_position(inner: &WriterInner, output_rate: u32) -> u32 {
        let base = inner.base_ms.unwrap_or(0);
        base + (inner.out_frames * 1000 / output_rate as u64) as u32
    }

    /// Claim a free block, waiting up to `max_retries` timed waits
    fn claim_block<'a>(
        &self,
        mut inner: MutexGuard<'a, WriterInner>,
        pipe: &SourcePipe,
    ) -> (MutexGuard<'a, WriterInner>, Claim) {
        let mut retries = 0;
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                return (inner, Claim::Stopped);
            }
            if let Some(block) = pipe.lock_write(0) {
                return (inner, Claim::Block(block));
            }
            if retries >= self.max_retries {
                return (inner, Claim::Dropped);
            }
            retries += 1;
            let (guard, _timeout) = self.space.wait_timeout(inner, self.retry_wait).unwrap();
            inner = guard;
        }
    }

    /// Move every ready adapter output block into the pipe
    fn drain_ready<'a>(
        &self,
        mut inner: MutexGuard<'a, WriterInner>,
    ) -> (MutexGuard<'a, WriterInner>, DeliveryControl) {
        loop {
            let ready = inner
                .adapter
                .as_ref()
                .map(|a| a.is_output_data_ready())
                .unwrap_or(false);
            if !ready {
                return (inner, DeliveryControl::Continue);
            }
            // Before the pipe is installed (decoder prefetch), ready output
            // stays staged in the adapter
            let Some(pipe) = inner.pipe.clone() else {
                return (inner, DeliveryControl::Continue);
            };

            let (guard, claim) = self.claim_block(inner, &pipe);
            inner = guard;
            match claim {
                Claim::Stopped => return (inner, DeliveryControl::Stop),
                Claim::Dropped => {
                    // Pull the block into scratch and discard it so the
                    // adapter can accept further input; position still
                    // advances past the lost audio
                    let mut scratch = vec![0.0f32; self.output_block_frames * 2];
                    if let Some(adapter) = inner.adapter.as_mut() {
                        if let Err(e) = adapter.get_output_data(&mut scratch) {
                            self.fail_locked(&mut inner, e);
                            return (inner, DeliveryControl::Stop);
                        }
                    }
                    inner.out_frames += self.output_block_frames as u64;
                    let dropped = self.dropped_blocks.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "source pipe {} full after {} retries, block dropped ({} total)",
                        pipe.index(),
                        self.max_retries,
                        dropped
                    );
                }
                Claim::Block(mut block) => {
                    let position = Self::next_position(&inner, self.output_rate);
                    if let Some(adapter) = inner.adapter.as_mut() {
                        if let Err(e) = adapter.get_output_data(block.samples_mut()) {
                            block.zero_fill();
                            pipe.unlock_write(block, BlockTag::AudioData, position);
                            self.fail_locked(&mut inner, e);
                            return (inner, DeliveryControl::Stop);
                        }
                    }
                    inner.out_frames += self.output_block_frames as u64;
                    pipe.unlock_write(block, BlockTag::AudioData, position);
                }
            }
        }
    }

    fn fail_locked(&self, inner: &mut WriterInner, error: Error) {
        warn!("pipe writer failed: {}", error);
        if inner.error.is_none() {
            inner.error = Some((error.kind(), error.to_string()));
        }
    }
}

impl DecoderOutput for PipeWriter {
    fn on_block(&self, samples: &[i16], position_ms: u32) -> DeliveryControl {
        if self.stopped.load(Ordering::Relaxed) {
            return DeliveryControl::Stop;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.base_ms.is_none() {
            inner.base_ms = Some(position_ms);
        }
        match inner.adapter.as_mut() {
            Some(adapter) => {
                if let Err(e) = adapter.put_input_data(samples) {
                    self.fail_locked(&mut inner, e);
                    return DeliveryControl::Stop;
                }
            }
            None => {
                warn!("decoded block before adapter install, dropped");
                return DeliveryControl::Continue;
            }
        }
        let (_inner, control) = self.drain_ready(inner);
        control
    }

    fn on_end_of_stream(&self, position_ms: u32) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(adapter) = inner.adapter.as_mut() {
            if let Err(e) = adapter.flush() {
                self.fail_locked(&mut inner, e);
                self.eos_seen.store(true, Ordering::Relaxed);
                return;
            }
        }

        // The flush may leave several tail blocks ready
        let (guard, control) = self.drain_ready(inner);
        inner = guard;
        if matches!(control, DeliveryControl::Stop) {
            self.eos_seen.store(true, Ordering::Relaxed);
            return;
        }

        let Some(pipe) = inner.pipe.clone() else {
            self.eos_seen.store(true, Ordering::Relaxed);
            return;
        };
        let (guard, claim) = self.claim_block(inner, &pipe);
        inner = guard;
        match claim {
            Claim::Block(mut block) => {
                let tag = if self.looping.load(Ordering::Relaxed) {
                    BlockTag::EndOfDataWithLoopPoint
                } else {
                    BlockTag::EndOfData
                };
                block.zero_fill();
                pipe.unlock_write(block, tag, position_ms);
                debug!(
                    "source pipe {}: end of data at {}ms ({:?})",
                    pipe.index(),
                    position_ms,
                    tag
                );
            }
            Claim::Dropped => {
                // Without the marker the mixer never sees completion
                error!(
                    "source pipe {} full, end-of-data marker lost",
                    pipe.index()
                );
                self.dropped_blocks.fetch_add(1, Ordering::Relaxed);
            }
            Claim::Stopped => {}
        }
        drop(inner);
        self.eos_seen.store(true, Ordering::Relaxed);
    }

    fn on_error(&self, error: Error) {
        warn!("decoder reported: {}", error);
        self.record_error(&error);
    }
}

/// One decoder session bound to one source pipe
pub struct AudioSource {
    factory: Arc<dyn DecoderFactory>,
    data_source: Option<DataSource>,
    decoder: Option<Box<dyn Decoder>>,
    writer: Arc<PipeWriter>,
    manager: Arc<PipeManager>,
    pipe: Option<Arc<SourcePipe>>,
    phase: PreparePhase,
    reason: PrepareReason,
    initial_position_ms: u32,
    stream_info: Option<StreamInfo>,

    block_frames: usize,
    output_rate: u32,
    prefetch_blocks: usize,
    quality: crate::config::ResampleQuality,
}

impl AudioSource {
    pub fn new(
        config: &EngineConfig,
        manager: Arc<PipeManager>,
        factory: Arc<dyn DecoderFactory>,
        data_source: DataSource,
        initial_position_ms: u32,
        reason: PrepareReason,
        looping: bool,
    ) -> Self {
        let writer = Arc::new(PipeWriter::new(config));
        writer.looping.store(looping, Ordering::Relaxed);
        Self {
            factory,
            data_source: Some(data_source),
            decoder: None,
            writer,
            manager,
            pipe: None,
            phase: PreparePhase::MakeSource,
            reason,
            initial_position_ms,
            stream_info: None,
            block_frames: config.block_frames,
            output_rate: config.output_sample_rate,
            prefetch_blocks: config.prefetch_blocks,
            quality: config.resample_quality,
        }
    }

    pub fn phase(&self) -> PreparePhase {
        self.phase
    }

    pub fn is_prepared(&self) -> bool {
        self.phase == PreparePhase::Completed
    }

    pub fn reason(&self) -> PrepareReason {
        self.reason
    }

    pub fn initial_position_ms(&self) -> u32 {
        self.initial_position_ms
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info
    }

    pub fn pipe(&self) -> Option<Arc<SourcePipe>> {
        self.pipe.clone()
    }

    pub fn pipe_index(&self) -> Option<usize> {
        self.pipe.as_ref().map(|p| p.index())
    }

    /// Flip the flag the end-of-stream callback samples when tagging the
    /// end-of-data block
    pub fn set_looping(&self, looping: bool) {
        self.writer.looping.store(looping, Ordering::Relaxed);
    }

    pub fn duration_ms(&self) -> Option<u32> {
        self.decoder.as_ref().and_then(|d| d.duration_ms())
    }

    /// How far decode has run ahead, in stream time
    pub fn buffered_position_ms(&self) -> u32 {
        self.decoder
            .as_ref()
            .map(|d| d.buffered_position_ms())
            .unwrap_or(self.initial_position_ms)
    }

    /// Stream position actually consumed by the mixer, learned from block
    /// recycling; before any block comes back this is the initial position
    pub fn playback_position_ms(&self) -> u32 {
        if self.writer.has_recycled.load(Ordering::Relaxed) {
            self.writer.last_recycled_ms.load(Ordering::Relaxed)
        } else {
            self.initial_position_ms
        }
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.writer.dropped_blocks.load(Ordering::Relaxed)
    }

    /// Surface an error recorded by the decode thread
    pub fn take_error(&self) -> Option<Error> {
        self.writer.take_error()
    }

    fn decoder_mut(&mut self) -> Result<&mut Box<dyn Decoder>> {
        self.decoder
            .as_mut()
            .ok_or_else(|| Error::IllegalState("decoder not created".to_string()))
    }

    /// Advance preparation by one phase
    ///
    /// Returns `Ready` once the phase chain reaches `Completed`; `NeedRetry`
    /// while work remains. A failure leaves the phase where it was; callers
    /// tear the source down via [`stop_decoder`](Self::stop_decoder).
    pub fn poll_prepare(&mut self) -> Result<PrepareStatus> {
        if let Some(error) = self.writer.take_error() {
            return Err(error);
        }

        match self.phase {
            PreparePhase::None => {
                return Err(Error::IllegalState("source torn down".to_string()));
            }
            PreparePhase::MakeSource => {
                let mut decoder = self.factory.create()?;
                let data_source = self
                    .data_source
                    .take()
                    .ok_or_else(|| Error::IllegalState("no data source".to_string()))?;
                decoder.set_data_source(data_source)?;
                self.decoder = Some(decoder);
                self.phase = PreparePhase::SetupCallbacks;
            }
            PreparePhase::SetupCallbacks => {
                let output: Arc<dyn DecoderOutput> = self.writer.clone();
                let block_frames = self.block_frames;
                self.decoder_mut()?.set_output(block_frames, output)?;
                self.phase = PreparePhase::StartDecoderPrefetch;
            }
            PreparePhase::StartDecoderPrefetch => {
                self.decoder_mut()?.start_preparing()?;
                self.phase = PreparePhase::WaitDecoderPrefetch;
            }
            PreparePhase::WaitDecoderPrefetch => match self.decoder_mut()?.poll_preparing()? {
                PrepareStatus::NeedRetry => return Ok(PrepareStatus::NeedRetry),
                PrepareStatus::Ready => self.phase = PreparePhase::GetMetadata,
            },
            PreparePhase::GetMetadata => {
                let info = self.decoder_mut()?.stream_info()?;
                if !STANDARD_RATES.contains(&info.sample_rate) {
                    return Err(Error::ContentUnsupported(format!(
                        "sample rate {} outside supported set",
                        info.sample_rate
                    )));
                }
                if info.channels != 1 && info.channels != 2 {
                    return Err(Error::ContentUnsupported(format!(
                        "{} channels (only mono and stereo play)",
                        info.channels
                    )));
                }
                self.stream_info = Some(info);
                self.phase = PreparePhase::CreateFormatAdapter;
            }
            PreparePhase::CreateFormatAdapter => {
                let info = self
                    .stream_info
                    .ok_or_else(|| Error::IllegalState("metadata missing".to_string()))?;
                let adapter = FormatAdapter::new(AdapterSpec {
                    input_rate: info.sample_rate,
                    input_channels: info.channels,
                    output_rate: self.output_rate,
                    input_block_frames: self.block_frames,
                    output_block_frames: self.block_frames,
                    quality: self.quality,
                })?;
                self.writer.install_adapter(adapter);
                self.phase = PreparePhase::SeekToInitialPosition;
            }
            PreparePhase::SeekToInitialPosition => {
                if self.initial_position_ms > 0 {
                    let position = self.initial_position_ms;
                    self.decoder_mut()?.seek_to(position)?;
                }
                self.phase = PreparePhase::SetupDecoderQueue;
            }
            PreparePhase::SetupDecoderQueue => {
                let pipe = self.manager.obtain_source_pipe()?;
                self.manager.set_source_pipe_port_user(
                    &pipe,
                    PortDirection::Input,
                    PortUser::AudioSource,
                    true,
                );
                self.writer.install_pipe(pipe.clone());
                debug!(
                    "source prepared on pipe {} ({:?}, from {}ms)",
                    pipe.index(),
                    self.reason,
                    self.initial_position_ms
                );
                self.pipe = Some(pipe);
                self.phase = PreparePhase::StartQueuePrefetch;
            }
            PreparePhase::StartQueuePrefetch => {
                self.decoder_mut()?.start_delivery()?;
                self.phase = PreparePhase::WaitQueuePrefetch;
            }
            PreparePhase::WaitQueuePrefetch => {
                let filled = self.pipe.as_ref().map(|p| p.filled_len()).unwrap_or(0);
                if filled >= self.prefetch_blocks || self.writer.is_eos_seen() {
                    // Hold the decoder until the mixer actually starts
                    // consuming; prefetched blocks cover the gap
                    self.decoder_mut()?.pause()?;
                    self.phase = PreparePhase::Completed;
                    return Ok(PrepareStatus::Ready);
                }
                return Ok(PrepareStatus::NeedRetry);
            }
            PreparePhase::Completed => return Ok(PrepareStatus::Ready),
        }
        Ok(PrepareStatus::NeedRetry)
    }

    /// Resume decode delivery; driven by the mixer's started notification
    pub fn start_decoder(&mut self) -> Result<()> {
        self.decoder_mut()?.start()
    }

    /// Halt decode delivery; driven by the mixer's stopped notification
    pub fn pause_decoder(&mut self) -> Result<()> {
        self.decoder_mut()?.pause()
    }

    /// Immediate, idempotent teardown
    ///
    /// Unblocks any producer wait first, then joins the decoder and releases
    /// the pipe input claim. The mixer's output claim (if any) is not ours to
    /// touch; the pipe resets once both sides let go.
    pub fn stop_decoder(&mut self) {
        self.writer.stop();
        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.stop() {
                warn!("decoder stop: {}", e);
            }
        }
        if let Some(pipe) = self.pipe.take() {
            self.manager.set_source_pipe_port_user(
                &pipe,
                PortDirection::Input,
                PortUser::AudioSource,
                false,
            );
        }
        self.phase = PreparePhase::None;
    }

    /// Recycled-block fan-in from the pipe manager
    ///
    /// Blocks from other pipes are ignored. Audio blocks move the playback
    /// position; any return also frees pipe space, so waiting producers are
    /// woken unconditionally.
    pub fn on_recycle(&self, item: &RecycledBlock) {
        let Some(index) = self.pipe_index() else {
            return;
        };
        if item.pipe_index != index {
            return;
        }
        if item.tag == BlockTag::AudioData {
            self.writer
                .last_recycled_ms
                .store(item.position_ms, Ordering::Relaxed);
            self.writer.has_recycled.store(true, Ordering::Relaxed);
        }
        self.writer.notify_space();
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("phase", &self.phase)
            .field("reason", &self.reason)
            .field("initial_position_ms", &self.initial_position_ms)
            .field("pipe", &self.pipe_index())
            .finish()
    }
}
