//! Render-path mixing
//!
//! Everything here runs on the audio callback thread. [`MixerRender`] pulls
//! blocks from started source pipes, applies per-slot gain ramps, sums into
//! one sink block, and evaluates triggers and stop conditions inline so that
//! loop and handoff boundaries land sample-aligned. [`SinkFeed`] adapts the
//! block-sized pipeline to the device's arbitrary buffer sizes.
//!
//! ## Control boundary
//!
//! ```text
//!            commands (SPSC)                events (SPSC)
//!  AudioMixer ─────────────► MixerRender ─────────────► AudioMixer::poll
//!  (control thread)          (callback thread)          (control thread)
//! ```
//!
//! Commands drain at the top of every render iteration, so one `Apply`
//! batch is always observed whole. The render path takes no lock other than
//! the short queue-endpoint mutexes inside the pipes.

use crate::mixer::slot::{
    FadeDuration, MixMode, MixerNotification, MixingStartCause, MixingStopCause,
    RenderCommand, SlotOperation, SlotUpdate, SourceClientHandle, StopConditions,
    TriggerConfig,
};
use crate::pipe::{Block, BlockTag, CapturePipe, SinkPipe, SourcePipe, TagMask};
use ringbuf::{traits::*, HeapCons, HeapProd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Geometry and fade timing resolved from the engine config
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderConfig {
    pub slot_count: usize,
    pub block_frames: usize,
    pub short_fade_frames: u32,
    pub long_fade_frames: u32,
}

impl RenderConfig {
    fn fade_step(&self, duration: FadeDuration) -> f32 {
        let frames = match duration {
            FadeDuration::Short => self.short_fade_frames,
            FadeDuration::Long => self.long_fade_frames,
        };
        1.0 / frames.max(1) as f32
    }
}

/// Per-slot state owned by the render thread
struct RenderSlot {
    registered: bool,
    sequence_no: u32,
    client_id: u32,
    pipe: Option<Arc<SourcePipe>>,
    started: bool,
    mode: MixMode,
    /// Fade gain, 0..1; persists across blocks and mode changes
    phase: f32,
    /// Per-frame phase increment for the current fade duration
    fade_step: f32,
    volume_left: f32,
    volume_right: f32,
    stop_conditions: StopConditions,
    loop_trigger: Option<TriggerConfig>,
    no_loop_trigger: Option<TriggerConfig>,
}

impl RenderSlot {
    fn vacant() -> Self {
        Self {
            registered: false,
            sequence_no: 0,
            client_id: 0,
            pipe: None,
            started: false,
            mode: MixMode::Add,
            phase: 1.0,
            fade_step: 0.0,
            volume_left: 1.0,
            volume_right: 1.0,
            stop_conditions: StopConditions::NONE,
            loop_trigger: None,
            no_loop_trigger: None,
        }
    }

    fn handle(&self, index: usize) -> SourceClientHandle {
        SourceClientHandle {
            index: index as u32,
            sequence_no: self.sequence_no,
            client_id: self.client_id,
        }
    }
}

/// Result of one render attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderOutcome {
    /// One sink block was produced
    Rendered,

    /// Not running; nothing produced
    Idle,

    /// Sink pipe has no free block
    NoSpace,
}

pub(crate) struct MixerRender {
    config: RenderConfig,
    slots: Vec<RenderSlot>,
    sink: Arc<SinkPipe>,
    capture: Arc<CapturePipe>,
    commands: HeapCons<RenderCommand>,
    events: HeapProd<MixerNotification>,
    running: bool,
    muted: bool,
    /// Shared with the control side, which logs when it grows
    lost_events: Arc<AtomicU64>,
}

impl MixerRender {
    pub(crate) fn new(
        config: RenderConfig,
        sink: Arc<SinkPipe>,
        capture: Arc<CapturePipe>,
        commands: HeapCons<RenderCommand>,
        events: HeapProd<MixerNotification>,
        lost_events: Arc<AtomicU64>,
    ) -> Self {
        let slots = (0..config.slot_count).map(|_| RenderSlot::vacant()).collect();
        Self {
            config,
            slots,
            sink,
            capture,
            commands,
            events,
            running: false,
            muted: false,
            lost_events,
        }
    }

    pub(crate) fn drain_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                RenderCommand::Register {
                    index,
                    sequence_no,
                    client_id,
                } => {
                    if let Some(slot) = self.slots.get_mut(index as usize) {
                        *slot = RenderSlot::vacant();
                        slot.registered = true;
                        slot.sequence_no = sequence_no;
                        slot.client_id = client_id;
                    }
                }
                RenderCommand::Unregister { index } => {
                    if let Some(slot) = self.slots.get_mut(index as usize) {
                        *slot = RenderSlot::vacant();
                    }
                }
                RenderCommand::Apply(updates) => {
                    for update in updates {
                        self.apply_update(update);
                    }
                }
                RenderCommand::SetRunning(running) => {
                    self.running = running;
                }
                RenderCommand::SetMuted(muted) => {
                    self.muted = muted;
                }
            }
        }
    }

    fn apply_update(&mut self, update: SlotUpdate) {
        let index = update.handle.index as usize;
        let fade_step = self.config.fade_step(update.params.duration);
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        // Stale handles (unregistered or reused slot) are dropped silently;
        // the control side validated before sending, so this only happens
        // when an unregister raced an in-flight batch.
        if !slot.registered || slot.sequence_no != update.handle.sequence_no {
            return;
        }

        if let Some(pipe) = update.params.pipe {
            slot.pipe = Some(pipe);
        }
        slot.mode = update.params.mode;
        slot.fade_step = fade_step;
        slot.volume_left = update.params.volume_left;
        slot.volume_right = update.params.volume_right;
        slot.stop_conditions = update.params.stop_conditions;
        slot.loop_trigger = update.params.loop_trigger;
        slot.no_loop_trigger = update.params.no_loop_trigger;
        if let Some(phase) = update.params.mix_phase {
            slot.phase = phase.clamp(0.0, 1.0);
        }

        let handle = slot.handle(index);
        let mut pending: Option<MixerNotification> = None;
        match update.operation {
            SlotOperation::None => {}
            SlotOperation::Start => {
                if !slot.started && slot.pipe.is_some() {
                    slot.started = true;
                    pending = Some(MixerNotification::Started {
                        handle,
                        cause: MixingStartCause::StartOperation,
                    });
                }
            }
            SlotOperation::Stop => {
                if slot.started {
                    slot.started = false;
                    pending = Some(MixerNotification::Stopped {
                        handle,
                        cause: MixingStopCause::StopOperation,
                    });
                }
            }
            SlotOperation::Detach => {
                slot.started = false;
                slot.pipe = None;
                slot.loop_trigger = None;
                slot.no_loop_trigger = None;
                // Always confirmed, started or not: the control side keys
                // port-claim release off this event.
                pending = Some(MixerNotification::Stopped {
                    handle,
                    cause: MixingStopCause::DetachOperation,
                });
            }
        }
        if let Some(event) = pending {
            self.emit(event);
        }
    }

    /// Produce one sink block if running and the sink pipe has room
    pub(crate) fn render_once(&mut self) -> RenderOutcome {
        self.drain_commands();
        if !self.running {
            return RenderOutcome::Idle;
        }
        let Some(mut block) = self.sink.lock_write(0) else {
            return RenderOutcome::NoSpace;
        };
        block.zero_fill();

        let mut position_ms: Option<u32> = None;
        for index in 0..self.slots.len() {
            let retriggered = self.mix_slot(index, &mut block, &mut position_ms, true);
            if let Some(target) = retriggered {
                // A trigger started `target` at the boundary; give it its
                // first audio inside this same output block so the handoff
                // has no silent block. Nested end-of-data waits a block.
                if target <= index {
                    self.mix_slot(target, &mut block, &mut position_ms, false);
                }
            }
        }

        let position = position_ms.unwrap_or(0);
        // The engine-wide mute gates the finished block; sources were
        // already consumed, so playback position keeps advancing.
        if self.muted {
            block.zero_fill();
        }
        if self.capture.is_allocated() {
            self.capture.write_captured(block.samples(), position);
        }
        self.sink.unlock_write(block, BlockTag::AudioData, position);
        RenderOutcome::Rendered
    }

    /// Mix one slot's next block into the sink block
    ///
    /// Returns the index of a slot the end-of-data trigger just started,
    /// when one fired. With `handle_end_of_data` false only plain audio is
    /// consumed (used for the immediate post-trigger pass).
    fn mix_slot(
        &mut self,
        index: usize,
        out: &mut Block,
        position_ms: &mut Option<u32>,
        handle_end_of_data: bool,
    ) -> Option<usize> {
        let slot = &self.slots[index];
        if !slot.registered || !slot.started {
            return None;
        }
        let Some(pipe) = slot.pipe.clone() else {
            return None;
        };

        let mask = if handle_end_of_data {
            TagMask::PLAYABLE
        } else {
            TagMask::AUDIO_DATA
        };
        match pipe.lock_read(0, mask) {
            Some(src) if src.tag == BlockTag::AudioData => {
                if position_ms.is_none() {
                    *position_ms = Some(src.position_ms);
                }
                accumulate(&mut self.slots[index], src.samples(), out.samples_mut());
                pipe.unlock_read(src);
                self.check_fade_out_complete(index);
                None
            }
            Some(src) => {
                // End-of-data marker; carries position, no audio
                let tag = src.tag;
                pipe.unlock_read(src);
                self.fire_end_of_data(index, tag)
            }
            None => {
                // Underrun: contributes silence, fade time still passes
                advance_phase(&mut self.slots[index], self.config.block_frames);
                self.check_fade_out_complete(index);
                None
            }
        }
    }

    /// Resolve an end-of-data boundary against the slot's triggers
    ///
    /// Returns the slot index a trigger started, if any.
    fn fire_end_of_data(&mut self, index: usize, tag: BlockTag) -> Option<usize> {
        let looped = tag == BlockTag::EndOfDataWithLoopPoint;
        let trigger = if looped {
            self.slots[index].loop_trigger.take()
        } else {
            self.slots[index].no_loop_trigger.take()
        };
        let source_handle = self.slots[index].handle(index);

        let trigger = trigger.filter(|t| self.trigger_target_usable(t, index));
        let Some(trigger) = trigger else {
            // No trigger armed (or its target went away). A with-loop-point
            // completion landing here is the tolerated inconsistency; the
            // control side logs it when it sees the stop cause.
            let cause = if looped {
                MixingStopCause::EndOfDataWithLoopPoint
            } else {
                MixingStopCause::EndOfData
            };
            if self.slots[index]
                .stop_conditions
                .contains(StopConditions::ON_PLAYBACK_END)
            {
                self.slots[index].started = false;
                self.emit(MixerNotification::Stopped {
                    handle: source_handle,
                    cause,
                });
            }
            return None;
        };

        let (stop_cause, start_cause) = if looped {
            (MixingStopCause::LoopTriggered, MixingStartCause::LoopTriggered)
        } else {
            (
                MixingStopCause::NoLoopTriggered,
                MixingStartCause::NoLoopTriggered,
            )
        };
        let target_index = trigger.target.index as usize;
        let fade_step = self.config.fade_step(trigger.duration);

        if target_index != index {
            self.slots[index].started = false;
        }
        self.emit(MixerNotification::Stopped {
            handle: source_handle,
            cause: stop_cause,
        });

        let target_handle = trigger.target;
        let target = &mut self.slots[target_index];
        target.pipe = Some(trigger.pipe);
        target.started = true;
        target.mode = trigger.mode;
        target.fade_step = fade_step;
        target.phase = match trigger.mode {
            MixMode::FadeIn => 0.0,
            _ => 1.0,
        };
        self.emit(MixerNotification::Started {
            handle: target_handle,
            cause: start_cause,
        });
        Some(target_index)
    }

    /// A trigger may fire only at a registered, same-generation target that
    /// is not already mixing other content (unless it is the firing slot
    /// itself, the loop case)
    fn trigger_target_usable(&self, trigger: &TriggerConfig, source_index: usize) -> bool {
        let index = trigger.target.index as usize;
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if !slot.registered || slot.sequence_no != trigger.target.sequence_no {
            return false;
        }
        index == source_index || !slot.started
    }

    fn check_fade_out_complete(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.mode != MixMode::FadeOut || slot.phase > 0.0 {
            return;
        }
        if slot
            .stop_conditions
            .contains(StopConditions::AFTER_FADE_OUT)
        {
            slot.started = false;
            let handle = slot.handle(index);
            self.emit(MixerNotification::Stopped {
                handle,
                cause: MixingStopCause::FadedOut,
            });
        } else {
            slot.mode = MixMode::Mute;
        }
    }

    fn emit(&mut self, event: MixerNotification) {
        if self.events.try_push(event).is_err() {
            self.lost_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn slot_started(&self, index: usize) -> bool {
        self.slots[index].started
    }
}

/// Sum one source block into the sink block under the slot's mode
fn accumulate(slot: &mut RenderSlot, input: &[f32], out: &mut [f32]) {
    let n = input.len().min(out.len());
    match slot.mode {
        MixMode::Mute => {
            // Consumed but not heard; playback time still advances
        }
        MixMode::Add => {
            for (o, i) in out[..n].chunks_exact_mut(2).zip(input[..n].chunks_exact(2)) {
                o[0] += i[0] * slot.volume_left;
                o[1] += i[1] * slot.volume_right;
            }
        }
        MixMode::FadeIn | MixMode::FadeOut => {
            let rising = slot.mode == MixMode::FadeIn;
            for (o, i) in out[..n].chunks_exact_mut(2).zip(input[..n].chunks_exact(2)) {
                o[0] += i[0] * slot.phase * slot.volume_left;
                o[1] += i[1] * slot.phase * slot.volume_right;
                if rising {
                    slot.phase = (slot.phase + slot.fade_step).min(1.0);
                } else {
                    slot.phase = (slot.phase - slot.fade_step).max(0.0);
                }
            }
            if rising && slot.phase >= 1.0 {
                slot.mode = MixMode::Add;
            }
        }
    }
}

/// Advance a fading slot's phase by whole-block time without audio
fn advance_phase(slot: &mut RenderSlot, frames: usize) {
    match slot.mode {
        MixMode::FadeIn => {
            slot.phase = (slot.phase + slot.fade_step * frames as f32).min(1.0);
            if slot.phase >= 1.0 {
                slot.mode = MixMode::Add;
            }
        }
        MixMode::FadeOut => {
            slot.phase = (slot.phase - slot.fade_step * frames as f32).max(0.0);
        }
        _ => {}
    }
}

struct FeedInner {
    render: MixerRender,
    sink: Arc<SinkPipe>,
    /// Partially consumed sink block carried across callbacks
    current: Option<Block>,
    offset: usize,
}

impl FeedInner {
    fn next_block(&mut self) -> Option<Block> {
        loop {
            if let Some(block) = self.sink.lock_read() {
                return Some(block);
            }
            match self.render.render_once() {
                RenderOutcome::Rendered => continue,
                RenderOutcome::Idle | RenderOutcome::NoSpace => return None,
            }
        }
    }
}

/// Cloneable handle over the render state
///
/// The sink backend calls [`fill`](SinkFeed::fill) from its data callback;
/// the mixer keeps a clone to pump queued commands while the device is not
/// pulling. The mutex is uncontended except across those two.
#[derive(Clone)]
pub struct SinkFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl std::fmt::Debug for SinkFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkFeed").finish_non_exhaustive()
    }
}

impl SinkFeed {
    pub(crate) fn new(render: MixerRender, sink: Arc<SinkPipe>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                render,
                sink,
                current: None,
                offset: 0,
            })),
        }
    }

    /// Fill a device buffer with interleaved stereo samples
    ///
    /// Renders on demand; outputs silence whenever the mixer is stopped,
    /// suspended, or underrun.
    pub fn fill(&self, out: &mut [f32]) {
        let mut inner = self.inner.lock().unwrap();
        let mut written = 0;
        while written < out.len() {
            if inner.current.is_none() {
                match inner.next_block() {
                    Some(block) => {
                        inner.current = Some(block);
                        inner.offset = 0;
                    }
                    None => break,
                }
            }
            let offset = inner.offset;
            let (n, samples_len) = {
                let block = inner.current.as_ref().unwrap();
                let samples = block.samples();
                let n = (samples.len() - offset).min(out.len() - written);
                out[written..written + n].copy_from_slice(&samples[offset..offset + n]);
                (n, samples.len())
            };
            written += n;
            inner.offset += n;
            let finished = inner.offset >= samples_len;
            if finished {
                let block = inner.current.take().unwrap();
                inner.sink.unlock_read(block);
            }
        }
        out[written..].fill(0.0);
    }

    /// Drain pending control commands without producing audio
    ///
    /// Keeps configuration moving while the device callback is paused.
    pub(crate) fn pump(&self) {
        self.inner.lock().unwrap().render.drain_commands();
    }
}

// ======== Tests ========
