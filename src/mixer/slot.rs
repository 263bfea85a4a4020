//! Mixer slot types shared between the control and render sides
//!
//! A slot is one registered source channel. The control side configures
//! slots through [`SlotUpdate`] commands; the render side applies them and
//! reports back with [`MixerNotification`] events. The types here cross that
//! boundary, so they carry no locks and only cheaply-clonable data.

use crate::pipe::SourcePipe;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Opaque token for one registered mixer source channel
///
/// `index` addresses the slot, `sequence_no` detects reuse after
/// unregister, `client_id` is caller-chosen and round-tripped in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClientHandle {
    pub(crate) index: u32,
    pub(crate) sequence_no: u32,
    pub(crate) client_id: u32,
}

impl SourceClientHandle {
    pub fn client_id(&self) -> u32 {
        self.client_id
    }
}

/// How a slot's samples enter the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    /// Skip the slot entirely
    Mute,

    /// Unity gain
    #[default]
    Add,

    /// Linear ramp from the current fade phase up to unity
    FadeIn,

    /// Linear ramp from the current fade phase down to zero
    FadeOut,
}

/// Fade ramp length, resolved against the engine config at render time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeDuration {
    /// Tens of milliseconds; click suppression on start/pause/seek
    #[default]
    Short,

    /// Hundreds of milliseconds; audible crossfades
    Long,
}

/// Declarative rules the render path evaluates on a slot's behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopConditions(u8);

impl StopConditions {
    pub const NONE: StopConditions = StopConditions(0);

    /// Stop the slot when its pipe reports end-of-data and no trigger fires
    pub const ON_PLAYBACK_END: StopConditions = StopConditions(0b01);

    /// Stop the slot when a fade-out reaches zero
    pub const AFTER_FADE_OUT: StopConditions = StopConditions(0b10);

    pub fn contains(&self, other: StopConditions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StopConditions {
    type Output = StopConditions;

    fn bitor(self, rhs: StopConditions) -> StopConditions {
        StopConditions(self.0 | rhs.0)
    }
}

/// End-of-data rule: swap the target slot onto a replacement pipe and start
/// it, sample-aligned with the boundary
///
/// A slot carries up to two of these, selected by which end-of-data tag
/// arrives: the loop variant for content that wraps back on itself, the
/// no-loop variant for handing off to a successor. Each fires at most once.
#[derive(Clone)]
pub struct TriggerConfig {
    pub target: SourceClientHandle,
    pub pipe: Arc<SourcePipe>,
    pub mode: MixMode,
    pub duration: FadeDuration,
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("target", &self.target)
            .field("pipe", &self.pipe.index())
            .field("mode", &self.mode)
            .field("duration", &self.duration)
            .finish()
    }
}

/// What to do with the slot as part of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotOperation {
    /// Reconfigure only; playing state unchanged
    #[default]
    None,

    /// Begin (or keep) consuming the attached pipe
    Start,

    /// Stop consuming immediately
    Stop,

    /// Stop and drop the pipe reference
    Detach,
}

/// Slot configuration carried by an update
///
/// `pipe: None` leaves the current attachment alone. `mix_phase` overrides
/// the slot's fade phase, used to start fully wet at position zero instead
/// of ramping from silence.
#[derive(Debug, Clone, Default)]
pub struct SlotParams {
    pub pipe: Option<Arc<SourcePipe>>,
    pub mode: MixMode,
    pub duration: FadeDuration,
    pub volume_left: f32,
    pub volume_right: f32,
    pub stop_conditions: StopConditions,
    pub mix_phase: Option<f32>,
    pub loop_trigger: Option<TriggerConfig>,
    pub no_loop_trigger: Option<TriggerConfig>,
}

impl SlotParams {
    /// Unity-volume params with everything else defaulted
    pub fn unity() -> Self {
        Self {
            volume_left: 1.0,
            volume_right: 1.0,
            ..Default::default()
        }
    }
}

/// One slot reconfiguration, applied atomically by the render path
#[derive(Debug, Clone)]
pub struct SlotUpdate {
    pub handle: SourceClientHandle,
    pub operation: SlotOperation,
    pub params: SlotParams,
}

/// Why a slot began producing audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingStartCause {
    /// An explicit start operation was applied
    StartOperation,

    /// A loop trigger fired at end-of-data-with-loop-point
    LoopTriggered,

    /// A no-loop trigger fired at end-of-data
    NoLoopTriggered,
}

/// Why a slot ceased producing audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingStopCause {
    /// An explicit stop operation was applied
    StopOperation,

    /// An explicit detach operation was applied
    DetachOperation,

    /// A fade-out reached zero with the after-fade-out stop condition set
    FadedOut,

    /// End-of-data with no trigger armed
    EndOfData,

    /// End-of-data-with-loop-point with no loop trigger armed
    EndOfDataWithLoopPoint,

    /// The slot's content ended and its loop trigger consumed the boundary
    LoopTriggered,

    /// The slot's content ended and its no-loop trigger consumed the boundary
    NoLoopTriggered,
}

/// Render-side event delivered to the control thread by `AudioMixer::poll`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerNotification {
    Started {
        handle: SourceClientHandle,
        cause: MixingStartCause,
    },
    Stopped {
        handle: SourceClientHandle,
        cause: MixingStopCause,
    },
}

impl MixerNotification {
    pub fn handle(&self) -> SourceClientHandle {
        match self {
            MixerNotification::Started { handle, .. } => *handle,
            MixerNotification::Stopped { handle, .. } => *handle,
        }
    }
}

/// Control → render command
#[derive(Debug)]
pub(crate) enum RenderCommand {
    /// Activate slot bookkeeping for a fresh registration
    Register {
        index: u32,
        sequence_no: u32,
        client_id: u32,
    },

    /// Deactivate a slot and drop everything it held
    Unregister { index: u32 },

    /// Apply a batch of slot updates within one render iteration
    Apply(Vec<SlotUpdate>),

    /// Gate audio production; false renders nothing at all
    SetRunning(bool),

    /// Zero the mixed output while still consuming source blocks
    SetMuted(bool),
}

// ======== Tests ========
