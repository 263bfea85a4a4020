//! Player lifecycle over a single mixer slot.
//!
//! An [`AudioPlayer`] owns one registered mixer slot and up to five
//! [`AudioSource`] instances at different lifecycle stages: `preparing`
//! (being built), `ready` (prepared, not yet attached), `active` (feeding
//! the mixer), `next` (rewound copy for gapless looping), and `old` (just
//! replaced, held one poll cycle while its claims unwind).
//!
//! Mixer notifications are the authoritative signal for everything that
//! happens on the render path: slot promotion, decoder start/pause after a
//! fade, loop and handoff switches. Control-side calls only queue work and
//! move sources between slots. The one exception is adopting a seek result
//! while nothing is rendering (paused, prepared, completed), where no
//! notification can arrive and the attach itself completes the seek.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{DataSource, DecoderFactory, PrepareStatus};
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{PlayerEvent, PlayerEventListener};
use crate::mixer::{
    AudioMixer, FadeDuration, MixMode, MixerNotification, MixingStartCause, MixingStopCause,
    SlotOperation, SlotParams, SlotUpdate, SourceClientHandle, StopConditions, TriggerConfig,
};
use crate::pipe::{PipeManager, RecycledBlock, SourcePipe};
use crate::source::{AudioSource, PreparePhase, PrepareReason};

/// Lifecycle states, matching the classic media-player transition table.
///
/// `Created` covers the span between construction and
/// [`AudioPlayer::initialize`]; every other operation is rejected until
/// the player has been brought into service. The two preparing states
/// record which prepare call is in flight, so a state query during a
/// synchronous prepare (including after its timeout) names the blocking
/// variant rather than the event-driven one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Created,
    Idle,
    Initialized,
    PreparingSync,
    PreparingAsync,
    Prepared,
    Started,
    Paused,
    Stopped,
    PlaybackCompleted,
    Error,
    End,
}

impl PlayerState {
    /// Either prepare variant is in flight.
    pub fn is_preparing(self) -> bool {
        matches!(self, Self::PreparingSync | Self::PreparingAsync)
    }
}

/// Coordinates another player needs to arm a gapless handoff to this one.
#[derive(Clone)]
pub struct NextPlayerLink {
    pub handle: SourceClientHandle,
    pub pipe: Arc<SourcePipe>,
}

struct PendingSeek {
    target_ms: u32,
    since: Instant,
}

pub struct AudioPlayer {
    id: Uuid,
    state: PlayerState,
    config: EngineConfig,
    manager: Arc<PipeManager>,
    factory: Arc<dyn DecoderFactory>,
    handle: SourceClientHandle,

    data_source: Option<DataSource>,
    looping: bool,
    volume: (f32, f32),

    preparing: Option<AudioSource>,
    ready: Option<AudioSource>,
    active: Option<AudioSource>,
    next: Option<AudioSource>,
    old: Option<AudioSource>,

    // The render side replaces slot params wholesale on every update, so
    // the last-sent values are kept here and re-sent in full each time.
    attached: bool,
    slot_mode: MixMode,
    slot_duration: FadeDuration,
    slot_stops: StopConditions,
    armed_loop: Option<TriggerConfig>,
    armed_next: Option<TriggerConfig>,
    pending_attach: Option<Arc<SourcePipe>>,

    pending_start: bool,
    pending_seek: Option<PendingSeek>,
    seek_fade_pending: bool,
    active_faded: bool,
    pause_fade_pending: bool,
    loop_prefetch_failed: bool,

    next_player: Option<Uuid>,

    last_position_ms: u32,
    known_duration_ms: Option<u32>,
    last_buffering_percent: Option<u8>,
    error_origin: Option<PlayerState>,
    last_error: Option<(ErrorKind, String)>,

    events: VecDeque<PlayerEvent>,
    listener: Option<PlayerEventListener>,

    seek_debounce: Duration,
    poll_interval: Duration,
}

impl AudioPlayer {
    /// Create a player and register its mixer slot.
    pub fn new(
        id: Uuid,
        config: &EngineConfig,
        manager: Arc<PipeManager>,
        factory: Arc<dyn DecoderFactory>,
        mixer: &mut AudioMixer,
        client_id: u32,
    ) -> Result<Self> {
        let handle = mixer.register_source_client(client_id)?;
        Ok(Self {
            id,
            state: PlayerState::Created,
            config: config.clone(),
            manager,
            factory,
            handle,
            data_source: None,
            looping: false,
            volume: (1.0, 1.0),
            preparing: None,
            ready: None,
            active: None,
            next: None,
            old: None,
            attached: false,
            slot_mode: MixMode::Add,
            slot_duration: FadeDuration::Short,
            slot_stops: StopConditions::ON_PLAYBACK_END,
            armed_loop: None,
            armed_next: None,
            pending_attach: None,
            pending_start: false,
            pending_seek: None,
            seek_fade_pending: false,
            active_faded: false,
            pause_fade_pending: false,
            loop_prefetch_failed: false,
            next_player: None,
            last_position_ms: 0,
            known_duration_ms: None,
            last_buffering_percent: None,
            error_origin: None,
            last_error: None,
            events: VecDeque::new(),
            listener: None,
            seek_debounce: Duration::from_millis(config.seek_debounce_ms as u64),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn handle(&self) -> SourceClientHandle {
        self.handle
    }

    /// The state the player was in when it entered [`PlayerState::Error`].
    pub fn error_origin(&self) -> Option<PlayerState> {
        self.error_origin
    }

    /// The failure behind the current [`PlayerState::Error`], rebuilt for
    /// callers that query state instead of listening for events.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .as_ref()
            .map(|(kind, message)| kind.with_message(message.clone()))
    }

    pub fn set_event_listener(&mut self, listener: Option<PlayerEventListener>) {
        self.listener = listener;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn volume(&self) -> (f32, f32) {
        self.volume
    }

    pub fn next_player(&self) -> Option<Uuid> {
        self.next_player
    }

    /// Whether this player still needs the render thread awake: audible
    /// playback, or a fade that must run to completion first.
    pub(crate) fn is_rendering_required(&self) -> bool {
        self.state == PlayerState::Started || self.pause_fade_pending || self.seek_fade_pending
    }

    /// Bring the player into service. One-shot.
    ///
    /// The constructor allocates the mixer slot; this completes the
    /// created-to-idle transition that makes the player operable.
    pub fn initialize(&mut self) -> Result<()> {
        self.require(&[PlayerState::Created], "initialize")?;
        self.state = PlayerState::Idle;
        Ok(())
    }

    /// Bind the stream to play; legal only while idle.
    pub fn set_data_source(&mut self, source: DataSource) -> Result<()> {
        self.require(&[PlayerState::Idle], "set_data_source")?;
        self.data_source = Some(source);
        self.state = PlayerState::Initialized;
        Ok(())
    }

    /// Begin asynchronous preparation; completion is reported through the
    /// prepared event once polling has run the phase machine to the end.
    pub fn prepare_async(&mut self) -> Result<()> {
        self.begin_preparing(PlayerState::PreparingAsync, "prepare_async")
    }

    /// Begin preparation for a blocking `prepare` call.
    ///
    /// The same phase machine runs either way; the caller drives
    /// [`poll`](Self::poll) until the player leaves `PreparingSync` or its
    /// deadline expires. On a timeout the attempt keeps running and state
    /// queries keep reporting `PreparingSync`.
    pub fn prepare_sync(&mut self) -> Result<()> {
        self.begin_preparing(PlayerState::PreparingSync, "prepare")
    }

    fn begin_preparing(&mut self, target: PlayerState, operation: &str) -> Result<()> {
        self.require(&[PlayerState::Initialized, PlayerState::Stopped], operation)?;
        let source = self.spawn_source(0, PrepareReason::Start)?;
        self.preparing = Some(source);
        self.state = target;
        Ok(())
    }

    /// Start or resume playback.
    ///
    /// With a prepared source waiting, it is attached with a fade-in and
    /// promoted once the mixer confirms. From paused the same slot fades
    /// back in without restarting the decoder. With nothing prepared (after
    /// completion or a stop that discarded sources) a fresh source is
    /// rewound from position zero and started as soon as it is ready.
    pub fn start(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        self.require(
            &[
                PlayerState::Prepared,
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::PlaybackCompleted,
            ],
            "start",
        )?;
        if self.state == PlayerState::Started {
            return Ok(());
        }
        if self.active.is_some() && self.attached {
            let was_paused = self.state == PlayerState::Paused;
            let pipe = self.active.as_ref().and_then(|s| s.pipe());
            let position = self
                .active
                .as_ref()
                .map(|s| s.initial_position_ms())
                .unwrap_or(0);
            // A fade that was still running is overridden here, so its
            // completion event will never arrive.
            self.pause_fade_pending = false;
            self.seek_fade_pending = false;
            self.active_faded = false;
            let mix_phase = if was_paused {
                None
            } else if position == 0 {
                Some(1.0)
            } else {
                Some(0.0)
            };
            self.send_slot(
                mixer,
                pipe,
                SlotOperation::Start,
                MixMode::FadeIn,
                FadeDuration::Short,
                StopConditions::ON_PLAYBACK_END,
                mix_phase,
            )?;
            self.state = PlayerState::Started;
            return Ok(());
        }
        if self.ready.is_some() {
            self.pending_start = false;
            self.attach_ready(mixer)?;
            self.state = PlayerState::Started;
            return Ok(());
        }
        let source = self.spawn_source(0, PrepareReason::Rewind)?;
        self.preparing = Some(source);
        self.pending_start = true;
        self.state = PlayerState::Started;
        Ok(())
    }

    /// Fade out and pause; the decoder halts once the fade-out confirms.
    pub fn pause(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        self.require(
            &[
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::PlaybackCompleted,
            ],
            "pause",
        )?;
        if self.state == PlayerState::Paused {
            return Ok(());
        }
        let was_started = self.state == PlayerState::Started;
        self.state = PlayerState::Paused;
        if was_started && self.attached && self.active.is_some() {
            self.pause_fade_pending = true;
            self.send_slot(
                mixer,
                None,
                SlotOperation::None,
                MixMode::FadeOut,
                FadeDuration::Short,
                StopConditions::AFTER_FADE_OUT | StopConditions::ON_PLAYBACK_END,
                None,
            )?;
        }
        Ok(())
    }

    /// Halt playback and discard every prepared source.
    pub fn stop(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        self.require(
            &[
                PlayerState::Prepared,
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::Stopped,
                PlayerState::PlaybackCompleted,
            ],
            "stop",
        )?;
        self.teardown_sources(mixer)?;
        self.state = PlayerState::Stopped;
        Ok(())
    }

    /// Return to idle, dropping the data source and all progress.
    ///
    /// Volume and the event listener survive a reset.
    pub fn reset(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        self.require_in_service("reset")?;
        self.teardown_sources(mixer)?;
        self.data_source = None;
        self.looping = false;
        self.next_player = None;
        self.events.clear();
        self.last_position_ms = 0;
        self.known_duration_ms = None;
        self.error_origin = None;
        self.last_error = None;
        self.state = PlayerState::Idle;
        Ok(())
    }

    /// Final teardown; unregisters the mixer slot. Idempotent.
    pub fn release(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        if self.state == PlayerState::End {
            return Ok(());
        }
        self.teardown_sources(mixer)?;
        mixer.unregister_source_client(self.handle)?;
        self.data_source = None;
        self.listener = None;
        self.events.clear();
        self.state = PlayerState::End;
        Ok(())
    }

    /// Request a debounced seek; rapid repeats collapse to the last target.
    ///
    /// The seek is applied by [`poll`](Self::poll) once no newer request has
    /// arrived for the configured debounce interval.
    pub fn seek_to(&mut self, target_ms: u32, now: Instant) -> Result<()> {
        self.require(
            &[
                PlayerState::Prepared,
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::PlaybackCompleted,
            ],
            "seek_to",
        )?;
        self.pending_seek = Some(PendingSeek {
            target_ms,
            since: now,
        });
        Ok(())
    }

    /// Set per-channel volume; the slot update applies from the next block.
    pub fn set_volume(&mut self, mixer: &mut AudioMixer, left: f32, right: f32) -> Result<()> {
        self.require_in_service("set_volume")?;
        self.volume = (left.clamp(0.0, 1.0), right.clamp(0.0, 1.0));
        // Sent even while detached so a trigger handoff into this slot
        // renders with the requested volume from its first block.
        self.refresh_slot(mixer)
    }

    /// Enable or disable seamless looping of the bound stream.
    pub fn set_looping(&mut self, mixer: &mut AudioMixer, looping: bool) -> Result<()> {
        self.require(
            &[
                PlayerState::Idle,
                PlayerState::Initialized,
                PlayerState::Prepared,
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::Stopped,
                PlayerState::PlaybackCompleted,
            ],
            "set_looping",
        )?;
        if self.looping == looping {
            return Ok(());
        }
        self.looping = looping;
        for source in [&self.preparing, &self.ready, &self.active, &self.next]
            .into_iter()
            .flatten()
        {
            source.set_looping(looping);
        }
        if !looping {
            self.loop_prefetch_failed = false;
            self.next = None;
            if self.armed_loop.take().is_some() {
                self.refresh_slot(mixer)?;
                mixer.clear_pending_start(self.handle)?;
            }
        }
        Ok(())
    }

    /// Choose the player that takes over when this stream ends while not
    /// looping; `None` clears the chain.
    pub fn set_next_player(&mut self, next: Option<Uuid>) -> Result<()> {
        self.require_in_service("set_next_player")?;
        if next == Some(self.id) {
            return Err(Error::IllegalArgument(
                "a player cannot chain to itself; use set_looping".to_string(),
            ));
        }
        self.next_player = next;
        Ok(())
    }

    /// Current stream position in milliseconds.
    pub fn position_ms(&self) -> Result<u32> {
        self.require_in_service("position query")?;
        if let Some(seek) = &self.pending_seek {
            return Ok(seek.target_ms);
        }
        for source in [&self.ready, &self.preparing].into_iter().flatten() {
            if source.reason() == PrepareReason::Seek {
                return Ok(source.initial_position_ms());
            }
        }
        if let Some(active) = &self.active {
            return Ok(active.playback_position_ms());
        }
        if let Some(ready) = &self.ready {
            return Ok(ready.initial_position_ms());
        }
        Ok(self.last_position_ms)
    }

    /// Total stream duration, when the decoder could report one.
    pub fn duration_ms(&self) -> Result<Option<u32>> {
        self.require(
            &[
                PlayerState::Prepared,
                PlayerState::Started,
                PlayerState::Paused,
                PlayerState::Stopped,
                PlayerState::PlaybackCompleted,
                PlayerState::Error,
            ],
            "duration query",
        )?;
        Ok(self
            .active
            .as_ref()
            .and_then(|s| s.duration_ms())
            .or(self.known_duration_ms))
    }

    /// Coordinates for arming a gapless handoff into this player; available
    /// only while prepared and holding an unattached source.
    pub fn handoff_link(&self) -> Option<NextPlayerLink> {
        if self.state != PlayerState::Prepared {
            return None;
        }
        let pipe = self.ready.as_ref()?.pipe()?;
        Some(NextPlayerLink {
            handle: self.handle,
            pipe,
        })
    }

    /// How soon this player needs another poll, if at all.
    pub fn next_poll_hint(&self, now: Instant) -> Option<Duration> {
        if matches!(self.state, PlayerState::Created | PlayerState::End) {
            return None;
        }
        let mut hint: Option<Duration> = None;
        let mut merge = |candidate: Duration| {
            hint = Some(match hint {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };
        if !self.events.is_empty() {
            merge(Duration::ZERO);
        }
        if let Some(seek) = &self.pending_seek {
            let deadline = seek.since + self.seek_debounce;
            merge(deadline.saturating_duration_since(now));
        }
        if let Some(source) = &self.preparing {
            merge(prepare_wait(source, self.poll_interval));
        }
        if let Some(source) = &self.next {
            if !source.is_prepared() {
                merge(prepare_wait(source, self.poll_interval));
            }
        }
        if matches!(self.state, PlayerState::Started | PlayerState::Paused) {
            merge(self.poll_interval);
        }
        if self.old.is_some() {
            merge(self.poll_interval);
        }
        hint
    }

    /// Advance asynchronous work: prepare phases, the debounced seek, loop
    /// prefetch, trigger arming, and buffering progress.
    ///
    /// `next_link` carries the chained player's handoff coordinates when one
    /// is set and prepared; the caller resolves it before polling.
    pub fn poll(&mut self, mixer: &mut AudioMixer, now: Instant, next_link: Option<NextPlayerLink>) {
        if matches!(self.state, PlayerState::Created | PlayerState::End) {
            return;
        }
        // Sources displaced last cycle have had their recycle traffic drain
        self.old = None;
        if let Some(error) = self.active.as_ref().and_then(|s| s.take_error()) {
            self.enter_error(mixer, error);
            return;
        }
        self.advance_preparing(mixer);
        self.advance_next();
        self.apply_due_seek(mixer, now);
        self.try_seek_attach(mixer);
        self.update_loop_arming(mixer);
        self.update_handoff_arming(mixer, next_link);
        self.update_buffering();
    }

    /// Translate one mixer notification addressed to this player's slot.
    pub fn handle_notification(&mut self, mixer: &mut AudioMixer, notification: MixerNotification) {
        if matches!(self.state, PlayerState::Created | PlayerState::End) {
            return;
        }
        match notification {
            MixerNotification::Started { cause, .. } => self.handle_started(mixer, cause),
            MixerNotification::Stopped { cause, .. } => self.handle_stopped(mixer, cause),
        }
    }

    /// Deliver queued events to the registered listener.
    pub fn dispatch_events(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let Some(listener) = self.listener.as_mut() else {
            self.events.clear();
            return;
        };
        while let Some(event) = self.events.pop_front() {
            listener(event);
        }
    }

    /// Fan a recycled-block notice to whichever source owns that pipe.
    pub fn on_recycle(&self, item: &RecycledBlock) {
        for source in [
            &self.preparing,
            &self.ready,
            &self.active,
            &self.next,
            &self.old,
        ]
        .into_iter()
        .flatten()
        {
            source.on_recycle(item);
        }
    }

    /// Reject operations on a player that is not yet initialized or has
    /// been released.
    fn require_in_service(&self, operation: &str) -> Result<()> {
        match self.state {
            PlayerState::Created | PlayerState::End => Err(Error::IllegalState(format!(
                "{} not allowed in {:?}",
                operation, self.state
            ))),
            _ => Ok(()),
        }
    }

    fn require(&self, allowed: &[PlayerState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::IllegalState(format!(
                "{} not allowed in {:?}",
                operation, self.state
            )))
        }
    }

    fn spawn_source(&self, initial_ms: u32, reason: PrepareReason) -> Result<AudioSource> {
        let data_source = self
            .data_source
            .as_ref()
            .ok_or_else(|| Error::IllegalState("no data source bound".to_string()))?
            .try_clone()?;
        Ok(AudioSource::new(
            &self.config,
            Arc::clone(&self.manager),
            Arc::clone(&self.factory),
            data_source,
            initial_ms,
            reason,
            self.looping,
        ))
    }

    /// Compose and send a complete slot update from the shadow state.
    #[allow(clippy::too_many_arguments)]
    fn send_slot(
        &mut self,
        mixer: &mut AudioMixer,
        pipe: Option<Arc<SourcePipe>>,
        operation: SlotOperation,
        mode: MixMode,
        duration: FadeDuration,
        stops: StopConditions,
        mix_phase: Option<f32>,
    ) -> Result<()> {
        self.slot_mode = mode;
        self.slot_duration = duration;
        self.slot_stops = stops;
        let params = SlotParams {
            pipe,
            mode,
            duration,
            volume_left: self.volume.0,
            volume_right: self.volume.1,
            stop_conditions: stops,
            mix_phase,
            loop_trigger: self.armed_loop.clone(),
            no_loop_trigger: self.armed_next.clone(),
        };
        mixer.attach_or_update_source_pipe(
            SlotUpdate {
                handle: self.handle,
                operation,
                params,
            },
            None,
        )
    }

    /// Re-send the last-sent slot params unchanged (volume or trigger edits).
    fn refresh_slot(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        let mode = self.slot_mode;
        let duration = self.slot_duration;
        let stops = self.slot_stops;
        self.send_slot(mixer, None, SlotOperation::None, mode, duration, stops, None)
    }

    /// Attach the `ready` source with a fade-in; promotion to `active`
    /// happens when the mixer confirms the start.
    fn attach_ready(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        let (pipe, position) = match self.ready.as_ref() {
            Some(source) => match source.pipe() {
                Some(pipe) => (pipe, source.initial_position_ms()),
                None => {
                    return Err(Error::IllegalState(
                        "prepared source lost its pipe".to_string(),
                    ))
                }
            },
            None => {
                return Err(Error::IllegalState(
                    "no prepared source to attach".to_string(),
                ))
            }
        };
        // Resuming from the top of the stream starts fully wet; an audible
        // ramp-in there reads as a dropout, not a fade.
        let mix_phase = if position == 0 { Some(1.0) } else { Some(0.0) };
        let expected = Arc::clone(&pipe);
        self.send_slot(
            mixer,
            Some(pipe),
            SlotOperation::Start,
            MixMode::FadeIn,
            FadeDuration::Short,
            StopConditions::ON_PLAYBACK_END,
            mix_phase,
        )?;
        self.pending_attach = Some(expected);
        self.attached = true;
        Ok(())
    }

    fn advance_preparing(&mut self, mixer: &mut AudioMixer) {
        let status = match self.preparing.as_mut() {
            Some(source) => source.poll_prepare(),
            None => return,
        };
        match status {
            Ok(PrepareStatus::NeedRetry) => {}
            Ok(PrepareStatus::Ready) => {
                if let Some(source) = self.preparing.take() {
                    self.place_prepared(mixer, source);
                }
            }
            Err(error) => {
                self.preparing = None;
                self.enter_error(mixer, error);
            }
        }
    }

    fn place_prepared(&mut self, mixer: &mut AudioMixer, source: AudioSource) {
        self.record_duration(&source);
        let reason = source.reason();
        self.ready = Some(source);
        match reason {
            PrepareReason::Seek => self.try_seek_attach(mixer),
            PrepareReason::Start | PrepareReason::Rewind => {
                if self.pending_start {
                    if self.state == PlayerState::Started {
                        self.pending_start = false;
                        if let Err(error) = self.attach_ready(mixer) {
                            self.enter_error(mixer, error);
                        }
                    }
                    // paused before the rewound source became ready; it
                    // stays in `ready` until the next start()
                } else if self.state.is_preparing() {
                    self.state = PlayerState::Prepared;
                    self.events.push_back(PlayerEvent::Prepared);
                }
            }
        }
    }

    fn advance_next(&mut self) {
        let status = match self.next.as_mut() {
            Some(source) if !source.is_prepared() => source.poll_prepare(),
            _ => return,
        };
        if let Err(error) = status {
            warn!("player {} loop prefetch failed: {}", self.id, error);
            self.next = None;
            self.loop_prefetch_failed = true;
        }
    }

    fn apply_due_seek(&mut self, mixer: &mut AudioMixer, now: Instant) {
        let due = match &self.pending_seek {
            Some(seek) => now.saturating_duration_since(seek.since) >= self.seek_debounce,
            None => return,
        };
        if !due {
            return;
        }
        let Some(seek) = self.pending_seek.take() else {
            return;
        };
        // A superseded in-flight seek preparation is discarded outright
        if self.is_seek_source(&self.preparing) {
            self.preparing = None;
        }
        if self.is_seek_source(&self.ready) {
            self.ready = None;
        }
        let target = match self.known_duration_ms {
            Some(duration) => seek.target_ms.min(duration),
            None => seek.target_ms,
        };
        match self.spawn_source(target, PrepareReason::Seek) {
            Ok(source) => {
                self.preparing = Some(source);
                if self.state == PlayerState::Started
                    && self.attached
                    && self.active.is_some()
                    && !self.active_faded
                    && !self.seek_fade_pending
                {
                    self.seek_fade_pending = true;
                    if let Err(error) = self.send_slot(
                        mixer,
                        None,
                        SlotOperation::None,
                        MixMode::FadeOut,
                        FadeDuration::Short,
                        StopConditions::AFTER_FADE_OUT | StopConditions::ON_PLAYBACK_END,
                        None,
                    ) {
                        self.enter_error(mixer, error);
                    }
                }
            }
            Err(error) => self.enter_error(mixer, error),
        }
    }

    /// Move a prepared seek result into place once the old audio is out of
    /// the way: immediately when nothing is rendering, after the fade-out
    /// confirms while started.
    fn try_seek_attach(&mut self, mixer: &mut AudioMixer) {
        if !self.is_seek_source(&self.ready) {
            return;
        }
        if self.pending_seek.is_some() {
            // a newer target is queued; this result is about to be replaced
            return;
        }
        match self.state {
            PlayerState::Started => {
                if self.active.is_none() || self.active_faded {
                    self.seek_fade_pending = false;
                    self.active_faded = false;
                    if let Some(previous) = self.active.take() {
                        self.old = Some(previous);
                    }
                    if let Err(error) = self.attach_ready(mixer) {
                        self.enter_error(mixer, error);
                    }
                } else if !self.seek_fade_pending {
                    // the fade this seek scheduled was overridden (resume);
                    // fade out again before switching
                    self.seek_fade_pending = true;
                    if let Err(error) = self.send_slot(
                        mixer,
                        None,
                        SlotOperation::None,
                        MixMode::FadeOut,
                        FadeDuration::Short,
                        StopConditions::AFTER_FADE_OUT | StopConditions::ON_PLAYBACK_END,
                        None,
                    ) {
                        self.enter_error(mixer, error);
                    }
                }
            }
            PlayerState::Paused if self.pause_fade_pending => {
                // adopt once the pause fade has confirmed
            }
            PlayerState::Prepared | PlayerState::Paused | PlayerState::PlaybackCompleted => {
                self.adopt_seek_result(mixer);
            }
            _ => {}
        }
    }

    /// Swap a seek result in while nothing renders. No mixer notification
    /// can confirm this, so the attach itself completes the seek; the
    /// decoder stays paused until the next start.
    fn adopt_seek_result(&mut self, mixer: &mut AudioMixer) {
        let Some(source) = self.ready.take() else {
            return;
        };
        let position = source.initial_position_ms();
        let Some(pipe) = source.pipe() else {
            self.enter_error(
                mixer,
                Error::IllegalState("prepared source lost its pipe".to_string()),
            );
            return;
        };
        if let Some(previous) = self.active.replace(source) {
            self.old = Some(previous);
        }
        self.seek_fade_pending = false;
        self.active_faded = false;
        let result = self.send_slot(
            mixer,
            Some(pipe),
            SlotOperation::None,
            MixMode::Add,
            FadeDuration::Short,
            StopConditions::ON_PLAYBACK_END,
            None,
        );
        if let Err(error) = result {
            self.enter_error(mixer, error);
            return;
        }
        self.attached = true;
        self.last_position_ms = position;
        self.events
            .push_back(PlayerEvent::SeekComplete { position_ms: position });
    }

    fn update_loop_arming(&mut self, mixer: &mut AudioMixer) {
        if !self.looping
            || self.state != PlayerState::Started
            || !self.attached
            || self.active.is_none()
        {
            return;
        }
        if self.next.is_none() && !self.loop_prefetch_failed {
            match self.spawn_source(0, PrepareReason::Rewind) {
                Ok(source) => self.next = Some(source),
                Err(error) => {
                    warn!("player {} loop prefetch spawn failed: {}", self.id, error);
                    self.loop_prefetch_failed = true;
                }
            }
        }
        let next_pipe = match self.next.as_ref() {
            Some(source) if source.is_prepared() => source.pipe(),
            _ => None,
        };
        let Some(pipe) = next_pipe else {
            return;
        };
        let armed_current = self
            .armed_loop
            .as_ref()
            .map(|t| Arc::ptr_eq(&t.pipe, &pipe))
            .unwrap_or(false);
        if armed_current {
            return;
        }
        self.armed_loop = Some(TriggerConfig {
            target: self.handle,
            pipe,
            mode: MixMode::Add,
            duration: FadeDuration::Short,
        });
        if let Err(error) = self.refresh_slot(mixer) {
            self.enter_error(mixer, error);
        }
    }

    fn update_handoff_arming(&mut self, mixer: &mut AudioMixer, link: Option<NextPlayerLink>) {
        if self.looping || self.state != PlayerState::Started || !self.attached {
            return;
        }
        match link {
            Some(link) => {
                let armed_current = self
                    .armed_next
                    .as_ref()
                    .map(|t| t.target == link.handle && Arc::ptr_eq(&t.pipe, &link.pipe))
                    .unwrap_or(false);
                if armed_current {
                    return;
                }
                let previous_target = self.armed_next.as_ref().map(|t| t.target);
                self.armed_next = Some(TriggerConfig {
                    target: link.handle,
                    pipe: link.pipe,
                    mode: MixMode::Add,
                    duration: FadeDuration::Short,
                });
                if let Err(error) = self.refresh_slot(mixer) {
                    self.enter_error(mixer, error);
                    return;
                }
                if let Some(previous) = previous_target {
                    if previous != link.handle && mixer.clear_pending_start(previous).is_err() {
                        debug!("player {} previous handoff target already gone", self.id);
                    }
                }
            }
            None => {
                if let Some(trigger) = self.armed_next.take() {
                    if let Err(error) = self.refresh_slot(mixer) {
                        self.enter_error(mixer, error);
                        return;
                    }
                    if mixer.clear_pending_start(trigger.target).is_err() {
                        debug!("player {} handoff target already gone", self.id);
                    }
                }
            }
        }
    }

    fn update_buffering(&mut self) {
        if !self.state.is_preparing()
            && !matches!(
                self.state,
                PlayerState::Prepared | PlayerState::Started | PlayerState::Paused
            )
        {
            return;
        }
        let source = self
            .active
            .as_ref()
            .or(self.ready.as_ref())
            .or(self.preparing.as_ref());
        let Some(source) = source else {
            return;
        };
        let Some(duration) = source.duration_ms().or(self.known_duration_ms) else {
            return;
        };
        if duration == 0 {
            return;
        }
        let buffered = source.buffered_position_ms().min(duration) as u64;
        let percent = (buffered * 100 / duration as u64) as u8;
        if self.last_buffering_percent != Some(percent) {
            self.last_buffering_percent = Some(percent);
            self.events
                .push_back(PlayerEvent::BufferingUpdate { percent });
        }
    }

    fn handle_started(&mut self, mixer: &mut AudioMixer, cause: MixingStartCause) {
        match cause {
            MixingStartCause::StartOperation => {
                let expected = self.pending_attach.take();
                let ready_matches = match (&expected, self.ready.as_ref().and_then(|s| s.pipe())) {
                    (Some(expected), Some(pipe)) => Arc::ptr_eq(expected, &pipe),
                    _ => false,
                };
                if ready_matches {
                    self.promote_ready(mixer);
                } else if let Some(active) = self.active.as_mut() {
                    if let Err(error) = active.start_decoder() {
                        self.enter_error(mixer, error);
                    }
                }
            }
            MixingStartCause::LoopTriggered => {
                if let Some(mut source) = self.next.take() {
                    if let Err(error) = source.start_decoder() {
                        self.enter_error(mixer, error);
                        return;
                    }
                    self.record_duration(&source);
                    if let Some(previous) = self.active.replace(source) {
                        self.old = Some(previous);
                    }
                } else {
                    warn!("player {} loop trigger fired without a source", self.id);
                }
                // consumed on fire; the next poll prepares and re-arms
                self.armed_loop = None;
            }
            MixingStartCause::NoLoopTriggered => self.handle_handoff_started(mixer),
        }
    }

    /// This player is the handoff target: its prepared pipe was attached at
    /// the predecessor's end of stream inside the render path.
    fn handle_handoff_started(&mut self, mixer: &mut AudioMixer) {
        let Some(mut source) = self.ready.take() else {
            warn!("player {} handoff started without a source", self.id);
            return;
        };
        if let Err(error) = source.start_decoder() {
            self.enter_error(mixer, error);
            return;
        }
        self.record_duration(&source);
        if let Some(previous) = self.active.replace(source) {
            self.old = Some(previous);
        }
        self.attached = true;
        self.state = PlayerState::Started;
        // The trigger attach carries neither stop conditions nor volumes;
        // re-send ours so end-of-stream is reported for this stream too.
        if let Err(error) = self.send_slot(
            mixer,
            None,
            SlotOperation::None,
            MixMode::Add,
            FadeDuration::Short,
            StopConditions::ON_PLAYBACK_END,
            None,
        ) {
            self.enter_error(mixer, error);
        }
    }

    fn promote_ready(&mut self, mixer: &mut AudioMixer) {
        let Some(mut source) = self.ready.take() else {
            return;
        };
        let was_seek = source.reason() == PrepareReason::Seek;
        let position = source.initial_position_ms();
        if let Err(error) = source.start_decoder() {
            self.enter_error(mixer, error);
            return;
        }
        self.record_duration(&source);
        if let Some(previous) = self.active.replace(source) {
            self.old = Some(previous);
        }
        if was_seek {
            self.last_position_ms = position;
            self.events
                .push_back(PlayerEvent::SeekComplete { position_ms: position });
        }
    }

    fn handle_stopped(&mut self, mixer: &mut AudioMixer, cause: MixingStopCause) {
        match cause {
            MixingStopCause::FadedOut => {
                self.pause_fade_pending = false;
                if self.state == PlayerState::Paused {
                    if let Some(active) = self.active.as_mut() {
                        if let Err(error) = active.pause_decoder() {
                            warn!("player {} decoder pause failed: {}", self.id, error);
                        }
                    }
                }
                if self.seek_fade_pending {
                    self.seek_fade_pending = false;
                    self.active_faded = true;
                }
                self.try_seek_attach(mixer);
            }
            MixingStopCause::EndOfData | MixingStopCause::EndOfDataWithLoopPoint => {
                self.finish_playback(mixer);
            }
            MixingStopCause::LoopTriggered => {
                // the replacement starts within the same render block; the
                // outgoing source just moves aside
                if let Some(previous) = self.active.take() {
                    self.old = Some(previous);
                }
            }
            MixingStopCause::NoLoopTriggered => {
                self.armed_next = None;
                self.finish_playback(mixer);
            }
            MixingStopCause::StopOperation | MixingStopCause::DetachOperation => {
                debug!("player {} slot stop confirmed ({:?})", self.id, cause);
            }
        }
    }

    fn finish_playback(&mut self, mixer: &mut AudioMixer) {
        if let Some(active) = self.active.take() {
            self.record_duration(&active);
            self.last_position_ms = active
                .duration_ms()
                .or(self.known_duration_ms)
                .unwrap_or_else(|| active.playback_position_ms());
            self.old = Some(active);
        }
        self.next = None;
        self.armed_loop = None;
        if let Some(trigger) = self.armed_next.take() {
            if mixer.clear_pending_start(trigger.target).is_err() {
                debug!("player {} handoff target already gone", self.id);
            }
        }
        if mixer.clear_pending_start(self.handle).is_err() {
            debug!("player {} own slot already unregistered", self.id);
        }
        if self.attached {
            let result = self.send_slot(
                mixer,
                None,
                SlotOperation::Detach,
                MixMode::Mute,
                FadeDuration::Short,
                StopConditions::NONE,
                None,
            );
            if let Err(error) = result {
                warn!("player {} detach after completion failed: {}", self.id, error);
            }
            self.attached = false;
        }
        self.state = PlayerState::PlaybackCompleted;
        self.events.push_back(PlayerEvent::Completion);
    }

    fn record_duration(&mut self, source: &AudioSource) {
        let reported = source
            .duration_ms()
            .or_else(|| source.stream_info().and_then(|info| info.duration_ms));
        if reported.is_some() {
            self.known_duration_ms = reported;
        }
    }

    fn is_seek_source(&self, slot: &Option<AudioSource>) -> bool {
        slot.as_ref()
            .map(|s| s.reason() == PrepareReason::Seek)
            .unwrap_or(false)
    }

    fn enter_error(&mut self, mixer: &mut AudioMixer, error: Error) {
        warn!(
            "player {} entering error state from {:?}: {}",
            self.id, self.state, error
        );
        self.error_origin = Some(self.state);
        self.last_error = Some((error.kind(), error.to_string()));
        self.events.push_back(PlayerEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
        if let Err(teardown_error) = self.teardown_sources(mixer) {
            warn!(
                "player {} teardown while entering error state failed: {}",
                self.id, teardown_error
            );
        }
        self.state = PlayerState::Error;
    }

    fn teardown_sources(&mut self, mixer: &mut AudioMixer) -> Result<()> {
        if let Some(active) = &self.active {
            self.last_position_ms = active.playback_position_ms();
        }
        if let Some(trigger) = self.armed_next.take() {
            if mixer.clear_pending_start(trigger.target).is_err() {
                debug!("player {} handoff target already gone", self.id);
            }
        }
        self.armed_loop = None;
        if mixer.clear_pending_start(self.handle).is_err() {
            debug!("player {} own slot already unregistered", self.id);
        }
        if self.attached {
            self.send_slot(
                mixer,
                None,
                SlotOperation::Detach,
                MixMode::Mute,
                FadeDuration::Short,
                StopConditions::NONE,
                None,
            )?;
            self.attached = false;
        }
        self.preparing = None;
        self.ready = None;
        self.active = None;
        self.next = None;
        self.old = None;
        self.pending_attach = None;
        self.pending_start = false;
        self.pending_seek = None;
        self.seek_fade_pending = false;
        self.active_faded = false;
        self.pause_fade_pending = false;
        self.loop_prefetch_failed = false;
        self.last_buffering_percent = None;
        Ok(())
    }

    #[cfg(test)]
    fn loop_armed(&self) -> bool {
        self.armed_loop.is_some()
    }

    #[cfg(test)]
    fn handoff_armed(&self) -> bool {
        self.armed_next.is_some()
    }

    #[cfg(test)]
    fn has_next(&self) -> bool {
        self.next.is_some()
    }

    #[cfg(test)]
    fn has_ready(&self) -> bool {
        self.ready.is_some()
    }

    #[cfg(test)]
    fn is_attached(&self) -> bool {
        self.attached
    }
}

fn prepare_wait(source: &AudioSource, poll_interval: Duration) -> Duration {
    match source.phase() {
        PreparePhase::WaitDecoderPrefetch | PreparePhase::WaitQueuePrefetch => poll_interval,
        _ => Duration::ZERO,
    }
}

impl fmt::Debug for AudioPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPlayer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("looping", &self.looping)
            .field("attached", &self.attached)
            .field("pending_seek", &self.pending_seek.as_ref().map(|s| s.target_ms))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StreamInfo;
    use crate::error::ErrorKind;
    use crate::mixer::SinkFeed;
    use crate::testing::ScriptedFactory;
    use std::sync::Mutex;

    const STREAM_FRAMES: usize = 13_230; // 300 ms at 44.1 kHz

    struct Rig {
        config: EngineConfig,
        manager: Arc<PipeManager>,
        mixer: AudioMixer,
        factory: Arc<ScriptedFactory>,
        feed: SinkFeed,
    }

    fn stereo_info() -> StreamInfo {
        StreamInfo {
            sample_rate: 44100,
            channels: 2,
            duration_ms: None,
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.block_frames = 8;
        config.source_pipe_blocks = 2048;
        config.source_pipe_count = 4;
        config.prefetch_blocks = 1;
        config.producer_max_retries = 1;
        config.producer_retry_wait_ms = 1;
        config.seek_debounce_ms = 100;
        config
    }

    fn rig() -> Rig {
        let config = test_config();
        let manager = Arc::new(PipeManager::new(&config));
        let mut mixer = AudioMixer::new(&config);
        let feed = mixer.initialize(Arc::clone(&manager)).unwrap();
        // live mode: fades, triggers, and end-of-data all come from real renders
        mixer.start(false).unwrap();
        let factory = ScriptedFactory::new(stereo_info(), STREAM_FRAMES);
        Rig {
            config,
            manager,
            mixer,
            factory,
            feed,
        }
    }

    /// Pull `blocks` output blocks through the render path, as a device would.
    fn render(rig: &mut Rig, blocks: usize) {
        let mut out = vec![0.0f32; rig.config.block_frames * 2];
        for _ in 0..blocks {
            rig.feed.fill(&mut out);
        }
    }

    fn new_player(rig: &mut Rig, client_id: u32) -> AudioPlayer {
        let factory: Arc<dyn DecoderFactory> = rig.factory.clone();
        let mut player = AudioPlayer::new(
            Uuid::new_v4(),
            &rig.config,
            Arc::clone(&rig.manager),
            factory,
            &mut rig.mixer,
            client_id,
        )
        .unwrap();
        player.initialize().unwrap();
        player
    }

    fn capture_events(player: &mut AudioPlayer) -> Arc<Mutex<Vec<PlayerEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        player.set_event_listener(Some(Box::new(move |event| {
            sink.lock().unwrap().push(event)
        })));
        log
    }

    fn poll_until(player: &mut AudioPlayer, rig: &mut Rig, target: PlayerState) {
        for _ in 0..60 {
            player.poll(&mut rig.mixer, Instant::now(), None);
            if player.state() == target {
                return;
            }
        }
        panic!("player never reached {:?}", target);
    }

    fn prepare(player: &mut AudioPlayer, rig: &mut Rig) {
        player
            .set_data_source(DataSource::Path("/mock/stream.wav".into()))
            .unwrap();
        player.prepare_async().unwrap();
        poll_until(player, rig, PlayerState::Prepared);
    }

    fn route_notifications(player: &mut AudioPlayer, rig: &mut Rig) -> usize {
        let notifications = rig.mixer.poll();
        let count = notifications.len();
        for notification in notifications {
            player.handle_notification(&mut rig.mixer, notification);
        }
        count
    }

    /// Route mixer notifications to whichever of two players owns the slot.
    fn route_two(a: &mut AudioPlayer, b: &mut AudioPlayer, rig: &mut Rig) -> usize {
        let notifications = rig.mixer.poll();
        let count = notifications.len();
        for notification in notifications {
            if notification.handle().client_id() == a.handle().client_id() {
                a.handle_notification(&mut rig.mixer, notification);
            } else {
                b.handle_notification(&mut rig.mixer, notification);
            }
        }
        count
    }

    #[test]
    fn test_illegal_operations_leave_state_unchanged() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);

        assert!(matches!(player.prepare_async(), Err(Error::IllegalState(_))));
        assert!(matches!(
            player.start(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.pause(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.stop(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.seek_to(10, Instant::now()),
            Err(Error::IllegalState(_))
        ));
        assert_eq!(player.state(), PlayerState::Idle);

        player
            .set_data_source(DataSource::Path("/mock/a.wav".into()))
            .unwrap();
        assert_eq!(player.state(), PlayerState::Initialized);
        assert!(matches!(
            player.set_data_source(DataSource::Path("/mock/b.wav".into())),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.start(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));

        player.prepare_async().unwrap();
        assert_eq!(player.state(), PlayerState::PreparingAsync);
        assert!(matches!(player.prepare_async(), Err(Error::IllegalState(_))));
        assert!(matches!(player.prepare_sync(), Err(Error::IllegalState(_))));
        assert_eq!(player.state(), PlayerState::PreparingAsync);
    }

    #[test]
    fn test_created_until_initialized() {
        let mut rig = rig();
        let factory: Arc<dyn DecoderFactory> = rig.factory.clone();
        let mut player = AudioPlayer::new(
            Uuid::new_v4(),
            &rig.config,
            Arc::clone(&rig.manager),
            factory,
            &mut rig.mixer,
            1,
        )
        .unwrap();
        assert_eq!(player.state(), PlayerState::Created);

        assert!(matches!(
            player.set_data_source(DataSource::Path("/mock/a.wav".into())),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.set_volume(&mut rig.mixer, 0.5, 0.5),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.reset(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(player.position_ms(), Err(Error::IllegalState(_))));
        assert_eq!(player.state(), PlayerState::Created);
        assert_eq!(player.next_poll_hint(Instant::now()), None);

        player.initialize().unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(matches!(player.initialize(), Err(Error::IllegalState(_))));

        // release frees the slot even for a player that was never used
        let mut unused = AudioPlayer::new(
            Uuid::new_v4(),
            &rig.config,
            Arc::clone(&rig.manager),
            rig.factory.clone(),
            &mut rig.mixer,
            2,
        )
        .unwrap();
        unused.release(&mut rig.mixer).unwrap();
        assert_eq!(unused.state(), PlayerState::End);
    }

    #[test]
    fn test_sync_and_async_preparing_are_distinct() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        player
            .set_data_source(DataSource::Path("/mock/stream.wav".into()))
            .unwrap();
        player.prepare_sync().unwrap();
        assert_eq!(player.state(), PlayerState::PreparingSync);
        assert!(player.state().is_preparing());
        poll_until(&mut player, &mut rig, PlayerState::Prepared);

        player.stop(&mut rig.mixer).unwrap();
        player.prepare_async().unwrap();
        assert_eq!(player.state(), PlayerState::PreparingAsync);
        assert!(player.state().is_preparing());
        poll_until(&mut player, &mut rig, PlayerState::Prepared);
    }

    #[test]
    fn test_prepare_reports_event_and_duration() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let events = capture_events(&mut player);

        prepare(&mut player, &mut rig);
        player.dispatch_events();

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[
                PlayerEvent::BufferingUpdate { percent: 0 },
                PlayerEvent::BufferingUpdate { percent: 100 },
                PlayerEvent::Prepared,
            ]
        );
        assert_eq!(player.duration_ms().unwrap(), Some(300));
        assert_eq!(player.position_ms().unwrap(), 0);
    }

    #[test]
    fn test_start_promotes_on_mixer_confirmation() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        prepare(&mut player, &mut rig);

        player.start(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Started);
        assert!(player.is_attached());
        assert!(player.has_ready());

        render(&mut rig, 1);
        let notifications = rig.mixer.poll();
        assert_eq!(notifications.len(), 1);
        assert!(matches!(
            notifications[0],
            MixerNotification::Started {
                cause: MixingStartCause::StartOperation,
                ..
            }
        ));
        for notification in notifications {
            player.handle_notification(&mut rig.mixer, notification);
        }
        assert!(!player.has_ready());
        assert_eq!(player.position_ms().unwrap(), 0);

        // starting again is a no-op and queues nothing
        player.start(&mut rig.mixer).unwrap();
        assert_eq!(route_notifications(&mut player, &mut rig), 0);
    }

    #[test]
    fn test_rapid_seeks_collapse_to_last_target() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let events = capture_events(&mut player);
        prepare(&mut player, &mut rig);
        let t0 = Instant::now();

        player.seek_to(100, t0).unwrap();
        player.poll(&mut rig.mixer, t0 + Duration::from_millis(20), None);
        player.seek_to(150, t0 + Duration::from_millis(25)).unwrap();
        player.seek_to(200, t0 + Duration::from_millis(40)).unwrap();
        player.poll(&mut rig.mixer, t0 + Duration::from_millis(90), None);
        assert_eq!(rig.factory.created(), 1);
        assert_eq!(player.position_ms().unwrap(), 200);

        // the debounce window, measured from the last request, ends at +140
        for i in 0..30 {
            player.poll(&mut rig.mixer, t0 + Duration::from_millis(145 + i), None);
        }
        assert_eq!(rig.factory.created(), 2);
        player.dispatch_events();

        let seeks = rig.factory.seeks();
        assert!(seeks.contains(&200));
        assert!(!seeks.contains(&100));
        assert!(!seeks.contains(&150));
        let log = events.lock().unwrap();
        let seek_events: Vec<_> = log
            .iter()
            .filter(|e| matches!(e, PlayerEvent::SeekComplete { .. }))
            .collect();
        assert_eq!(
            seek_events,
            vec![&PlayerEvent::SeekComplete { position_ms: 200 }]
        );
        drop(log);
        assert_eq!(player.position_ms().unwrap(), 200);
        assert_eq!(player.state(), PlayerState::Prepared);
    }

    #[test]
    fn test_seek_while_started_fades_then_switches() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let events = capture_events(&mut player);
        prepare(&mut player, &mut rig);
        player.start(&mut rig.mixer).unwrap();
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);

        let t0 = Instant::now();
        player.seek_to(250, t0).unwrap();
        for i in 0..30 {
            player.poll(&mut rig.mixer, t0 + Duration::from_millis(101 + i), None);
        }
        assert_eq!(rig.factory.created(), 2);
        player.dispatch_events();
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| !matches!(e, PlayerEvent::SeekComplete { .. })));

        // the fade-out runs to completion on the render path
        render(&mut rig, 150);
        assert_eq!(route_notifications(&mut player, &mut rig), 1);
        // the replacement pipe attaches and the mixer confirms its start
        render(&mut rig, 1);
        let confirmed = route_notifications(&mut player, &mut rig);
        assert_eq!(confirmed, 1);
        player.dispatch_events();
        assert!(events
            .lock()
            .unwrap()
            .contains(&PlayerEvent::SeekComplete { position_ms: 250 }));
        assert_eq!(player.position_ms().unwrap(), 250);
        assert_eq!(player.state(), PlayerState::Started);
    }

    #[test]
    fn test_pause_and_resume_paths() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let events = capture_events(&mut player);
        prepare(&mut player, &mut rig);
        player.start(&mut rig.mixer).unwrap();
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);

        // resume before the fade-out completes: no decoder restart involved
        player.pause(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        player.pause(&mut rig.mixer).unwrap();
        render(&mut rig, 10);
        player.start(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Started);
        // the overriding fade-in finishes without any notification
        render(&mut rig, 150);
        assert_eq!(route_notifications(&mut player, &mut rig), 0);
        assert_eq!(player.state(), PlayerState::Started);

        // full pause: the fade confirms, the decoder halts until restarted
        player.pause(&mut rig.mixer).unwrap();
        render(&mut rig, 150);
        assert_eq!(route_notifications(&mut player, &mut rig), 1);
        assert_eq!(player.state(), PlayerState::Paused);
        player.start(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Started);
        render(&mut rig, 1);
        assert_eq!(route_notifications(&mut player, &mut rig), 1);

        player.dispatch_events();
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| !matches!(e, PlayerEvent::Error { .. })));
    }

    #[test]
    fn test_end_of_data_completes_playback() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let events = capture_events(&mut player);
        prepare(&mut player, &mut rig);
        player.start(&mut rig.mixer).unwrap();
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);

        // drain the whole stream; the end-of-data block stops the slot
        render(&mut rig, 1700);
        assert_eq!(route_notifications(&mut player, &mut rig), 1);
        assert_eq!(player.state(), PlayerState::PlaybackCompleted);
        assert!(!player.is_attached());
        assert_eq!(player.position_ms().unwrap(), 300);
        player.dispatch_events();
        assert!(events.lock().unwrap().contains(&PlayerEvent::Completion));

        // the detach issued on completion confirms on the next pull
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);

        // starting again rewinds from the top with a fresh source
        player.start(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Started);
        for _ in 0..30 {
            player.poll(&mut rig.mixer, Instant::now(), None);
            if player.is_attached() {
                break;
            }
        }
        assert!(player.is_attached());
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);
        assert_eq!(player.position_ms().unwrap(), 0);
        assert_eq!(rig.factory.created(), 2);
    }

    #[test]
    fn test_stop_discards_sources_and_allows_reprepare() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        prepare(&mut player, &mut rig);
        player.start(&mut rig.mixer).unwrap();
        route_notifications(&mut player, &mut rig);

        player.stop(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(!player.is_attached());
        assert!(matches!(
            player.seek_to(10, Instant::now()),
            Err(Error::IllegalState(_))
        ));

        player.prepare_async().unwrap();
        poll_until(&mut player, &mut rig, PlayerState::Prepared);
        player.start(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Started);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        prepare(&mut player, &mut rig);
        player.start(&mut rig.mixer).unwrap();
        route_notifications(&mut player, &mut rig);
        player.set_looping(&mut rig.mixer, true).unwrap();

        player.reset(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(!player.is_looping());
        assert!(matches!(player.duration_ms(), Err(Error::IllegalState(_))));

        player
            .set_data_source(DataSource::Path("/mock/other.wav".into()))
            .unwrap();
        player.prepare_async().unwrap();
        poll_until(&mut player, &mut rig, PlayerState::Prepared);
    }

    #[test]
    fn test_release_is_terminal_and_idempotent() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        prepare(&mut player, &mut rig);
        player.release(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::End);
        player.release(&mut rig.mixer).unwrap();
        assert!(matches!(
            player.start(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            player.reset(&mut rig.mixer),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(player.position_ms(), Err(Error::IllegalState(_))));

        // the released slot is free for a new registration
        let replacement = new_player(&mut rig, 2);
        assert_eq!(replacement.handle().index, player.handle().index);
    }

    #[test]
    fn test_looping_prepares_next_and_rearms_after_fire() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        // enabled before prepare so the end-of-data block carries the loop point
        player
            .set_data_source(DataSource::Path("/mock/stream.wav".into()))
            .unwrap();
        player.set_looping(&mut rig.mixer, true).unwrap();
        player.prepare_async().unwrap();
        poll_until(&mut player, &mut rig, PlayerState::Prepared);
        player.start(&mut rig.mixer).unwrap();
        render(&mut rig, 1);
        route_notifications(&mut player, &mut rig);

        for _ in 0..30 {
            player.poll(&mut rig.mixer, Instant::now(), None);
            if player.loop_armed() {
                break;
            }
        }
        assert!(player.has_next());
        assert!(player.loop_armed());
        assert_eq!(rig.factory.created(), 2);

        // the render path fires the loop at the end-of-data boundary
        render(&mut rig, 1700);
        assert_eq!(route_notifications(&mut player, &mut rig), 2);
        assert_eq!(player.state(), PlayerState::Started);
        assert!(!player.has_next());
        assert!(!player.loop_armed());

        // the following cycles prepare and arm a fresh rewind
        for _ in 0..30 {
            player.poll(&mut rig.mixer, Instant::now(), None);
            if player.loop_armed() {
                break;
            }
        }
        assert!(player.loop_armed());
        assert_eq!(rig.factory.created(), 3);

        player.set_looping(&mut rig.mixer, false).unwrap();
        assert!(!player.loop_armed());
        assert!(!player.has_next());
    }

    #[test]
    fn test_gapless_handoff_links_two_players() {
        let mut rig = rig();
        let mut first = new_player(&mut rig, 1);
        let mut second = new_player(&mut rig, 2);
        let first_events = capture_events(&mut first);
        let second_events = capture_events(&mut second);

        prepare(&mut first, &mut rig);
        prepare(&mut second, &mut rig);
        first.set_next_player(Some(second.id())).unwrap();

        first.start(&mut rig.mixer).unwrap();
        render(&mut rig, 1);
        route_two(&mut first, &mut second, &mut rig);

        let link = second.handoff_link().expect("second player link");
        first.poll(&mut rig.mixer, Instant::now(), Some(link));
        assert!(first.handoff_armed());

        // the render path hits first's end of stream and switches slots
        render(&mut rig, 1700);
        assert_eq!(route_two(&mut first, &mut second, &mut rig), 2);

        assert_eq!(first.state(), PlayerState::PlaybackCompleted);
        assert_eq!(second.state(), PlayerState::Started);
        first.dispatch_events();
        second.dispatch_events();
        assert!(first_events
            .lock()
            .unwrap()
            .contains(&PlayerEvent::Completion));
        assert!(second_events
            .lock()
            .unwrap()
            .iter()
            .all(|e| !matches!(e, PlayerEvent::Error { .. })));
        assert_eq!(second.position_ms().unwrap(), 0);
    }

    #[test]
    fn test_volume_clamps() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        player.set_volume(&mut rig.mixer, 1.7, -0.3).unwrap();
        assert_eq!(player.volume(), (1.0, 0.0));
    }

    #[test]
    fn test_poll_hint_tracks_outstanding_work() {
        let mut rig = rig();
        let mut player = new_player(&mut rig, 1);
        let t0 = Instant::now();
        assert_eq!(player.next_poll_hint(t0), None);

        player
            .set_data_source(DataSource::Path("/mock/a.wav".into()))
            .unwrap();
        assert_eq!(player.next_poll_hint(t0), None);
        player.prepare_async().unwrap();
        assert_eq!(player.next_poll_hint(t0), Some(Duration::ZERO));

        poll_until(&mut player, &mut rig, PlayerState::Prepared);
        // the prepared event is still queued for delivery
        assert_eq!(player.next_poll_hint(t0), Some(Duration::ZERO));
        player.dispatch_events();
        assert_eq!(player.next_poll_hint(t0), None);

        player.seek_to(50, t0).unwrap();
        assert_eq!(player.next_poll_hint(t0), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_prepare_failure_enters_error_state() {
        let mut rig = rig();
        let bad_info = StreamInfo {
            sample_rate: 44_056,
            channels: 2,
            duration_ms: None,
        };
        let factory: Arc<dyn DecoderFactory> = ScriptedFactory::new(bad_info, 64);
        let mut player = AudioPlayer::new(
            Uuid::new_v4(),
            &rig.config,
            Arc::clone(&rig.manager),
            factory,
            &mut rig.mixer,
            9,
        )
        .unwrap();
        player.initialize().unwrap();
        let events = capture_events(&mut player);
        player
            .set_data_source(DataSource::Path("/mock/bad.wav".into()))
            .unwrap();
        player.prepare_async().unwrap();
        for _ in 0..30 {
            player.poll(&mut rig.mixer, Instant::now(), None);
            if player.state() == PlayerState::Error {
                break;
            }
        }
        assert_eq!(player.state(), PlayerState::Error);
        assert_eq!(player.error_origin(), Some(PlayerState::PreparingAsync));
        assert!(matches!(
            player.last_error(),
            Some(Error::ContentUnsupported(_))
        ));
        player.dispatch_events();
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            PlayerEvent::Error {
                kind: ErrorKind::ContentUnsupported,
                ..
            }
        )));

        player.reset(&mut rig.mixer).unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
    }
}
