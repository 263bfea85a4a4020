//! Crossfade/trigger mixer
//!
//! Split in two across the real-time boundary:
//!
//! - [`AudioMixer`] (this module) runs on the control thread. It owns the
//!   slot registry, validates every operation, performs port-claim
//!   bookkeeping against the [`PipeManager`], and talks to the render side
//!   through SPSC rings.
//! - [`MixerRender`](render) runs on the audio callback thread behind a
//!   [`SinkFeed`]. It consumes source pipes, applies fades, and evaluates
//!   triggers sample-aligned.
//!
//! Multi-slot reconfigurations that must appear atomic to the render path
//! (fade out one slot while fading in another) accumulate in a
//! [`DeferredApplication`] and ship as a single command.

mod render;
mod slot;

pub use render::SinkFeed;
pub use slot::{
    FadeDuration, MixMode, MixerNotification, MixingStartCause, MixingStopCause,
    SlotOperation, SlotParams, SlotUpdate, SourceClientHandle, StopConditions,
    TriggerConfig,
};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pipe::{PipeManager, PortDirection, PortUser, SourcePipe};
use render::{MixerRender, RenderConfig};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use slot::RenderCommand;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const COMMAND_RING_CAPACITY: usize = 64;
const EVENT_RING_CAPACITY: usize = 256;

/// Control-side mixer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    NotInitialized,
    Stopped,
    Started,
    /// Started but idling: the render path produces nothing and the sink
    /// can be paused without tearing it down
    Suspended,
}

/// Accumulates slot updates for one atomic commit
#[derive(Default)]
pub struct DeferredApplication {
    updates: Vec<SlotUpdate>,
}

impl DeferredApplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

/// Control-side view of one registered slot
struct RegistryEntry {
    sequence_no: u32,
    client_id: u32,

    /// Pipe the render path is (or will be) consuming
    pipe: Option<Arc<SourcePipe>>,

    /// Trigger replacement pipe, pre-claimed at arm time; becomes `pipe`
    /// when the render path confirms the triggered start
    pending_start_pipe: Option<Arc<SourcePipe>>,

    /// Pipe awaiting detach confirmation before its claim is released
    detaching: Option<Arc<SourcePipe>>,
}

struct ControlLink {
    manager: Arc<PipeManager>,
    commands: HeapProd<RenderCommand>,
    events: HeapCons<MixerNotification>,
    feed: SinkFeed,
    lost_events: Arc<AtomicU64>,
    lost_events_seen: u64,
}

/// Crossfade/trigger mixer, control side
pub struct AudioMixer {
    state: MixerState,
    render_config: RenderConfig,
    registry: Vec<Option<RegistryEntry>>,
    sequence_counter: u32,
    muted: bool,
    link: Option<ControlLink>,
}

impl AudioMixer {
    pub fn new(config: &EngineConfig) -> Self {
        let frames_for = |ms: u32| -> u32 {
            (ms as u64 * config.output_sample_rate as u64 / 1000).max(1) as u32
        };
        let render_config = RenderConfig {
            slot_count: config.source_pipe_count,
            block_frames: config.block_frames,
            short_fade_frames: frames_for(config.short_fade_ms),
            long_fade_frames: frames_for(config.long_fade_ms),
        };
        Self {
            state: MixerState::NotInitialized,
            render_config,
            registry: (0..config.source_pipe_count).map(|_| None).collect(),
            sequence_counter: 0,
            muted: false,
            link: None,
        }
    }

    /// Wire up the render path and hand back the feed for the sink backend
    pub fn initialize(&mut self, manager: Arc<PipeManager>) -> Result<SinkFeed> {
        if self.state != MixerState::NotInitialized {
            return Err(Error::IllegalState("mixer already initialized".to_string()));
        }

        let (cmd_prod, cmd_cons) = HeapRb::<RenderCommand>::new(COMMAND_RING_CAPACITY).split();
        let (evt_prod, evt_cons) = HeapRb::<MixerNotification>::new(EVENT_RING_CAPACITY).split();
        let lost_events = Arc::new(AtomicU64::new(0));

        // The mixer produces into the sink pipe; the backend consumes it
        manager.set_sink_pipe_port_user(PortDirection::Input, PortUser::Mixer, true);

        let render = MixerRender::new(
            self.render_config,
            manager.sink_pipe(),
            manager.capture_pipe(),
            cmd_cons,
            evt_prod,
            Arc::clone(&lost_events),
        );
        let feed = SinkFeed::new(render, manager.sink_pipe());

        self.link = Some(ControlLink {
            manager,
            commands: cmd_prod,
            events: evt_cons,
            feed: feed.clone(),
            lost_events,
            lost_events_seen: 0,
        });
        self.state = MixerState::Stopped;
        info!(
            "mixer initialized: {} slots, {} frame blocks",
            self.render_config.slot_count, self.render_config.block_frames
        );
        Ok(feed)
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    pub fn start(&mut self, suspended: bool) -> Result<()> {
        if self.state != MixerState::Stopped {
            return Err(Error::IllegalState(format!(
                "start in {:?}",
                self.state
            )));
        }
        self.state = if suspended {
            MixerState::Suspended
        } else {
            MixerState::Started
        };
        self.send(RenderCommand::SetRunning(!suspended))?;
        debug!("mixer started (suspended={})", suspended);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            MixerState::Started | MixerState::Suspended => {
                self.state = MixerState::Stopped;
                self.send(RenderCommand::SetRunning(false))?;
                debug!("mixer stopped");
                Ok(())
            }
            _ => Err(Error::IllegalState(format!("stop in {:?}", self.state))),
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        if self.state != MixerState::Started {
            return Err(Error::IllegalState(format!(
                "suspend in {:?}",
                self.state
            )));
        }
        self.state = MixerState::Suspended;
        self.send(RenderCommand::SetRunning(false))?;
        debug!("mixer suspended");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != MixerState::Suspended {
            return Err(Error::IllegalState(format!(
                "resume in {:?}",
                self.state
            )));
        }
        self.state = MixerState::Started;
        self.send(RenderCommand::SetRunning(true))?;
        debug!("mixer resumed");
        Ok(())
    }

    /// Gate the final mixed output; sources keep consuming while muted
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        if self.muted == muted {
            return Ok(());
        }
        self.send(RenderCommand::SetMuted(muted))?;
        self.muted = muted;
        debug!("mixer muted={}", muted);
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Allocate a slot and hand back its handle
    pub fn register_source_client(&mut self, client_id: u32) -> Result<SourceClientHandle> {
        self.require_initialized()?;
        let Some(index) = self.registry.iter().position(Option::is_none) else {
            return Err(Error::ResourceAllocationFailed(
                "no free mixer slot".to_string(),
            ));
        };
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        let sequence_no = self.sequence_counter;
        self.registry[index] = Some(RegistryEntry {
            sequence_no,
            client_id,
            pipe: None,
            pending_start_pipe: None,
            detaching: None,
        });
        self.send(RenderCommand::Register {
            index: index as u32,
            sequence_no,
            client_id,
        })?;
        debug!("registered source client {} in slot {}", client_id, index);
        Ok(SourceClientHandle {
            index: index as u32,
            sequence_no,
            client_id,
        })
    }

    /// Free a slot, releasing every pipe claim it still holds
    pub fn unregister_source_client(&mut self, handle: SourceClientHandle) -> Result<()> {
        let manager = self.manager()?;
        self.validate_handle(handle)?;
        let index = handle.index as usize;
        if let Some(entry) = self.registry[index].take() {
            for pipe in [entry.pipe, entry.pending_start_pipe, entry.detaching]
                .into_iter()
                .flatten()
            {
                manager.set_source_pipe_port_user(
                    &pipe,
                    PortDirection::Output,
                    PortUser::Mixer,
                    false,
                );
            }
        }
        self.send(RenderCommand::Unregister {
            index: handle.index,
        })?;
        debug!("unregistered source client {}", handle.client_id);
        Ok(())
    }

    /// Configure one slot: pipe attachment, mix mode, triggers, stop
    /// conditions, and an optional start/stop/detach operation
    ///
    /// With `deferred` the update joins a batch committed later by
    /// [`apply`](Self::apply); otherwise it ships immediately.
    pub fn attach_or_update_source_pipe(
        &mut self,
        mut update: SlotUpdate,
        deferred: Option<&mut DeferredApplication>,
    ) -> Result<()> {
        let manager = self.manager()?;
        self.validate_handle(update.handle)?;
        if let Some(trigger) = &update.params.loop_trigger {
            self.validate_handle(trigger.target)?;
        }
        if let Some(trigger) = &update.params.no_loop_trigger {
            self.validate_handle(trigger.target)?;
        }
        update.params.volume_left = update.params.volume_left.clamp(0.0, 1.0);
        update.params.volume_right = update.params.volume_right.clamp(0.0, 1.0);

        let index = update.handle.index as usize;

        // Claim bookkeeping happens before the command ships so backing
        // memory exists by the time the render path touches a pipe.
        if let Some(new_pipe) = &update.params.pipe {
            let previous = self.entry_mut(index)?.pipe.replace(Arc::clone(new_pipe));
            manager.set_source_pipe_port_user(
                new_pipe,
                PortDirection::Output,
                PortUser::Mixer,
                true,
            );
            if let Some(old) = previous {
                if !Arc::ptr_eq(&old, new_pipe) {
                    manager.set_source_pipe_port_user(
                        &old,
                        PortDirection::Output,
                        PortUser::Mixer,
                        false,
                    );
                }
            }
        }
        for trigger in [
            update.params.loop_trigger.clone(),
            update.params.no_loop_trigger.clone(),
        ]
        .into_iter()
        .flatten()
        {
            let target_index = trigger.target.index as usize;
            let replaced = self
                .entry_mut(target_index)?
                .pending_start_pipe
                .replace(Arc::clone(&trigger.pipe));
            manager.set_source_pipe_port_user(
                &trigger.pipe,
                PortDirection::Output,
                PortUser::Mixer,
                true,
            );
            if let Some(old) = replaced {
                if !Arc::ptr_eq(&old, &trigger.pipe) {
                    manager.set_source_pipe_port_user(
                        &old,
                        PortDirection::Output,
                        PortUser::Mixer,
                        false,
                    );
                }
            }
        }
        if update.operation == SlotOperation::Detach {
            let entry = self.entry_mut(index)?;
            // Claim released when the render path confirms the detach
            entry.detaching = entry.pipe.take();
        }

        match deferred {
            Some(batch) => {
                batch.updates.push(update);
                Ok(())
            }
            None => self.send(RenderCommand::Apply(vec![update])),
        }
    }

    /// Release a pre-claimed trigger pipe that will no longer be started
    ///
    /// Disarming a trigger removes it from the source slot's params, but the
    /// replacement pipe's claim sits on the target entry until the trigger
    /// fires; this drops that claim when the trigger never will.
    pub fn clear_pending_start(&mut self, handle: SourceClientHandle) -> Result<()> {
        let manager = self.manager()?;
        self.validate_handle(handle)?;
        if let Some(pipe) = self
            .entry_mut(handle.index as usize)?
            .pending_start_pipe
            .take()
        {
            manager.set_source_pipe_port_user(&pipe, PortDirection::Output, PortUser::Mixer, false);
        }
        Ok(())
    }

    /// Commit a deferred batch as one atomic render-side application
    pub fn apply(&mut self, deferred: DeferredApplication) -> Result<()> {
        self.require_initialized()?;
        if deferred.updates.is_empty() {
            return Ok(());
        }
        self.send(RenderCommand::Apply(deferred.updates))
    }

    /// True when poll() has render-side events to hand out
    pub fn is_polling_required(&self) -> bool {
        match &self.link {
            Some(link) => link.events.occupied_len() > 0,
            None => false,
        }
    }

    /// Drain render-side notifications, performing claim bookkeeping
    ///
    /// Must run on the control thread; the returned events drive player
    /// slot promotion.
    pub fn poll(&mut self) -> Vec<MixerNotification> {
        let Some(link) = self.link.as_mut() else {
            return Vec::new();
        };
        // Keep configuration moving while the device is not pulling
        if self.state != MixerState::Started {
            link.feed.pump();
        }

        let mut notifications = Vec::new();
        while let Some(event) = link.events.try_pop() {
            notifications.push(event);
        }
        let lost = link.lost_events.load(Ordering::Relaxed);
        if lost > link.lost_events_seen {
            warn!(
                "mixer event ring overflow: {} notifications lost",
                lost - link.lost_events_seen
            );
            link.lost_events_seen = lost;
        }

        for event in &notifications {
            self.track_notification(*event);
        }
        notifications
    }

    fn track_notification(&mut self, event: MixerNotification) {
        let index = event.handle().index as usize;
        let Some(Some(entry)) = self.registry.get_mut(index) else {
            return;
        };
        if entry.sequence_no != event.handle().sequence_no {
            return;
        }
        match event {
            MixerNotification::Stopped { cause, .. } => match cause {
                MixingStopCause::DetachOperation => {
                    if let (Some(pipe), Some(link)) = (entry.detaching.take(), self.link.as_ref())
                    {
                        link.manager.set_source_pipe_port_user(
                            &pipe,
                            PortDirection::Output,
                            PortUser::Mixer,
                            false,
                        );
                    }
                }
                MixingStopCause::LoopTriggered | MixingStopCause::NoLoopTriggered => {
                    // The ended pipe leaves the render path; drop its claim
                    if let (Some(pipe), Some(link)) = (entry.pipe.take(), self.link.as_ref()) {
                        link.manager.set_source_pipe_port_user(
                            &pipe,
                            PortDirection::Output,
                            PortUser::Mixer,
                            false,
                        );
                    }
                }
                MixingStopCause::EndOfDataWithLoopPoint => {
                    // Tolerated inconsistency: the source announced a loop
                    // point but no loop trigger was armed.
                    warn!(
                        "slot {}: loop-point completion with no loop trigger armed",
                        index
                    );
                }
                _ => {}
            },
            MixerNotification::Started { cause, .. } => match cause {
                MixingStartCause::LoopTriggered | MixingStartCause::NoLoopTriggered => {
                    // The pre-claimed trigger pipe is now the active one
                    entry.pipe = entry.pending_start_pipe.take();
                }
                MixingStartCause::StartOperation => {}
            },
        }
    }

    fn require_initialized(&self) -> Result<()> {
        if self.state == MixerState::NotInitialized {
            return Err(Error::IllegalState("mixer not initialized".to_string()));
        }
        Ok(())
    }

    fn manager(&self) -> Result<Arc<PipeManager>> {
        self.link
            .as_ref()
            .map(|link| Arc::clone(&link.manager))
            .ok_or_else(|| Error::IllegalState("mixer not initialized".to_string()))
    }

    fn validate_handle(&self, handle: SourceClientHandle) -> Result<()> {
        let index = handle.index as usize;
        match self.registry.get(index) {
            Some(Some(entry)) if entry.sequence_no == handle.sequence_no => Ok(()),
            _ => Err(Error::IllegalArgument(format!(
                "stale or unknown source client handle (slot {})",
                index
            ))),
        }
    }

    fn entry_mut(&mut self, index: usize) -> Result<&mut RegistryEntry> {
        self.registry
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown slot {}", index)))
    }

    fn send(&mut self, command: RenderCommand) -> Result<()> {
        let state = self.state;
        let Some(link) = self.link.as_mut() else {
            return Err(Error::IllegalState("mixer not initialized".to_string()));
        };
        link.commands
            .try_push(command)
            .map_err(|_| Error::Internal("mixer command ring full".to_string()))?;
        // Ensure delivery even while the device callback is not pulling
        if state != MixerState::Started {
            link.feed.pump();
        }
        Ok(())
    }
}

// ======== Tests ========
