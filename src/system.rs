//! Engine composition and poll scheduling
//!
//! [`AudioSystem`] assembles the whole engine: the pipe pools, the mixer,
//! the sink backend, the decoder factory, and a registry of players
//! addressed by id. All non-real-time mutation funnels through one control
//! thread calling [`poll`](AudioSystem::poll);
//! [`determine_next_polling_time`](AudioSystem::determine_next_polling_time)
//! tells the caller's event loop when the next call is due, so a fully idle
//! engine costs nothing between external requests.
//!
//! The suspend control watches render demand: once no player has needed the
//! render path for a grace period, the mixer is suspended and the sink
//! paused without tearing the device down; the next start (or an unfinished
//! fade) brings both back.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{DataSource, DecoderFactory, SinkBackend, SinkConfig};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::PlayerEventListener;
use crate::mixer::{AudioMixer, MixerState};
use crate::pipe::{PipeManager, PortDirection, PortUser, RecycledBlock};
use crate::player::{AudioPlayer, NextPlayerLink, PlayerState};

/// Consecutive polls without render demand before the engine suspends
const SUSPEND_GRACE_POLLS: u32 = 10;

/// When the caller's event loop should drive [`AudioSystem::poll`] next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSchedule {
    /// Work is pending now; poll again without waiting
    Immediate,

    /// Nothing due yet; poll after at most this long
    After(Duration),

    /// Fully idle; only an external call creates new work
    Idle,
}

/// Receiver for captured mixed output
///
/// Invoked on the control thread during [`AudioSystem::poll`]. `samples` is
/// one interleaved stereo block at the output rate, `position_ms` the sink
/// stream position it was mixed for, and `timestamp_ms` the wall-clock
/// milliseconds when the render path produced it.
pub trait CaptureListener: Send {
    fn on_captured(&mut self, samples: &[f32], position_ms: u32, timestamp_ms: u64);
}

impl<F: FnMut(&[f32], u32, u64) + Send> CaptureListener for F {
    fn on_captured(&mut self, samples: &[f32], position_ms: u32, timestamp_ms: u64) {
        self(samples, position_ms, timestamp_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemState {
    Created,
    Running,
    ShutDown,
}

/// Top-level engine instance; one per output device
pub struct AudioSystem {
    config: EngineConfig,
    state: SystemState,
    manager: Arc<PipeManager>,
    mixer: AudioMixer,
    sink: Box<dyn SinkBackend>,
    factory: Arc<dyn DecoderFactory>,
    players: Vec<AudioPlayer>,
    next_client_id: u32,
    desired_muted: bool,
    capture_listener: Option<Box<dyn CaptureListener>>,
    idle_polls: u32,
}

impl AudioSystem {
    /// Build an engine from its configuration and external collaborators.
    ///
    /// The configuration is validated here, once; nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: EngineConfig,
        sink: Box<dyn SinkBackend>,
        factory: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(PipeManager::new(&config));
        let mixer = AudioMixer::new(&config);
        Ok(Self {
            config,
            state: SystemState::Created,
            manager,
            mixer,
            sink,
            factory,
            players: Vec::new(),
            next_client_id: 0,
            desired_muted: false,
            capture_listener: None,
            idle_polls: 0,
        })
    }

    /// Wire the render path, open the sink device, and start everything.
    ///
    /// The mixer starts live; the suspend control idles it again once no
    /// player has rendered for a grace period.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != SystemState::Created {
            return Err(Error::IllegalState(format!(
                "initialize while {:?}",
                self.state
            )));
        }
        let feed = self.mixer.initialize(Arc::clone(&self.manager))?;
        let sink_config = SinkConfig {
            sample_rate: self.config.output_sample_rate,
            channels: 2,
            block_frames: self.config.block_frames,
        };
        self.sink.initialize(&sink_config, feed)?;
        self.sink.start()?;
        self.mixer.start(false)?;
        self.state = SystemState::Running;
        info!(
            "engine running: {} Hz, {} frame blocks, {} mixer slots",
            self.config.output_sample_rate, self.config.block_frames, self.config.source_pipe_count
        );
        Ok(())
    }

    /// Release every player and stop the mixer and sink. Terminal.
    pub fn shutdown(&mut self) -> Result<()> {
        self.require_running("shutdown")?;
        for mut player in self.players.drain(..) {
            if let Err(error) = player.release(&mut self.mixer) {
                warn!(
                    "player {} release during shutdown failed: {}",
                    player.id(),
                    error
                );
            }
        }
        self.release_capture();
        if let Err(error) = self.mixer.stop() {
            warn!("mixer stop during shutdown failed: {}", error);
        }
        if let Err(error) = self.sink.stop() {
            warn!("sink stop during shutdown failed: {}", error);
        }
        self.state = SystemState::ShutDown;
        info!("engine shut down");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Device buffering depth reported by the sink backend
    pub fn latency_frames(&self) -> usize {
        self.sink.latency_frames()
    }

    /// Create a player, allocating one mixer slot for its lifetime.
    pub fn create_player(&mut self) -> Result<Uuid> {
        self.require_running("create_player")?;
        let id = Uuid::new_v4();
        let client_id = self.next_client_id;
        let mut player = AudioPlayer::new(
            id,
            &self.config,
            Arc::clone(&self.manager),
            Arc::clone(&self.factory),
            &mut self.mixer,
            client_id,
        )?;
        player.initialize()?;
        self.next_client_id += 1;
        self.players.push(player);
        debug!("created player {} (client {})", id, client_id);
        Ok(id)
    }

    /// Release a player and drop it from the registry.
    ///
    /// Chains from other players that pointed at it are cleared.
    pub fn release_player(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("release_player")?;
        let index = self.player_index(player_id)?;
        self.players[index].release(&mut self.mixer)?;
        self.players.remove(index);
        for player in &mut self.players {
            if player.next_player() == Some(player_id) {
                if let Err(error) = player.set_next_player(None) {
                    debug!(
                        "clearing chain from player {} to released {} failed: {}",
                        player.id(),
                        player_id,
                        error
                    );
                }
            }
        }
        debug!("released player {}", player_id);
        Ok(())
    }

    /// Bind the stream `player_id` will play.
    pub fn set_data_source(&mut self, player_id: Uuid, source: DataSource) -> Result<()> {
        self.require_running("set_data_source")?;
        let index = self.player_index(player_id)?;
        self.players[index].set_data_source(source)
    }

    /// Begin asynchronous preparation; completion arrives as an event.
    pub fn prepare_async(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("prepare_async")?;
        let index = self.player_index(player_id)?;
        self.players[index].prepare_async()
    }

    /// Prepare synchronously, driving [`poll`](Self::poll) until the player
    /// leaves the preparing state or the configured timeout expires.
    ///
    /// On timeout the attempt is left running; the caller either keeps
    /// waiting through events or calls [`reset`](Self::reset).
    pub fn prepare(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("prepare")?;
        let index = self.player_index(player_id)?;
        self.players[index].prepare_sync()?;
        let deadline =
            Instant::now() + Duration::from_millis(self.config.prepare_timeout_ms as u64);
        loop {
            self.poll();
            match self.players[index].state() {
                PlayerState::PreparingSync => {}
                PlayerState::Prepared => return Ok(()),
                _ => {
                    return Err(self.players[index]
                        .last_error()
                        .unwrap_or_else(|| Error::Internal("preparation failed".to_string())));
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut(format!(
                    "prepare exceeded {} ms",
                    self.config.prepare_timeout_ms
                )));
            }
            match self.determine_next_polling_time() {
                PollSchedule::Immediate => {}
                PollSchedule::After(wait) => thread::sleep(wait),
                PollSchedule::Idle => thread::sleep(self.config.poll_interval()),
            }
        }
    }

    /// Start or resume playback.
    pub fn start(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("start")?;
        let index = self.player_index(player_id)?;
        self.players[index].start(&mut self.mixer)
    }

    /// Fade out and pause.
    pub fn pause(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("pause")?;
        let index = self.player_index(player_id)?;
        self.players[index].pause(&mut self.mixer)
    }

    /// Halt playback and discard prepared sources.
    pub fn stop(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("stop")?;
        let index = self.player_index(player_id)?;
        self.players[index].stop(&mut self.mixer)
    }

    /// Return a player to idle, keeping its volume and listener.
    pub fn reset(&mut self, player_id: Uuid) -> Result<()> {
        self.require_running("reset")?;
        let index = self.player_index(player_id)?;
        self.players[index].reset(&mut self.mixer)
    }

    /// Request a debounced seek to `position_ms`.
    pub fn seek_to(&mut self, player_id: Uuid, position_ms: u32) -> Result<()> {
        self.require_running("seek_to")?;
        let index = self.player_index(player_id)?;
        self.players[index].seek_to(position_ms, Instant::now())
    }

    /// Set one player's per-channel volume.
    pub fn set_volume(&mut self, player_id: Uuid, left: f32, right: f32) -> Result<()> {
        self.require_running("set_volume")?;
        let index = self.player_index(player_id)?;
        self.players[index].set_volume(&mut self.mixer, left, right)
    }

    /// Enable or disable seamless looping for one player.
    pub fn set_looping(&mut self, player_id: Uuid, looping: bool) -> Result<()> {
        self.require_running("set_looping")?;
        let index = self.player_index(player_id)?;
        self.players[index].set_looping(&mut self.mixer, looping)
    }

    /// Chain `next` to take over when `player_id` finishes while not
    /// looping; `None` clears the chain. Both players must exist.
    pub fn set_next_player(&mut self, player_id: Uuid, next: Option<Uuid>) -> Result<()> {
        self.require_running("set_next_player")?;
        if let Some(next_id) = next {
            if !self.players.iter().any(|player| player.id() == next_id) {
                return Err(Error::IllegalArgument(format!("no such player {}", next_id)));
            }
        }
        let index = self.player_index(player_id)?;
        self.players[index].set_next_player(next)
    }

    /// Install or remove one player's event listener.
    pub fn set_event_listener(
        &mut self,
        player_id: Uuid,
        listener: Option<PlayerEventListener>,
    ) -> Result<()> {
        self.require_running("set_event_listener")?;
        let index = self.player_index(player_id)?;
        self.players[index].set_event_listener(listener);
        Ok(())
    }

    pub fn player_state(&self, player_id: Uuid) -> Result<PlayerState> {
        let index = self.player_index(player_id)?;
        Ok(self.players[index].state())
    }

    /// Current stream position of one player in milliseconds.
    pub fn position_ms(&self, player_id: Uuid) -> Result<u32> {
        let index = self.player_index(player_id)?;
        self.players[index].position_ms()
    }

    /// Stream duration of one player, when known.
    pub fn duration_ms(&self, player_id: Uuid) -> Result<Option<u32>> {
        let index = self.player_index(player_id)?;
        self.players[index].duration_ms()
    }

    /// Gate the final mixed output without stopping consumption.
    ///
    /// Applied by the mute control phase of the next [`poll`](Self::poll).
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.require_running("set_muted")?;
        self.desired_muted = muted;
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.desired_muted
    }

    /// Master gain applied by the sink after mixing.
    pub fn set_master_volume(&mut self, volume: f32) -> Result<()> {
        self.require_running("set_master_volume")?;
        self.sink.set_volume(volume);
        Ok(())
    }

    /// Install or remove the capture listener receiving the mixed output.
    ///
    /// Requires `capture_enabled` in the configuration. Installing claims
    /// the capture pipe, which allocates its buffer and switches the
    /// render-side tap on; removal releases both again.
    pub fn set_capture_listener(
        &mut self,
        listener: Option<Box<dyn CaptureListener>>,
    ) -> Result<()> {
        self.require_running("set_capture_listener")?;
        let Some(listener) = listener else {
            self.release_capture();
            return Ok(());
        };
        if !self.config.capture_enabled {
            return Err(Error::IllegalState(
                "capture is disabled in the engine configuration".to_string(),
            ));
        }
        if self.capture_listener.is_none() {
            self.manager
                .set_capture_pipe_port_user(PortDirection::Input, PortUser::Mixer, true);
            self.manager.set_capture_pipe_port_user(
                PortDirection::Output,
                PortUser::CaptureClient,
                true,
            );
        }
        self.capture_listener = Some(listener);
        Ok(())
    }

    /// Run one control cycle.
    ///
    /// Phases run in a fixed order: mute control, suspend-resume control,
    /// per-player polling, mixer notification routing, recycle delivery,
    /// and capture delivery. Player events queued by any phase are
    /// dispatched to their listeners at the end, once all state has
    /// settled.
    pub fn poll(&mut self) {
        if self.state != SystemState::Running {
            return;
        }

        self.control_mute();
        self.control_suspend_resume();

        // Resolve handoff coordinates up front so each player sees its
        // chained successor's current prepared pipe.
        let now = Instant::now();
        let links: Vec<Option<NextPlayerLink>> = self
            .players
            .iter()
            .map(|player| {
                player
                    .next_player()
                    .and_then(|id| self.players.iter().find(|p| p.id() == id))
                    .and_then(AudioPlayer::handoff_link)
            })
            .collect();
        for (player, link) in self.players.iter_mut().zip(links) {
            player.poll(&mut self.mixer, now, link);
        }

        let notifications = self.mixer.poll();
        for notification in notifications {
            let client_id = notification.handle().client_id();
            let target = self
                .players
                .iter_mut()
                .find(|player| player.handle().client_id() == client_id);
            match target {
                Some(player) => player.handle_notification(&mut self.mixer, notification),
                None => warn!("dropping mixer notification for unknown client {}", client_id),
            }
        }

        if self.manager.is_polling_required() {
            let players = &self.players;
            self.manager.poll(&mut |item: RecycledBlock| {
                for player in players {
                    player.on_recycle(&item);
                }
            });
        }

        self.deliver_captured();

        for player in &mut self.players {
            player.dispatch_events();
        }
    }

    /// When the next [`poll`](Self::poll) is due.
    ///
    /// The sole scheduling contract: callers may sleep for the returned
    /// wait, or indefinitely on [`PollSchedule::Idle`], as long as any
    /// external call on the system is followed by a fresh query.
    pub fn determine_next_polling_time(&self) -> PollSchedule {
        if self.state != SystemState::Running {
            return PollSchedule::Idle;
        }
        if self.mixer.is_muted() != self.desired_muted
            || self.mixer.is_polling_required()
            || self.manager.is_polling_required()
        {
            return PollSchedule::Immediate;
        }
        if self.capture_listener.is_some() && self.manager.capture_pipe().pending_len() > 0 {
            return PollSchedule::Immediate;
        }

        let now = Instant::now();
        let mut wait: Option<Duration> = None;
        for player in &self.players {
            if let Some(hint) = player.next_poll_hint(now) {
                if hint.is_zero() {
                    return PollSchedule::Immediate;
                }
                wait = Some(match wait {
                    Some(current) => current.min(hint),
                    None => hint,
                });
            }
        }
        // While the mixer runs, the periodic cadence also advances the
        // suspend grace countdown.
        if self.mixer.state() == MixerState::Started {
            let interval = self.config.poll_interval();
            wait = Some(match wait {
                Some(current) => current.min(interval),
                None => interval,
            });
        }
        match wait {
            Some(duration) => PollSchedule::After(duration),
            None => PollSchedule::Idle,
        }
    }

    fn control_mute(&mut self) {
        if self.mixer.is_muted() != self.desired_muted {
            if let Err(error) = self.mixer.set_muted(self.desired_muted) {
                warn!("mute control failed: {}", error);
            }
        }
    }

    /// Suspend the render path after a grace period without demand; bring
    /// it back the moment any player needs it again.
    fn control_suspend_resume(&mut self) {
        let rendering = self.players.iter().any(|p| p.is_rendering_required());
        match self.mixer.state() {
            MixerState::Started if rendering => {
                self.idle_polls = 0;
            }
            MixerState::Started => {
                self.idle_polls = self.idle_polls.saturating_add(1);
                if self.idle_polls >= SUSPEND_GRACE_POLLS {
                    debug!("no render demand for {} polls, suspending", self.idle_polls);
                    if let Err(error) = self.mixer.suspend() {
                        warn!("mixer suspend failed: {}", error);
                        return;
                    }
                    if let Err(error) = self.sink.pause() {
                        warn!("sink pause failed: {}", error);
                    }
                }
            }
            MixerState::Suspended if rendering => {
                self.idle_polls = 0;
                if let Err(error) = self.mixer.resume() {
                    warn!("mixer resume failed: {}", error);
                    return;
                }
                if let Err(error) = self.sink.resume() {
                    warn!("sink resume failed: {}", error);
                }
                debug!("render demand returned, resumed");
            }
            _ => {}
        }
    }

    fn deliver_captured(&mut self) {
        let Some(listener) = self.capture_listener.as_mut() else {
            return;
        };
        let capture = self.manager.capture_pipe();
        while let Some(block) = capture.read_captured() {
            listener.on_captured(block.samples(), block.position_ms, block.timestamp_ms);
            capture.return_captured(block);
        }
    }

    fn release_capture(&mut self) {
        if self.capture_listener.take().is_some() {
            self.manager.set_capture_pipe_port_user(
                PortDirection::Output,
                PortUser::CaptureClient,
                false,
            );
            self.manager
                .set_capture_pipe_port_user(PortDirection::Input, PortUser::Mixer, false);
        }
    }

    fn player_index(&self, player_id: Uuid) -> Result<usize> {
        self.players
            .iter()
            .position(|player| player.id() == player_id)
            .ok_or_else(|| Error::IllegalArgument(format!("no such player {}", player_id)))
    }

    fn require_running(&self, operation: &str) -> Result<()> {
        if self.state == SystemState::Running {
            Ok(())
        } else {
            Err(Error::IllegalState(format!(
                "{} while engine is {:?}",
                operation, self.state
            )))
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        if self.state == SystemState::Running {
            if let Err(error) = self.shutdown() {
                warn!("shutdown during drop failed: {}", error);
            }
        }
    }
}

// ======== Tests ========
