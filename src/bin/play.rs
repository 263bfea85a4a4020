//! Command-line gapless player
//!
//! Plays a list of audio files back to back through the engine, preparing
//! each file while its predecessor is still audible so the transitions are
//! seamless. Two players leapfrog through the list, so playlists of any
//! length need only two mixer slots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use mixpipe::backend::{CpalSink, DataSource, SymphoniaDecoderFactory};
use mixpipe::{AudioSystem, EngineConfig, PlayerEvent, PollSchedule};

/// Command-line arguments for mixpipe-play
#[derive(Parser, Debug)]
#[command(name = "mixpipe-play")]
#[command(about = "Gapless audio file player built on the mixpipe engine")]
#[command(version)]
struct Args {
    /// Audio files to play in order
    #[arg(required_unless_present = "list_devices")]
    files: Vec<PathBuf>,

    /// Engine configuration TOML; built-in defaults when omitted
    #[arg(short, long, env = "MIXPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Output device name; the system default when omitted
    #[arg(short, long, env = "MIXPIPE_DEVICE")]
    device: Option<String>,

    /// Device buffer size in frames
    #[arg(long)]
    buffer_frames: Option<u32>,

    /// Playback volume, 0.0 to 1.0
    #[arg(short, long, default_value = "1.0")]
    volume: f32,

    /// Loop the final file seamlessly instead of exiting
    #[arg(long)]
    looping: bool,

    /// List available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mixpipe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in CpalSink::list_devices().context("enumerating output devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let sink = Box::new(CpalSink::new(args.device.clone(), args.buffer_frames));
    let factory = Arc::new(SymphoniaDecoderFactory::new());
    let mut system = AudioSystem::new(config, sink, factory).context("building the engine")?;
    system.initialize().context("starting the audio device")?;
    system.set_master_volume(args.volume)?;

    let mut playlist = Playlist::new(system, args.files, args.looping);
    playlist.begin()?;
    playlist.run()
}

/// Rolling two-player window over the file list
struct Playlist {
    system: AudioSystem,
    files: Vec<PathBuf>,
    loop_last: bool,
    event_tx: mpsc::Sender<(Uuid, PlayerEvent)>,
    event_rx: mpsc::Receiver<(Uuid, PlayerEvent)>,
    names: HashMap<Uuid, PathBuf>,
    current: Uuid,
    next: Option<Uuid>,
    next_index: usize,
}

impl Playlist {
    fn new(system: AudioSystem, files: Vec<PathBuf>, loop_last: bool) -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        Self {
            system,
            files,
            loop_last,
            event_tx,
            event_rx,
            names: HashMap::new(),
            current: Uuid::nil(),
            next: None,
            next_index: 0,
        }
    }

    /// Prepare the first file (and its successor, if any) and start playing.
    fn begin(&mut self) -> Result<()> {
        self.current = self.spawn(0)?;
        self.next_index = 1;
        self.next = self.spawn_next()?;
        self.system.start(self.current)?;
        info!("playing {}", self.files[0].display());
        Ok(())
    }

    /// Drive the engine until the last file finishes.
    fn run(&mut self) -> Result<()> {
        loop {
            self.system.poll();
            let pending: Vec<_> = self.event_rx.try_iter().collect();
            for (id, event) in pending {
                match event {
                    PlayerEvent::Completion if id == self.current => {
                        if !self.advance()? {
                            self.system.shutdown()?;
                            info!("playlist complete");
                            return Ok(());
                        }
                    }
                    PlayerEvent::Error { message, .. } => {
                        bail!("{}: {}", self.name(id), message);
                    }
                    _ => {}
                }
            }
            match self.system.determine_next_polling_time() {
                PollSchedule::Immediate => {}
                PollSchedule::After(wait) => thread::sleep(wait),
                PollSchedule::Idle => thread::sleep(self.system.config().poll_interval()),
            }
        }
    }

    /// Shift the window forward after a completion. Returns false once the
    /// final file has finished.
    fn advance(&mut self) -> Result<bool> {
        info!("finished {}", self.name(self.current));
        let finished = self.current;
        let Some(next) = self.next else {
            return Ok(false);
        };
        self.system.release_player(finished)?;
        self.names.remove(&finished);
        self.current = next;
        self.next_index += 1;
        self.next = self.spawn_next()?;
        info!("playing {}", self.name(self.current));
        Ok(true)
    }

    /// Create and prepare the player for `files[next_index]`, chained after
    /// the current one. Preparation runs while the current file plays.
    fn spawn_next(&mut self) -> Result<Option<Uuid>> {
        if self.next_index >= self.files.len() {
            if self.loop_last {
                self.system.set_looping(self.current, true)?;
            }
            return Ok(None);
        }
        let id = self.spawn(self.next_index)?;
        self.system.set_next_player(self.current, Some(id))?;
        Ok(Some(id))
    }

    fn spawn(&mut self, index: usize) -> Result<Uuid> {
        let path = self.files[index].clone();
        let id = self.system.create_player()?;
        self.names.insert(id, path.clone());
        self.system
            .set_data_source(id, DataSource::Path(path.clone()))?;
        let tx = self.event_tx.clone();
        self.system.set_event_listener(
            id,
            Some(Box::new(move |event| {
                let _ = tx.send((id, event));
            })),
        )?;
        self.system
            .prepare(id)
            .with_context(|| format!("preparing {}", path.display()))?;
        if let Some(duration) = self.system.duration_ms(id)? {
            info!("prepared {} ({} ms)", path.display(), duration);
        }
        Ok(id)
    }

    fn name(&self, id: Uuid) -> String {
        self.names
            .get(&id)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| id.to_string())
    }
}
