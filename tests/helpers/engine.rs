//! Engine harness with a pull-driven sink
//!
//! The harness replaces the device backend with a sink that stores the
//! render feed; tests pull output blocks themselves, so every rendered
//! sample is observable and timing is under test control.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use mixpipe::backend::{DataSource, SinkBackend, SinkConfig, SymphoniaDecoderFactory};
use mixpipe::error::Result;
use mixpipe::mixer::SinkFeed;
use mixpipe::{AudioSystem, EngineConfig, PlayerEvent};

pub const BLOCK_FRAMES: usize = 1024;

/// Sink backend that hands the render feed to the test instead of a device
struct PullSink {
    feed: Arc<Mutex<Option<SinkFeed>>>,
}

impl SinkBackend for PullSink {
    fn initialize(&mut self, _config: &SinkConfig, feed: SinkFeed) -> Result<()> {
        *self.feed.lock().unwrap() = Some(feed);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn latency_frames(&self) -> usize {
        0
    }

    fn set_volume(&mut self, _volume: f32) {}
}

pub struct EngineHarness {
    pub system: AudioSystem,
    feed: SinkFeed,
    events: Arc<Mutex<Vec<(Uuid, PlayerEvent)>>>,
}

impl EngineHarness {
    pub fn new() -> Self {
        let config = EngineConfig {
            poll_interval_ms: 1,
            producer_retry_wait_ms: 1,
            ..EngineConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let feed_slot = Arc::new(Mutex::new(None));
        let sink = Box::new(PullSink {
            feed: Arc::clone(&feed_slot),
        });
        let factory = Arc::new(SymphoniaDecoderFactory::new());
        let mut system = AudioSystem::new(config, sink, factory).unwrap();
        system.initialize().unwrap();
        let feed = feed_slot.lock().unwrap().take().unwrap();
        Self {
            system,
            feed,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a player bound to `path`, synchronously prepared, with its
    /// events accumulating in the shared log.
    pub fn prepare_file(&mut self, path: &Path) -> Uuid {
        let id = self.system.create_player().unwrap();
        self.system
            .set_data_source(id, DataSource::Path(path.to_path_buf()))
            .unwrap();
        let log = Arc::clone(&self.events);
        self.system
            .set_event_listener(
                id,
                Some(Box::new(move |event| {
                    log.lock().unwrap().push((id, event));
                })),
            )
            .unwrap();
        self.system.prepare(id).unwrap();
        id
    }

    /// Give the decoder threads time to fill their pipes; the fixtures are
    /// small enough to buffer entirely.
    pub fn settle(&mut self, duration_ms: u64) {
        for _ in 0..duration_ms.div_ceil(10) {
            self.system.poll();
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Render `count` blocks, returning each as an owned stereo buffer.
    pub fn render_blocks(&mut self, count: usize) -> Vec<Vec<f32>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            self.system.poll();
            let mut out = vec![0.0f32; BLOCK_FRAMES * 2];
            self.feed.fill(&mut out);
            blocks.push(out);
        }
        blocks
    }

    /// Render until `id` reports completion, returning every block pulled
    /// along the way. Panics when the cap is reached first.
    pub fn render_until_completion(&mut self, id: Uuid, max_blocks: usize) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        for _ in 0..max_blocks {
            self.system.poll();
            if self.completed(id) {
                return blocks;
            }
            let mut out = vec![0.0f32; BLOCK_FRAMES * 2];
            self.feed.fill(&mut out);
            blocks.push(out);
        }
        panic!("player {} never completed within {} blocks", id, max_blocks);
    }

    /// Poll (without rendering) until the player's event log satisfies the
    /// predicate. Returns false when the cap is reached first.
    pub fn wait_for_event<F>(&mut self, id: Uuid, predicate: F, max_polls: usize) -> bool
    where
        F: Fn(&[PlayerEvent]) -> bool,
    {
        for _ in 0..max_polls {
            self.system.poll();
            if predicate(&self.events_for(id)) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    pub fn events_for(&self, id: Uuid) -> Vec<PlayerEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| *owner == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn completed(&self, id: Uuid) -> bool {
        self.events_for(id).contains(&PlayerEvent::Completion)
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

pub fn is_silent(samples: &[f32]) -> bool {
    samples.iter().all(|s| s.abs() < 1e-4)
}

/// Number of blocks through the last audible one
pub fn audible_span(blocks: &[Vec<f32>]) -> usize {
    blocks
        .iter()
        .rposition(|block| !is_silent(block))
        .map_or(0, |index| index + 1)
}
