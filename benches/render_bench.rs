//! Render path throughput
//!
//! Measures one full produce-render cycle per iteration through the real
//! pipe and mixer stack: a recycle poll, one source block written per
//! stream, one sink block pulled through the feed. The real-time budget at
//! 44.1 kHz is 23.2 ms per 1024-frame block; these cycles should sit
//! orders of magnitude under that.

use std::f32::consts::PI;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use mixpipe::mixer::{
    AudioMixer, FadeDuration, MixMode, SinkFeed, SlotOperation, SlotParams, SlotUpdate,
    SourceClientHandle, StopConditions,
};
use mixpipe::pipe::{BlockTag, PipeManager, PortDirection, PortUser, RecycledBlock, SourcePipe};
use mixpipe::EngineConfig;

const BLOCK_FRAMES: usize = 1024;
const PREFILL_BLOCKS: usize = 8;

struct RigSource {
    handle: SourceClientHandle,
    pipe: Arc<SourcePipe>,
    tone: Vec<f32>,
    position_ms: u32,
}

struct Rig {
    mixer: AudioMixer,
    manager: Arc<PipeManager>,
    feed: SinkFeed,
    sources: Vec<RigSource>,
}

impl Rig {
    /// Full mixer stack with `source_count` attached streams, each pipe
    /// pre-filled so the render path never starves.
    fn new(source_count: usize) -> Self {
        let config = EngineConfig::default();
        let manager = Arc::new(PipeManager::new(&config));
        let mut mixer = AudioMixer::new(&config);
        let feed = mixer.initialize(Arc::clone(&manager)).unwrap();
        mixer.start(false).unwrap();

        let mut sources = Vec::with_capacity(source_count);
        for n in 0..source_count {
            let pipe = manager.obtain_source_pipe().unwrap();
            manager.set_source_pipe_port_user(
                &pipe,
                PortDirection::Input,
                PortUser::AudioSource,
                true,
            );
            let handle = mixer.register_source_client(n as u32).unwrap();
            let frequency = 220.0 * (n + 1) as f32;
            let tone: Vec<f32> = (0..BLOCK_FRAMES * 2)
                .map(|i| {
                    let t = (i / 2) as f32 / 44_100.0;
                    0.25 * (2.0 * PI * frequency * t).sin()
                })
                .collect();
            let mut source = RigSource {
                handle,
                pipe,
                tone,
                position_ms: 0,
            };
            for _ in 0..PREFILL_BLOCKS {
                source.write_block();
            }
            sources.push(source);
        }
        Rig {
            mixer,
            manager,
            feed,
            sources,
        }
    }

    fn attach_all(&mut self, mode: MixMode, mix_phase: f32) {
        for source in &self.sources {
            let update = SlotUpdate {
                handle: source.handle,
                operation: SlotOperation::Start,
                params: SlotParams {
                    pipe: Some(Arc::clone(&source.pipe)),
                    mode,
                    duration: FadeDuration::Long,
                    mix_phase: Some(mix_phase),
                    stop_conditions: StopConditions::NONE,
                    ..SlotParams::unity()
                },
            };
            self.mixer
                .attach_or_update_source_pipe(update, None)
                .unwrap();
        }
    }

    fn set_mode(&mut self, index: usize, mode: MixMode, mix_phase: f32) {
        let update = SlotUpdate {
            handle: self.sources[index].handle,
            operation: SlotOperation::None,
            params: SlotParams {
                pipe: None,
                mode,
                duration: FadeDuration::Long,
                mix_phase: Some(mix_phase),
                stop_conditions: StopConditions::NONE,
                ..SlotParams::unity()
            },
        };
        self.mixer
            .attach_or_update_source_pipe(update, None)
            .unwrap();
    }

    /// One steady-state cycle: reclaim spent blocks, top each pipe back up,
    /// pull one block of mixed output.
    fn cycle(&mut self, out: &mut [f32]) {
        self.manager.poll(&mut |_item: RecycledBlock| {});
        for source in &mut self.sources {
            source.write_block();
        }
        self.feed.fill(out);
    }
}

impl RigSource {
    fn write_block(&mut self) {
        if let Some(mut block) = self.pipe.lock_write(0) {
            block.samples_mut().copy_from_slice(&self.tone);
            self.pipe
                .unlock_write(block, BlockTag::AudioData, self.position_ms);
            self.position_ms += (BLOCK_FRAMES as u64 * 1000 / 44_100) as u32;
        }
    }
}

fn bench_single_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_path");
    group.throughput(Throughput::Elements(BLOCK_FRAMES as u64));

    group.bench_function("single_source", |b| {
        let mut rig = Rig::new(1);
        rig.attach_all(MixMode::Add, 1.0);
        let mut out = vec![0.0f32; BLOCK_FRAMES * 2];
        b.iter(|| {
            rig.cycle(&mut out);
            black_box(&out);
        });
    });

    group.finish();
}

fn bench_crossfade_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_path");
    group.throughput(Throughput::Elements(BLOCK_FRAMES as u64));

    group.bench_function("crossfade_pair", |b| {
        let mut rig = Rig::new(2);
        rig.attach_all(MixMode::Add, 1.0);
        rig.set_mode(0, MixMode::FadeOut, 1.0);
        rig.set_mode(1, MixMode::FadeIn, 0.0);
        let mut out = vec![0.0f32; BLOCK_FRAMES * 2];
        let mut n = 0u32;
        b.iter(|| {
            // Restart the ramps before they run out, so every measured
            // block mixes two actively fading streams.
            if n % 16 == 0 {
                rig.set_mode(0, MixMode::FadeOut, 1.0);
                rig.set_mode(1, MixMode::FadeIn, 0.0);
            }
            n += 1;
            rig.cycle(&mut out);
            black_box(&out);
        });
    });

    group.finish();
}

fn bench_eight_sources(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_path");
    group.throughput(Throughput::Elements(BLOCK_FRAMES as u64));

    group.bench_function("eight_sources", |b| {
        let mut rig = Rig::new(8);
        rig.attach_all(MixMode::Add, 1.0);
        let mut out = vec![0.0f32; BLOCK_FRAMES * 2];
        b.iter(|| {
            rig.cycle(&mut out);
            black_box(&out);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_source,
    bench_crossfade_pair,
    bench_eight_sources
);
criterion_main!(benches);
