//! Sink pipe: mixer → sink backend block transport
//!
//! Two-queue variant of the pipe: consumed blocks return straight to the
//! producer queue (no recycler detour, the control thread has nothing to
//! learn from played sink blocks). The sink backend may hold one read block
//! in flight across device callbacks while it drains partial frames.

use crate::pipe::block::{Block, BlockTag};
use crate::pipe::queue::BlockQueue;
use crate::pipe::{PipeSpec, PortDirection, PortState, PortUser};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, error};

/// Block transport between the mixer render path and the device feeder
pub struct SinkPipe {
    spec: PipeSpec,

    /// Free blocks available to fill
    producer_q: BlockQueue,

    /// Mixed blocks awaiting the device
    consumer_q: BlockQueue,

    /// Blocks held by a lock_* caller
    /// Ordering: Relaxed (diagnostics and reset guard)
    in_flight: AtomicUsize,

    allocated: AtomicBool,

    ports: Mutex<PortState>,
}

impl SinkPipe {
    pub fn new(spec: PipeSpec) -> Self {
        let pipe = Self {
            spec,
            producer_q: BlockQueue::with_capacity(spec.block_count),
            consumer_q: BlockQueue::with_capacity(spec.block_count),
            in_flight: AtomicUsize::new(0),
            allocated: AtomicBool::new(false),
            ports: Mutex::new(PortState::default()),
        };
        for _ in 0..spec.block_count {
            let _ = pipe.producer_q.push(Block::unallocated());
        }
        pipe
    }

    pub fn spec(&self) -> PipeSpec {
        self.spec
    }

    /// Pop a free block for the mixer to fill
    pub fn lock_write(&self, min_remains: usize) -> Option<Block> {
        let mut block = self.producer_q.pop_with_slack(min_remains)?;
        block.clear_meta();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Publish a mixed block toward the device
    pub fn unlock_write(&self, mut block: Block, tag: BlockTag, position_ms: u32) {
        block.tag = tag;
        block.position_ms = position_ms;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(_lost) = self.consumer_q.push(block) {
            error!("sink pipe: consumer queue overflow, block lost");
        }
    }

    /// Pop the eldest mixed block (device feeder)
    pub fn lock_read(&self) -> Option<Block> {
        let block = self.consumer_q.pop()?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Return a played block to the free pool
    pub fn unlock_read(&self, mut block: Block) {
        block.clear_meta();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(_lost) = self.producer_q.push(block) {
            error!("sink pipe: producer queue overflow, block lost");
        }
    }

    /// Mixed blocks waiting for the device
    pub fn filled_len(&self) -> usize {
        self.consumer_q.len()
    }

    /// Free blocks available to the mixer
    pub fn free_len(&self) -> usize {
        self.producer_q.len()
    }

    /// Gather every block back to the producer queue
    ///
    /// Must only run while no producer or consumer holds a block.
    pub fn reset(&self) {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        if in_flight != 0 {
            error!("sink pipe: reset with {} blocks in flight", in_flight);
        }
        for mut block in self.consumer_q.drain() {
            block.clear_meta();
            let _ = self.producer_q.push(block);
        }
    }

    pub fn allocate_buffer(&self) {
        if self.allocated.swap(true, Ordering::Relaxed) {
            return;
        }
        let samples = self.spec.samples_per_block();
        for mut block in self.producer_q.drain() {
            block.allocate(samples);
            let _ = self.producer_q.push(block);
        }
        debug!(
            "sink pipe: allocated {} blocks x {} samples",
            self.spec.block_count, samples
        );
    }

    pub fn release_buffer(&self) {
        if !self.allocated.swap(false, Ordering::Relaxed) {
            return;
        }
        for mut block in self.producer_q.drain() {
            block.release();
            let _ = self.producer_q.push(block);
        }
        debug!("sink pipe: buffer released");
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn set_port_user(
        &self,
        direction: PortDirection,
        user: PortUser,
        set: bool,
    ) -> crate::pipe::ClaimTransition {
        self.ports.lock().unwrap().set(direction, user, set)
    }

    pub fn is_unclaimed(&self) -> bool {
        self.ports.lock().unwrap().is_unclaimed()
    }
}

impl std::fmt::Debug for SinkPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkPipe")
            .field("spec", &self.spec)
            .field("filled", &self.filled_len())
            .field("free", &self.free_len())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe() -> SinkPipe {
        let pipe = SinkPipe::new(PipeSpec {
            block_frames: 8,
            channels: 2,
            block_count: 3,
        });
        pipe.allocate_buffer();
        pipe
    }

    #[test]
    fn test_write_read_cycle() {
        let pipe = test_pipe();

        let mut block = pipe.lock_write(0).unwrap();
        block.samples_mut()[0] = 0.25;
        pipe.unlock_write(block, BlockTag::AudioData, 40);
        assert_eq!(pipe.filled_len(), 1);

        let block = pipe.lock_read().unwrap();
        assert_eq!(block.position_ms, 40);
        assert_eq!(block.samples()[0], 0.25);
        pipe.unlock_read(block);
        assert_eq!(pipe.free_len(), 3);
    }

    #[test]
    fn test_read_returns_block_with_cleared_meta() {
        let pipe = test_pipe();
        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::AudioData, 123);
        let block = pipe.lock_read().unwrap();
        pipe.unlock_read(block);

        let block = pipe.lock_write(0).unwrap();
        assert_eq!(block.tag, BlockTag::None);
        assert_eq!(block.position_ms, 0);
        pipe.unlock_write(block, BlockTag::AudioData, 0);
    }

    #[test]
    fn test_empty_read() {
        let pipe = test_pipe();
        assert!(pipe.lock_read().is_none());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let pipe = test_pipe();
        let b1 = pipe.lock_write(0).unwrap();
        let b2 = pipe.lock_write(0).unwrap();
        let b3 = pipe.lock_write(0).unwrap();
        assert!(pipe.lock_write(0).is_none());

        pipe.unlock_write(b1, BlockTag::AudioData, 0);
        pipe.unlock_write(b2, BlockTag::AudioData, 0);
        pipe.unlock_write(b3, BlockTag::AudioData, 0);
        assert_eq!(pipe.filled_len(), 3);
    }
}
