//! Capture pipe: mixed-output tap for visualization clients
//!
//! The render path copies each mixed block here when capture is armed; the
//! control thread delivers blocks to the registered listener during poll.
//! The tap must never stall rendering, so a full pipe drops the block and
//! counts it instead of waiting.

use crate::pipe::block::{Block, BlockTag};
use crate::pipe::queue::BlockQueue;
use crate::pipe::{PipeSpec, PortDirection, PortState, PortUser};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Mixed-output tap with wall-clock timestamps
pub struct CapturePipe {
    spec: PipeSpec,

    /// Free blocks
    producer_q: BlockQueue,

    /// Captured blocks awaiting delivery
    consumer_q: BlockQueue,

    allocated: AtomicBool,

    /// Blocks dropped because the pipe was full
    /// Ordering: Relaxed (statistics only)
    dropped: AtomicU64,

    ports: Mutex<PortState>,
}

impl CapturePipe {
    pub fn new(spec: PipeSpec) -> Self {
        let pipe = Self {
            spec,
            producer_q: BlockQueue::with_capacity(spec.block_count),
            consumer_q: BlockQueue::with_capacity(spec.block_count),
            allocated: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
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

    /// Copy one mixed block into the pipe, stamped with the wall clock
    ///
    /// Returns false (and counts a drop) when no free block is available.
    /// Called from the render thread; never waits.
    pub fn write_captured(&self, samples: &[f32], position_ms: u32) -> bool {
        let Some(mut block) = self.producer_q.pop_with_slack(0) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if !block.is_allocated() {
            // Armed flag raced ahead of allocation; put the block back
            let _ = self.producer_q.push(block);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let n = samples.len().min(block.samples().len());
        block.samples_mut()[..n].copy_from_slice(&samples[..n]);
        block.tag = BlockTag::AudioData;
        block.position_ms = position_ms;
        block.timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let _ = self.consumer_q.push(block);
        true
    }

    /// Pop the eldest captured block for delivery (control thread)
    pub fn read_captured(&self) -> Option<Block> {
        self.consumer_q.pop()
    }

    /// Return a delivered block to the free pool
    pub fn return_captured(&self, mut block: Block) {
        block.clear_meta();
        let _ = self.producer_q.push(block);
    }

    /// Captured blocks awaiting delivery
    pub fn pending_len(&self) -> usize {
        self.consumer_q.len()
    }

    /// Lifetime count of dropped blocks
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for mut block in self.consumer_q.drain() {
            block.clear_meta();
            let _ = self.producer_q.push(block);
        }
        self.dropped.store(0, Ordering::Relaxed);
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
            "capture pipe: allocated {} blocks x {} samples",
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
        debug!("capture pipe: buffer released");
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

impl std::fmt::Debug for CapturePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipe")
            .field("spec", &self.spec)
            .field("pending", &self.pending_len())
            .field("dropped", &self.dropped_count())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe() -> CapturePipe {
        let pipe = CapturePipe::new(PipeSpec {
            block_frames: 4,
            channels: 2,
            block_count: 2,
        });
        pipe.allocate_buffer();
        pipe
    }

    #[test]
    fn test_capture_carries_timestamp_and_samples() {
        let pipe = test_pipe();
        let samples = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        assert!(pipe.write_captured(&samples, 250));

        let block = pipe.read_captured().unwrap();
        assert_eq!(block.samples(), &samples);
        assert_eq!(block.position_ms, 250);
        assert!(block.timestamp_ms > 0, "wall clock stamp expected");
        pipe.return_captured(block);
    }

    #[test]
    fn test_full_pipe_drops_instead_of_waiting() {
        let pipe = test_pipe();
        let samples = [0.0f32; 8];
        assert!(pipe.write_captured(&samples, 0));
        assert!(pipe.write_captured(&samples, 10));
        // Pool exhausted: the tap drops
        assert!(!pipe.write_captured(&samples, 20));
        assert_eq!(pipe.dropped_count(), 1);
        assert_eq!(pipe.pending_len(), 2);
    }

    #[test]
    fn test_unallocated_pipe_drops() {
        let pipe = CapturePipe::new(PipeSpec {
            block_frames: 4,
            channels: 2,
            block_count: 2,
        });
        assert!(!pipe.write_captured(&[0.0; 8], 0));
        assert_eq!(pipe.dropped_count(), 1);
        // The free block went back to the pool, not into the consumer queue
        assert_eq!(pipe.pending_len(), 0);
    }

    #[test]
    fn test_reset_clears_pending_and_drop_count() {
        let pipe = test_pipe();
        pipe.write_captured(&[0.0; 8], 0);
        pipe.write_captured(&[0.0; 8], 10);
        pipe.write_captured(&[0.0; 8], 20);
        assert_eq!(pipe.dropped_count(), 1);

        pipe.reset();
        assert_eq!(pipe.pending_len(), 0);
        assert_eq!(pipe.dropped_count(), 0);
        assert!(pipe.write_captured(&[0.0; 8], 30));
    }
}
