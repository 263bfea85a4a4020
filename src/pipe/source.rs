//! Source pipe: decoder → mixer block transport
//!
//! A [`SourcePipe`] circulates a fixed pool of blocks through three queues:
//!
//! ```text
//!            lock_write / unlock_write          lock_read / unlock_read
//!  producer queue ──────────────────▶ consumer queue ──────────────────▶ recycler queue
//!        ▲        (decode thread)                      (render thread)         │
//!        │                                                                     │
//!        └──────────────────── lock_recycle / unlock_recycle ◀─────────────────┘
//!                                   (control thread)
//! ```
//!
//! The recycler detour exists so the control thread can observe the metadata
//! of consumed blocks (the position the mixer actually played) before they
//! re-enter the free pool. Conservation invariant: every block is in exactly
//! one of {producer queue, consumer queue, recycler queue, a single in-flight
//! lock} at all times.

use crate::pipe::block::{Block, BlockTag, TagMask};
use crate::pipe::queue::BlockQueue;
use crate::pipe::{PipeSpec, PortDirection, PortState, PortUser};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, error};

/// Snapshot of block distribution for diagnostics and invariant checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePipeStats {
    pub producer: usize,
    pub consumer: usize,
    pub recycler: usize,
    pub in_flight: usize,
}

impl SourcePipeStats {
    /// Total blocks accounted for; equals the pipe capacity when the
    /// conservation invariant holds
    pub fn total(&self) -> usize {
        self.producer + self.consumer + self.recycler + self.in_flight
    }
}

/// Lock-free block transport from one decode thread to the render thread
pub struct SourcePipe {
    /// Pool slot index; identifies this pipe in recycle notifications
    index: usize,

    spec: PipeSpec,

    /// Free blocks available to fill
    producer_q: BlockQueue,

    /// Filled blocks awaiting the mixer
    consumer_q: BlockQueue,

    /// Consumed blocks awaiting control-thread return
    recycler_q: BlockQueue,

    /// Blocks currently held by a lock_* caller
    /// Ordering: Relaxed (diagnostics and reset guard)
    in_flight: AtomicUsize,

    /// Backing sample memory realized
    allocated: AtomicBool,

    /// Port claims; guarded because claim transitions happen only on the
    /// control thread but are read from Debug/diagnostics
    ports: Mutex<PortState>,
}

impl SourcePipe {
    /// Create an unallocated pipe with its whole block pool parked in the
    /// producer queue
    pub fn new(index: usize, spec: PipeSpec) -> Self {
        let pipe = Self {
            index,
            spec,
            producer_q: BlockQueue::with_capacity(spec.block_count),
            consumer_q: BlockQueue::with_capacity(spec.block_count),
            recycler_q: BlockQueue::with_capacity(spec.block_count),
            in_flight: AtomicUsize::new(0),
            allocated: AtomicBool::new(false),
            ports: Mutex::new(PortState::default()),
        };
        for _ in 0..spec.block_count {
            // Cannot fail: the queue is sized for the whole pool
            let _ = pipe.producer_q.push(Block::unallocated());
        }
        pipe
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> PipeSpec {
        self.spec
    }

    /// Pop a free block for filling
    ///
    /// Succeeds only while at least `min_remains + 1` free blocks exist.
    /// The returned block's metadata is reset; its samples are stale.
    pub fn lock_write(&self, min_remains: usize) -> Option<Block> {
        let mut block = self.producer_q.pop_with_slack(min_remains)?;
        block.clear_meta();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Publish a filled block to the consumer queue
    pub fn unlock_write(&self, mut block: Block, tag: BlockTag, position_ms: u32) {
        block.tag = tag;
        block.position_ms = position_ms;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(_lost) = self.consumer_q.push(block) {
            // Sized for the whole pool; reaching here means double-ownership
            error!("source pipe {}: consumer queue overflow, block lost", self.index);
        }
    }

    /// Pop the eldest filled block whose tag is in `tag_mask`
    ///
    /// A non-matching head stays in place (peek semantics) so a consumer can
    /// wait for a specific tag without reordering.
    pub fn lock_read(&self, min_remains: usize, tag_mask: TagMask) -> Option<Block> {
        let block = self
            .consumer_q
            .pop_matching(min_remains, |tag| tag_mask.contains(tag))?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Hand a consumed block to the recycler, metadata intact
    pub fn unlock_read(&self, block: Block) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(_lost) = self.recycler_q.push(block) {
            error!("source pipe {}: recycler queue overflow, block lost", self.index);
        }
    }

    /// Pop a recycled block to observe its final metadata (control thread)
    pub fn lock_recycle(&self) -> Option<Block> {
        let block = self.recycler_q.pop()?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Return a recycled block to the free pool with metadata cleared
    pub fn unlock_recycle(&self, mut block: Block) {
        block.clear_meta();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(_lost) = self.producer_q.push(block) {
            error!("source pipe {}: producer queue overflow, block lost", self.index);
        }
    }

    /// Number of blocks waiting in the consumer queue
    pub fn filled_len(&self) -> usize {
        self.consumer_q.len()
    }

    /// Number of blocks waiting in the recycler queue
    pub fn recycler_len(&self) -> usize {
        self.recycler_q.len()
    }

    /// Number of free blocks
    pub fn free_len(&self) -> usize {
        self.producer_q.len()
    }

    pub fn stats(&self) -> SourcePipeStats {
        SourcePipeStats {
            producer: self.producer_q.len(),
            consumer: self.consumer_q.len(),
            recycler: self.recycler_q.len(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Gather every block back into the producer queue with cleared metadata
    ///
    /// Must only be called while no producer or consumer is active
    /// (`in_flight == 0`); used on pipe reuse.
    pub fn reset(&self) {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        if in_flight != 0 {
            error!(
                "source pipe {}: reset with {} blocks in flight",
                self.index, in_flight
            );
        }
        for mut block in self.consumer_q.drain() {
            block.clear_meta();
            let _ = self.producer_q.push(block);
        }
        for mut block in self.recycler_q.drain() {
            block.clear_meta();
            let _ = self.producer_q.push(block);
        }
        debug!("source pipe {}: reset, {} free blocks", self.index, self.free_len());
    }

    /// Realize backing sample memory for every pooled block
    ///
    /// The pipe must be quiescent (all blocks parked in the producer queue);
    /// call [`reset`](Self::reset) first when reusing.
    pub fn allocate_buffer(&self) {
        if self.allocated.swap(true, Ordering::Relaxed) {
            return;
        }
        let samples = self.spec.samples_per_block();
        let blocks = self.producer_q.drain();
        for mut block in blocks {
            block.allocate(samples);
            let _ = self.producer_q.push(block);
        }
        debug!(
            "source pipe {}: allocated {} blocks x {} samples",
            self.index,
            self.spec.block_count,
            samples
        );
    }

    /// Free backing sample memory; queue topology is preserved
    pub fn release_buffer(&self) {
        if !self.allocated.swap(false, Ordering::Relaxed) {
            return;
        }
        let blocks = self.producer_q.drain();
        for mut block in blocks {
            block.release();
            let _ = self.producer_q.push(block);
        }
        debug!("source pipe {}: buffer released", self.index);
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Add or remove a port claim; returns the transition observed
    pub fn set_port_user(
        &self,
        direction: PortDirection,
        user: PortUser,
        set: bool,
    ) -> crate::pipe::ClaimTransition {
        self.ports.lock().unwrap().set(direction, user, set)
    }

    /// True while no port in either direction is claimed
    pub fn is_unclaimed(&self) -> bool {
        self.ports.lock().unwrap().is_unclaimed()
    }
}

impl std::fmt::Debug for SourcePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePipe")
            .field("index", &self.index)
            .field("spec", &self.spec)
            .field("stats", &self.stats())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe(block_count: usize) -> SourcePipe {
        let pipe = SourcePipe::new(
            0,
            PipeSpec {
                block_frames: 8,
                channels: 2,
                block_count,
            },
        );
        pipe.allocate_buffer();
        pipe
    }

    #[test]
    fn test_full_circulation() {
        let pipe = test_pipe(4);

        // Produce
        let mut block = pipe.lock_write(0).unwrap();
        block.samples_mut()[0] = 0.5;
        pipe.unlock_write(block, BlockTag::AudioData, 100);
        assert_eq!(pipe.filled_len(), 1);

        // Consume
        let block = pipe.lock_read(0, TagMask::ANY).unwrap();
        assert_eq!(block.tag, BlockTag::AudioData);
        assert_eq!(block.position_ms, 100);
        assert_eq!(block.samples()[0], 0.5);
        pipe.unlock_read(block);
        assert_eq!(pipe.recycler_len(), 1);

        // Recycle
        let block = pipe.lock_recycle().unwrap();
        assert_eq!(block.position_ms, 100, "recycler preserves final metadata");
        pipe.unlock_recycle(block);
        assert_eq!(pipe.free_len(), 4);
    }

    #[test]
    fn test_conservation_through_circulation() {
        let pipe = test_pipe(4);
        assert_eq!(pipe.stats().total(), 4);

        let b1 = pipe.lock_write(0).unwrap();
        assert_eq!(pipe.stats().total(), 4);
        assert_eq!(pipe.stats().in_flight, 1);

        pipe.unlock_write(b1, BlockTag::AudioData, 0);
        let b2 = pipe.lock_write(0).unwrap();
        let b3 = pipe.lock_read(0, TagMask::ANY).unwrap();
        assert_eq!(pipe.stats().total(), 4);
        assert_eq!(pipe.stats().in_flight, 2);

        pipe.unlock_write(b2, BlockTag::AudioData, 10);
        pipe.unlock_read(b3);
        assert_eq!(pipe.stats().total(), 4);
        assert_eq!(pipe.stats().in_flight, 0);
    }

    #[test]
    fn test_lock_write_slack() {
        let pipe = test_pipe(3);

        // min_remains=2 leaves 2 behind: only 1 grab possible
        assert!(pipe.lock_write(2).is_some());
        assert!(pipe.lock_write(2).is_none());
        assert!(pipe.lock_write(0).is_some());
    }

    #[test]
    fn test_lock_read_tag_mask_peek() {
        let pipe = test_pipe(3);

        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::EndOfData, 500);

        // Audio-only mask must leave the end-of-data head in place
        assert!(pipe.lock_read(0, TagMask::AUDIO_DATA).is_none());
        assert_eq!(pipe.filled_len(), 1);

        let block = pipe
            .lock_read(0, TagMask::END_OF_DATA | TagMask::END_OF_DATA_WITH_LOOP_POINT)
            .unwrap();
        assert_eq!(block.tag, BlockTag::EndOfData);
        pipe.unlock_read(block);
    }

    #[test]
    fn test_exhausted_producer_queue() {
        let pipe = test_pipe(2);
        let _b1 = pipe.lock_write(0).unwrap();
        let _b2 = pipe.lock_write(0).unwrap();
        assert!(pipe.lock_write(0).is_none());
    }

    #[test]
    fn test_reset_gathers_all_blocks() {
        let pipe = test_pipe(3);

        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::AudioData, 0);
        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::AudioData, 10);
        let block = pipe.lock_read(0, TagMask::ANY).unwrap();
        pipe.unlock_read(block);

        // One in consumer, one in recycler, one free
        assert_eq!(pipe.filled_len(), 1);
        assert_eq!(pipe.recycler_len(), 1);
        assert_eq!(pipe.free_len(), 1);

        pipe.reset();
        assert_eq!(pipe.free_len(), 3);
        assert_eq!(pipe.filled_len(), 0);
        assert_eq!(pipe.recycler_len(), 0);
        assert_eq!(pipe.stats().total(), 3);
    }

    #[test]
    fn test_lazy_allocation() {
        let pipe = SourcePipe::new(
            1,
            PipeSpec {
                block_frames: 16,
                channels: 2,
                block_count: 2,
            },
        );
        assert!(!pipe.is_allocated());

        // Blocks circulate even unallocated, but carry no sample memory
        let block = pipe.lock_write(0).unwrap();
        assert!(!block.is_allocated());
        pipe.unlock_write(block, BlockTag::AudioData, 0);
        let block = pipe.lock_read(0, TagMask::ANY).unwrap();
        pipe.unlock_read(block);
        let block = pipe.lock_recycle().unwrap();
        pipe.unlock_recycle(block);

        pipe.allocate_buffer();
        assert!(pipe.is_allocated());
        let block = pipe.lock_write(0).unwrap();
        assert_eq!(block.samples().len(), 32);
        pipe.unlock_write(block, BlockTag::AudioData, 0);

        // Release requires quiescence: gather first
        pipe.reset();
        pipe.release_buffer();
        assert!(!pipe.is_allocated());
        let block = pipe.lock_write(0).unwrap();
        assert!(!block.is_allocated());
    }

    #[test]
    fn test_unlock_write_metadata() {
        let pipe = test_pipe(2);
        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::EndOfDataWithLoopPoint, 3750);

        let block = pipe.lock_read(0, TagMask::ANY).unwrap();
        assert_eq!(block.tag, BlockTag::EndOfDataWithLoopPoint);
        assert_eq!(block.position_ms, 3750);
        pipe.unlock_read(block);
    }

    #[test]
    fn test_recycle_clears_metadata() {
        let pipe = test_pipe(2);
        let block = pipe.lock_write(0).unwrap();
        pipe.unlock_write(block, BlockTag::EndOfData, 999);
        let block = pipe.lock_read(0, TagMask::ANY).unwrap();
        pipe.unlock_read(block);
        let block = pipe.lock_recycle().unwrap();
        pipe.unlock_recycle(block);

        // Back at the producer: metadata must be gone
        let block = pipe.lock_write(0).unwrap();
        assert_eq!(block.tag, BlockTag::None);
        assert_eq!(block.position_ms, 0);
        pipe.unlock_write(block, BlockTag::AudioData, 0);
    }
}
