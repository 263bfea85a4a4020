//! SPSC block queue
//!
//! One [`BlockQueue`] is one direction of flow inside a pipe (producer,
//! consumer, or recycler). Blocks are moved by value through a lock-free ring;
//! the producer and consumer endpoints are individually mutex-wrapped only to
//! serialize same-role callers. The two mutexes are never shared across
//! roles, so pushing and popping never contend with each other.
//!
//! ## Thread Safety
//!
//! - `prod` mutex: held only by the role that pushes into this queue
//! - `cons` mutex: held only by the role that pops from this queue
//! - `len`: atomic mirror of the occupied count for slack checks
//!
//! ## Memory Ordering
//!
//! - `len`: Relaxed. It gates advisory slack checks (`min_remains`); the ring
//!   itself is the synchronization point for block contents.

use crate::pipe::block::{Block, BlockTag};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One direction of block flow inside a pipe
pub(crate) struct BlockQueue {
    /// Ring producer endpoint; `try_push` requires `&mut self`
    prod: Mutex<HeapProd<Block>>,

    /// Ring consumer endpoint; `try_pop`/`try_peek` require `&mut self`
    cons: Mutex<HeapCons<Block>>,

    /// Occupied count mirror
    /// Ordering: Relaxed (advisory slack checks only)
    len: AtomicUsize,
}

impl BlockQueue {
    /// Create a queue able to hold `capacity` blocks
    pub fn with_capacity(capacity: usize) -> Self {
        let rb = HeapRb::<Block>::new(capacity);
        let (prod, cons) = rb.split();
        Self {
            prod: Mutex::new(prod),
            cons: Mutex::new(cons),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a block; on a full ring the block is handed back unchanged
    ///
    /// A full ring indicates a conservation bug in the caller (every queue is
    /// sized to the pipe's whole block pool), so callers treat `Err` as fatal
    /// bookkeeping corruption rather than backpressure.
    pub fn push(&self, block: Block) -> Result<(), Block> {
        let mut prod = self.prod.lock().unwrap();
        match prod.try_push(block) {
            Ok(()) => {
                drop(prod);
                self.len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(block) => Err(block),
        }
    }

    /// Pop the eldest block, if any
    pub fn pop(&self) -> Option<Block> {
        let mut cons = self.cons.lock().unwrap();
        let block = cons.try_pop();
        drop(cons);
        if block.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        block
    }

    /// Pop the eldest block only if at least `min_remains + 1` blocks are
    /// occupied and the head's tag satisfies `accept`
    ///
    /// Peek semantics: a non-matching head stays in place, preserving FIFO
    /// order for a consumer waiting on a specific tag. The slack check runs
    /// under the cons lock, where the only concurrent mutation is a push,
    /// which can only increase the occupied count.
    pub fn pop_matching(
        &self,
        min_remains: usize,
        accept: impl FnOnce(BlockTag) -> bool,
    ) -> Option<Block> {
        let mut cons = self.cons.lock().unwrap();
        if cons.occupied_len() < min_remains + 1 {
            return None;
        }
        let matched = match cons.try_peek() {
            Some(head) => accept(head.tag),
            None => false,
        };
        let block = if matched { cons.try_pop() } else { None };
        drop(cons);
        if block.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        block
    }

    /// Pop the eldest block only if its tag satisfies `accept`
    pub fn pop_if_tag(&self, accept: impl FnOnce(BlockTag) -> bool) -> Option<Block> {
        self.pop_matching(0, accept)
    }

    /// Pop only while more than `min_remains` blocks stay behind
    pub fn pop_with_slack(&self, min_remains: usize) -> Option<Block> {
        self.pop_matching(min_remains, |_| true)
    }

    /// Occupied count snapshot
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every block out (pipe reset path; caller re-seeds elsewhere)
    pub fn drain(&self) -> Vec<Block> {
        let mut cons = self.cons.lock().unwrap();
        let mut drained = Vec::new();
        while let Some(block) = cons.try_pop() {
            drained.push(block);
        }
        drop(cons);
        self.len.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_block(position_ms: u32) -> Block {
        let mut b = Block::unallocated();
        b.tag = BlockTag::AudioData;
        b.position_ms = position_ms;
        b
    }

    #[test]
    fn test_fifo_order() {
        let q = BlockQueue::with_capacity(4);
        q.push(audio_block(0)).unwrap();
        q.push(audio_block(10)).unwrap();
        q.push(audio_block(20)).unwrap();

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().position_ms, 0);
        assert_eq!(q.pop().unwrap().position_ms, 10);
        assert_eq!(q.pop().unwrap().position_ms, 20);
        assert!(q.pop().is_none());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_push_full_returns_block() {
        let q = BlockQueue::with_capacity(2);
        q.push(audio_block(0)).unwrap();
        q.push(audio_block(10)).unwrap();

        let rejected = q.push(audio_block(20)).unwrap_err();
        assert_eq!(rejected.position_ms, 20);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_pop_if_tag_leaves_nonmatching_head() {
        let q = BlockQueue::with_capacity(4);
        let mut eod = Block::unallocated();
        eod.tag = BlockTag::EndOfData;
        eod.position_ms = 99;
        q.push(eod).unwrap();
        q.push(audio_block(100)).unwrap();

        // Head is EndOfData; an audio-only consumer must not disturb it
        assert!(q.pop_if_tag(|t| t == BlockTag::AudioData).is_none());
        assert_eq!(q.len(), 2);

        // Accepting end-of-data pops the head, exposing the audio block
        let popped = q.pop_if_tag(BlockTag::is_end_of_data).unwrap();
        assert_eq!(popped.position_ms, 99);
        let popped = q.pop_if_tag(|t| t == BlockTag::AudioData).unwrap();
        assert_eq!(popped.position_ms, 100);
    }

    #[test]
    fn test_pop_with_slack() {
        let q = BlockQueue::with_capacity(4);
        q.push(audio_block(0)).unwrap();
        q.push(audio_block(10)).unwrap();

        // min_remains=2 requires 3 occupied
        assert!(q.pop_with_slack(2).is_none());
        // min_remains=1 requires 2 occupied
        assert_eq!(q.pop_with_slack(1).unwrap().position_ms, 0);
        // One left; min_remains=1 fails again
        assert!(q.pop_with_slack(1).is_none());
        assert_eq!(q.pop_with_slack(0).unwrap().position_ms, 10);
    }

    #[test]
    fn test_drain() {
        let q = BlockQueue::with_capacity(4);
        for i in 0..4 {
            q.push(audio_block(i * 10)).unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_cross_thread_handoff() {
        use std::sync::Arc;

        let q = Arc::new(BlockQueue::with_capacity(64));
        let producer = Arc::clone(&q);

        let handle = std::thread::spawn(move || {
            for i in 0..1000u32 {
                let mut block = audio_block(i);
                loop {
                    match producer.push(block) {
                        Ok(()) => break,
                        Err(b) => {
                            block = b;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut seen = 0u32;
        while seen < 1000 {
            if let Some(block) = q.pop() {
                assert_eq!(block.position_ms, seen, "FIFO order violated");
                seen += 1;
            } else {
                std::thread::yield_now();
            }
        }
        handle.join().unwrap();
        assert!(q.is_empty());
    }
}
