//! Audio block and tag types
//!
//! A [`Block`] is the unit of transfer through every pipe: a fixed-capacity
//! chunk of interleaved f32 samples plus metadata. Blocks are pooled by their
//! owning pipe and moved by value between queue roles; sample memory is
//! allocated lazily so an unclaimed pipe costs no buffer memory.

use std::ops::BitOr;

/// Content marker attached to a block by its producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Freshly recycled; carries no content
    None,

    /// Ordinary decoded audio
    AudioData,

    /// Final block of a non-looping source; `position_ms` is the exact end
    EndOfData,

    /// Final block of a source whose owner intends to loop
    EndOfDataWithLoopPoint,
}

impl BlockTag {
    fn bit(self) -> u8 {
        match self {
            BlockTag::None => 0b0001,
            BlockTag::AudioData => 0b0010,
            BlockTag::EndOfData => 0b0100,
            BlockTag::EndOfDataWithLoopPoint => 0b1000,
        }
    }

    /// True for either end-of-data variant
    pub fn is_end_of_data(self) -> bool {
        matches!(self, BlockTag::EndOfData | BlockTag::EndOfDataWithLoopPoint)
    }
}

/// Set of tags a consumer is willing to accept
///
/// `lock_read` with a mask leaves a non-matching head block in place, so a
/// consumer can wait for a specific tag without losing FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagMask(u8);

impl TagMask {
    pub const NONE: TagMask = TagMask(0b0001);
    pub const AUDIO_DATA: TagMask = TagMask(0b0010);
    pub const END_OF_DATA: TagMask = TagMask(0b0100);
    pub const END_OF_DATA_WITH_LOOP_POINT: TagMask = TagMask(0b1000);

    /// Accept any tag
    pub const ANY: TagMask = TagMask(0b1111);

    /// Audio plus both end-of-data variants (the mixer's read mask)
    pub const PLAYABLE: TagMask = TagMask(0b1110);

    pub fn contains(self, tag: BlockTag) -> bool {
        self.0 & tag.bit() != 0
    }
}

impl BitOr for TagMask {
    type Output = TagMask;

    fn bitor(self, rhs: TagMask) -> TagMask {
        TagMask(self.0 | rhs.0)
    }
}

/// One fixed-capacity chunk of interleaved audio samples plus metadata
///
/// Ownership discipline: a block is exclusively held by whichever queue role
/// (producer/consumer/recycler) or in-flight lock currently has it. It is
/// moved by value through the pipe's SPSC rings, never aliased.
#[derive(Debug)]
pub struct Block {
    /// Interleaved samples; empty until the owning pipe allocates its buffer
    samples: Vec<f32>,

    /// Content marker set by the producer at `unlock_write`
    pub tag: BlockTag,

    /// Stream position of the first frame, in ms
    pub position_ms: u32,

    /// Wall-clock capture time in ms since the Unix epoch (capture pipes
    /// only; 0 when unset)
    pub timestamp_ms: u64,
}

impl Block {
    /// Create an unallocated block (no sample memory)
    pub fn unallocated() -> Self {
        Self {
            samples: Vec::new(),
            tag: BlockTag::None,
            position_ms: 0,
            timestamp_ms: 0,
        }
    }

    /// Realize sample memory at `sample_count` zeroed samples
    pub fn allocate(&mut self, sample_count: usize) {
        if self.samples.len() != sample_count {
            self.samples = vec![0.0; sample_count];
        }
    }

    /// Free sample memory, keeping the block pooled
    pub fn release(&mut self) {
        self.samples = Vec::new();
    }

    pub fn is_allocated(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Reset metadata for reuse; sample contents are left as-is (the next
    /// producer overwrites them)
    pub fn clear_meta(&mut self) {
        self.tag = BlockTag::None;
        self.position_ms = 0;
        self.timestamp_ms = 0;
    }

    /// Zero all samples (used for synthetic end-of-data markers)
    pub fn zero_fill(&mut self) {
        self.samples.fill(0.0);
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}
