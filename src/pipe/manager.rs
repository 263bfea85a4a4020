//! Pipe pools and port-claim lifecycle
//!
//! The manager owns fixed pools (source pipes, one sink pipe, one capture
//! pipe) sized at initialization. Pipes are never created or destroyed after
//! that; claims on their ports decide when backing sample memory exists.
//! A pipe whose last claim is released is reset and its buffer freed, making
//! it eligible for the next [`obtain_source_pipe`](PipeManager::obtain_source_pipe).

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pipe::block::BlockTag;
use crate::pipe::capture::CapturePipe;
use crate::pipe::sink::SinkPipe;
use crate::pipe::source::SourcePipe;
use crate::pipe::{ClaimTransition, PipeSpec, PortDirection, PortUser};
use std::sync::Arc;
use tracing::debug;

/// Metadata of one recycled block, forwarded during poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycledBlock {
    /// Pool index of the source pipe the block came from
    pub pipe_index: usize,
    pub tag: BlockTag,
    pub position_ms: u32,
}

/// Receiver for recycled-block metadata
///
/// The owning AudioSource learns its consumed position (and sees its own
/// end-of-data marker come back) through this.
pub trait RecycleListener {
    fn on_recycle_item(&mut self, item: RecycledBlock);
}

impl<F: FnMut(RecycledBlock)> RecycleListener for F {
    fn on_recycle_item(&mut self, item: RecycledBlock) {
        self(item)
    }
}

/// Fixed pools of pipes plus port-claim bookkeeping
pub struct PipeManager {
    source_pipes: Vec<Arc<SourcePipe>>,
    sink_pipe: Arc<SinkPipe>,
    capture_pipe: Arc<CapturePipe>,
}

impl PipeManager {
    /// Build the pools from the engine geometry
    pub fn new(config: &EngineConfig) -> Self {
        let source_spec = PipeSpec {
            block_frames: config.block_frames,
            channels: 2,
            block_count: config.source_pipe_blocks,
        };
        let sink_spec = PipeSpec {
            block_frames: config.block_frames,
            channels: 2,
            block_count: config.sink_pipe_blocks,
        };
        let capture_spec = PipeSpec {
            block_frames: config.block_frames,
            channels: 2,
            block_count: config.capture_pipe_blocks,
        };

        let source_pipes = (0..config.source_pipe_count)
            .map(|index| Arc::new(SourcePipe::new(index, source_spec)))
            .collect();

        debug!(
            "pipe manager: {} source pipes x {} blocks, sink {} blocks, capture {} blocks",
            config.source_pipe_count,
            config.source_pipe_blocks,
            config.sink_pipe_blocks,
            config.capture_pipe_blocks
        );

        Self {
            source_pipes,
            sink_pipe: Arc::new(SinkPipe::new(sink_spec)),
            capture_pipe: Arc::new(CapturePipe::new(capture_spec)),
        }
    }

    /// Hand out the first source pipe with no claimed ports
    ///
    /// The caller owns no claim yet; it must follow up with
    /// [`set_source_pipe_port_user`](Self::set_source_pipe_port_user) before
    /// using the pipe, which is what realizes the buffer.
    pub fn obtain_source_pipe(&self) -> Result<Arc<SourcePipe>> {
        self.source_pipes
            .iter()
            .find(|pipe| pipe.is_unclaimed())
            .cloned()
            .ok_or_else(|| {
                Error::ResourceAllocationFailed(format!(
                    "all {} source pipes are claimed",
                    self.source_pipes.len()
                ))
            })
    }

    pub fn source_pipe_by_index(&self, index: usize) -> Option<Arc<SourcePipe>> {
        self.source_pipes.get(index).cloned()
    }

    pub fn sink_pipe(&self) -> Arc<SinkPipe> {
        Arc::clone(&self.sink_pipe)
    }

    pub fn capture_pipe(&self) -> Arc<CapturePipe> {
        Arc::clone(&self.capture_pipe)
    }

    /// Claim or release one port of a source pipe
    ///
    /// First claim allocates the pipe's buffer; last release resets the pipe
    /// and frees it, returning the pipe to the obtainable pool.
    pub fn set_source_pipe_port_user(
        &self,
        pipe: &Arc<SourcePipe>,
        direction: PortDirection,
        user: PortUser,
        set: bool,
    ) {
        match pipe.set_port_user(direction, user, set) {
            ClaimTransition::FirstClaim => {
                debug!("source pipe {}: first claim ({:?}), allocating", pipe.index(), user);
                pipe.allocate_buffer();
            }
            ClaimTransition::LastRelease => {
                debug!("source pipe {}: last release ({:?}), freeing", pipe.index(), user);
                pipe.reset();
                pipe.release_buffer();
            }
            ClaimTransition::NoChange => {}
        }
    }

    /// Claim or release one port of the sink pipe
    pub fn set_sink_pipe_port_user(&self, direction: PortDirection, user: PortUser, set: bool) {
        match self.sink_pipe.set_port_user(direction, user, set) {
            ClaimTransition::FirstClaim => {
                debug!("sink pipe: first claim ({:?}), allocating", user);
                self.sink_pipe.allocate_buffer();
            }
            ClaimTransition::LastRelease => {
                debug!("sink pipe: last release ({:?}), freeing", user);
                self.sink_pipe.reset();
                self.sink_pipe.release_buffer();
            }
            ClaimTransition::NoChange => {}
        }
    }

    /// Claim or release one port of the capture pipe
    pub fn set_capture_pipe_port_user(&self, direction: PortDirection, user: PortUser, set: bool) {
        match self.capture_pipe.set_port_user(direction, user, set) {
            ClaimTransition::FirstClaim => {
                debug!("capture pipe: first claim ({:?}), allocating", user);
                self.capture_pipe.allocate_buffer();
            }
            ClaimTransition::LastRelease => {
                debug!("capture pipe: last release ({:?}), freeing", user);
                self.capture_pipe.reset();
                self.capture_pipe.release_buffer();
            }
            ClaimTransition::NoChange => {}
        }
    }

    /// True when any source pipe has recycled blocks awaiting return
    pub fn is_polling_required(&self) -> bool {
        self.source_pipes.iter().any(|pipe| pipe.recycler_len() > 0)
    }

    /// Drain every non-empty recycler, forwarding metadata to `listener` and
    /// returning the blocks to their producer queues
    pub fn poll(&self, listener: &mut dyn RecycleListener) {
        for pipe in &self.source_pipes {
            while let Some(block) = pipe.lock_recycle() {
                listener.on_recycle_item(RecycledBlock {
                    pipe_index: pipe.index(),
                    tag: block.tag,
                    position_ms: block.position_ms,
                });
                pipe.unlock_recycle(block);
            }
        }
    }

    pub fn source_pipe_count(&self) -> usize {
        self.source_pipes.len()
    }
}
