//! Lock-free block pipes
//!
//! Pipes are the only structure shared between the render thread and the
//! decode/control threads without cross-role locking. Three shapes exist:
//!
//! - [`SourcePipe`]: decoder → mixer, with a recycler detour so the control
//!   thread can observe consumed positions
//! - [`SinkPipe`]: mixer → sink backend
//! - [`CapturePipe`]: mixer tap → capture listener
//!
//! [`PipeManager`] owns fixed pools of each and ties buffer allocation to
//! port claims.

mod block;
mod capture;
mod manager;
mod queue;
mod sink;
mod source;

pub use block::{Block, BlockTag, TagMask};
pub use capture::CapturePipe;
pub use manager::{PipeManager, RecycleListener, RecycledBlock};
pub use sink::SinkPipe;
pub use source::{SourcePipe, SourcePipeStats};

/// Fixed geometry of one pipe instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSpec {
    /// Frames per block
    pub block_frames: usize,

    /// Interleaved channels per frame
    pub channels: usize,

    /// Blocks in the pool
    pub block_count: usize,
}

impl PipeSpec {
    pub fn samples_per_block(&self) -> usize {
        self.block_frames * self.channels
    }
}

/// Identity of a port claimant
///
/// Claims are per-role rather than per-object: one pipe is wired between at
/// most one producer role and one consumer role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortUser {
    /// An AudioSource's decode-side writer
    AudioSource,
    /// The mixer render path
    Mixer,
    /// The sink backend device feeder
    SinkBackend,
    /// The captured-audio delivery path
    CaptureClient,
    /// The composing AudioSystem itself
    System,
}

impl PortUser {
    fn bit(self) -> u8 {
        match self {
            PortUser::AudioSource => 0b0000_0001,
            PortUser::Mixer => 0b0000_0010,
            PortUser::SinkBackend => 0b0000_0100,
            PortUser::CaptureClient => 0b0000_1000,
            PortUser::System => 0b0001_0000,
        }
    }
}

/// Which side of the pipe a claim applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Result of a claim change, used by the manager to drive buffer lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTransition {
    /// No port was claimed before this call
    FirstClaim,
    /// The last claimed port was just released
    LastRelease,
    /// Claims existed before and still exist (or the call was a no-op)
    NoChange,
}

/// Claim bitmaps for one pipe
#[derive(Debug, Default)]
pub(crate) struct PortState {
    in_mask: u8,
    out_mask: u8,
}

impl PortState {
    pub fn set(&mut self, direction: PortDirection, user: PortUser, set: bool) -> ClaimTransition {
        let was_unclaimed = self.is_unclaimed();
        let mask = match direction {
            PortDirection::Input => &mut self.in_mask,
            PortDirection::Output => &mut self.out_mask,
        };
        if set {
            *mask |= user.bit();
        } else {
            *mask &= !user.bit();
        }
        let now_unclaimed = self.is_unclaimed();
        match (was_unclaimed, now_unclaimed) {
            (true, false) => ClaimTransition::FirstClaim,
            (false, true) => ClaimTransition::LastRelease,
            _ => ClaimTransition::NoChange,
        }
    }

    pub fn is_unclaimed(&self) -> bool {
        self.in_mask == 0 && self.out_mask == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_spec_samples() {
        let spec = PipeSpec {
            block_frames: 1024,
            channels: 2,
            block_count: 8,
        };
        assert_eq!(spec.samples_per_block(), 2048);
    }

    #[test]
    fn test_claim_transitions() {
        let mut ports = PortState::default();
        assert!(ports.is_unclaimed());

        assert_eq!(
            ports.set(PortDirection::Input, PortUser::AudioSource, true),
            ClaimTransition::FirstClaim
        );
        assert_eq!(
            ports.set(PortDirection::Output, PortUser::Mixer, true),
            ClaimTransition::NoChange
        );
        assert!(!ports.is_unclaimed());

        assert_eq!(
            ports.set(PortDirection::Input, PortUser::AudioSource, false),
            ClaimTransition::NoChange
        );
        assert_eq!(
            ports.set(PortDirection::Output, PortUser::Mixer, false),
            ClaimTransition::LastRelease
        );
        assert!(ports.is_unclaimed());
    }

    #[test]
    fn test_claim_idempotent() {
        let mut ports = PortState::default();
        assert_eq!(
            ports.set(PortDirection::Input, PortUser::Mixer, true),
            ClaimTransition::FirstClaim
        );
        // Claiming the same user again changes nothing
        assert_eq!(
            ports.set(PortDirection::Input, PortUser::Mixer, true),
            ClaimTransition::NoChange
        );
        // One release clears it regardless of repeat claims
        assert_eq!(
            ports.set(PortDirection::Input, PortUser::Mixer, false),
            ClaimTransition::LastRelease
        );
        // Releasing an unclaimed port is a no-op
        assert_eq!(
            ports.set(PortDirection::Input, PortUser::Mixer, false),
            ClaimTransition::NoChange
        );
    }
}
