//! Caller-visible player events
//!
//! Asynchronous completions are delivered as [`PlayerEvent`] values through a
//! listener registered on each player. Events are always dispatched from the
//! control thread during [`AudioSystem::poll`](crate::system::AudioSystem::poll),
//! never from the render or decode threads.

use crate::error::ErrorKind;

/// Events emitted by an [`AudioPlayer`](crate::player::AudioPlayer)
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Asynchronous preparation finished; the player is now PREPARED
    Prepared,

    /// A seek request completed
    ///
    /// `position_ms` is the position actually applied (debounced requests
    /// coalesce, so intermediate targets never produce an event).
    SeekComplete { position_ms: u32 },

    /// Decoder buffering progress changed
    ///
    /// `percent` is 0..=100 of the stream duration buffered ahead of the
    /// playback position. Only emitted on change.
    BufferingUpdate { percent: u8 },

    /// Playback reached end of stream without looping or a chained player
    Completion,

    /// An asynchronous failure occurred; the player has entered ERROR state
    Error { kind: ErrorKind, message: String },
}

/// Listener invoked on the control thread for each player event
pub type PlayerEventListener = Box<dyn FnMut(PlayerEvent) + Send>;
