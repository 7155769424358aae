//! Playback and recording engine
//!
//! - PlaybackSession: stems, tracks and their single-use sources
//! - ScratchController: throttled preview while dragging the playhead
//! - EngineCommand: lock-free UI-to-render command queue
//! - StemMixer: the facade tying transport, capture and processing together

pub mod command;
mod mixer;
mod playback;
mod scratch;

pub use command::{command_channel, EngineCommand, COMMAND_QUEUE_CAPACITY};
pub use mixer::StemMixer;
pub use playback::{PlaybackSession, Stem, Track};
pub use scratch::{ScratchController, SCRATCH_SEGMENT_SECS, SCRATCH_THROTTLE_SECS};
