//! Lock-free command queue for mixer control
//!
//! UI code never touches the mixer directly: it pushes commands onto a
//! wait-free SPSC ringbuffer and the render thread drains them at quantum
//! boundaries. No mutex on the hot path means no contention-induced
//! dropouts, and every state change lands at a deterministic point in the
//! render cycle.

use std::sync::Arc;

use crate::types::{DeviceKey, SampleBuffer, TrackId};

/// Commands sent from the UI thread to the render thread
///
/// Each variant is one atomic operation on the mixer. Positions are in
/// seconds of song time; gains are linear.
pub enum EngineCommand {
    // ─────────────────────────────────────────────────────────────
    // Lanes
    // ─────────────────────────────────────────────────────────────
    /// Add (or replace) a named stem. The buffer is shared, not copied,
    /// so the command stays pointer-sized.
    AddStem {
        name: String,
        buffer: Arc<SampleBuffer>,
    },
    /// Create an empty recording track; its id comes back through state
    AddTrack { name: String },
    /// Remove a track and its audio
    RemoveTrack { id: TrackId },
    /// Route a track's input to a capture device
    SetTrackDevice { id: TrackId, device: DeviceKey },

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    Play,
    Pause,
    /// Stop and rewind to zero
    Stop,
    /// Jump to a position, keeping the current play state
    Seek { position: f64 },

    // ─────────────────────────────────────────────────────────────
    // Scratch (drag-the-playhead preview)
    // ─────────────────────────────────────────────────────────────
    /// Enter scratch mode, silencing normal playback
    ScratchStart,
    /// Move the playhead while scratching; audio is throttled internally
    ScratchMove { position: f64 },
    /// Exit scratch mode, resuming playback if it was running before
    ScratchEnd,

    // ─────────────────────────────────────────────────────────────
    // Loop
    // ─────────────────────────────────────────────────────────────
    SetLoop { start: f64, end: f64 },
    ClearLoop,

    // ─────────────────────────────────────────────────────────────
    // Stem and track mix state
    // ─────────────────────────────────────────────────────────────
    SetStemGain { name: String, gain: f32 },
    SetStemPan { name: String, pan: f32 },
    SetStemMuted { name: String, muted: bool },
    SetStemSoloed { name: String, soloed: bool },
    /// Exclude a stem from the mix entirely (distinct from mute: an
    /// inactive stem has no lane at all)
    SetStemActive { name: String, active: bool },
    SetTrackVolume { id: TrackId, volume: f32 },
    SetTrackPan { id: TrackId, pan: f32 },
    SetTrackMuted { id: TrackId, muted: bool },
    SetTrackSoloed { id: TrackId, soloed: bool },

    // ─────────────────────────────────────────────────────────────
    // Tempo / pitch
    // ─────────────────────────────────────────────────────────────
    /// Playback-seconds per real second (1.0 = original tempo)
    SetTempoRatio(f64),
    /// Key adjustment independent of tempo
    SetPitchSemitones(f64),

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────
    /// Arm a track; punches in live if a session is running
    ArmTrack { id: TrackId },
    /// Disarm a track; punches out live if a session is running
    DisarmTrack { id: TrackId },
    /// Start recording all armed tracks at the current position
    StartRecording,
    /// End the session and assign takes to their tracks
    StopRecording,
    /// Run the loopback latency calibration
    CalibrateLatency,
    /// Forget the stored calibration
    ResetCalibration,
    /// Input pass-through gain for a device (0.0 = muted, the default)
    SetMonitorVolume { device: DeviceKey, gain: f32 },
}

/// Capacity of the command queue
///
/// Session load can burst a command per stem plus mix state for each;
/// 256 is far beyond any realistic burst at this surface.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Create a command channel: the producer lives on the UI thread, the
/// consumer on the render thread.
pub fn command_channel() -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}
