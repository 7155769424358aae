//! Mixer error types

use thiserror::Error;

use crate::types::DeviceKey;

/// Errors surfaced by the transport and recording engine
#[derive(Error, Debug)]
pub enum MixerError {
    /// No input devices available at all
    #[error("No audio input devices found")]
    NoDevices,

    /// Device could not be opened (permission denied, busy, unplugged)
    #[error("Cannot access input device '{device}': {reason}")]
    DeviceAccess { device: String, reason: String },

    /// Named device does not exist
    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to build a capture stream
    #[error("Failed to build capture stream: {0}")]
    StreamBuild(String),

    /// Recording requested with nothing armed
    #[error("No armed tracks - arm at least one track before recording")]
    NoArmedTracks,

    /// A recording session is already running
    #[error("A recording session is already active")]
    AlreadyRecording,

    /// Stop/punch operation without an active session
    #[error("No recording session is active")]
    NotRecording,

    /// A device's captured stream could not be decoded into a buffer.
    /// Isolated per device: other devices' takes are unaffected.
    #[error("Failed to decode capture from device '{device}': {reason}")]
    DecodeFailed { device: DeviceKey, reason: String },

    /// Bleed removal requires matching sample rates
    #[error("Sample rate mismatch: recorded={recorded}Hz, reference={reference}Hz")]
    SampleRateMismatch { recorded: u32, reference: u32 },

    /// Operation referenced a track id that does not exist
    #[error("Unknown track: {0}")]
    UnknownTrack(crate::types::TrackId),

    /// Export requested for a track that has no captured take
    #[error("Track {0} has no take to export")]
    NoTake(crate::types::TrackId),

    /// Take could not be written to disk
    #[error("Failed to export take: {0}")]
    Export(String),

    /// Calibration/config persistence failure
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for mixer operations
pub type MixerResult<T> = Result<T, MixerError>;
