//! Transport clock
//!
//! The single source of truth for "where are we in the song". Elapsed real
//! time is scaled by the live tempo ratio and accumulated into a playback
//! position clamped to the song bounds. Every consumer (loop check, source
//! creation, UI position) reads this clock; nothing else keeps its own idea
//! of the position.

use crate::stretch::{TempoProvider, UnityTempo};

/// Authoritative playback position tracker
///
/// Time inputs are explicit seconds supplied by the caller (monotonic),
/// which keeps every clock property testable without sleeping.
pub struct TransportClock {
    /// Playback position in seconds, clamped to [0, duration]
    position: f64,
    /// Song duration in seconds. Zero means "unknown": the clock stays
    /// monotonic but unclamped above.
    duration: f64,
    /// Real-time anchor of the last update. None until first tick.
    last_real_time: Option<f64>,
    /// Live tempo ratio source (unity when no processing node is active)
    tempo: Box<dyn TempoProvider + Send>,
}

impl TransportClock {
    pub fn new(duration: f64, tempo: Box<dyn TempoProvider + Send>) -> Self {
        Self {
            position: 0.0,
            duration: duration.max(0.0),
            last_real_time: None,
            tempo,
        }
    }

    /// Clock with no tempo processing (ratio fixed at 1.0)
    pub fn unity(duration: f64) -> Self {
        Self::new(duration, Box::new(UnityTempo))
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration.max(0.0);
        self.position = self.clamp(self.position);
    }

    fn clamp(&self, p: f64) -> f64 {
        if self.duration > 0.0 {
            p.clamp(0.0, self.duration)
        } else {
            p.max(0.0)
        }
    }

    /// Advance the position by the real time elapsed since the last update,
    /// scaled by the current tempo ratio.
    ///
    /// All inputs are clamped defensively; a backwards `now` contributes
    /// nothing rather than rewinding the song.
    pub fn tick(&mut self, now: f64) {
        if let Some(last) = self.last_real_time {
            let delta = (now - last).max(0.0);
            let ratio = self.tempo.tempo_ratio().max(0.0);
            self.position = self.clamp(self.position + delta * ratio);
        }
        self.last_real_time = Some(now);
    }

    /// Unconditional jump (seek/scratch/stop). Re-anchors the real-time
    /// reference at the jump instant so the next tick measures elapsed time
    /// from here - without this, the first tick after a jump would add the
    /// whole gap since the previous tick.
    pub fn set_position(&mut self, position: f64, now: f64) {
        self.position = self.clamp(position);
        self.last_real_time = Some(now);
    }

    /// Whether the position has reached the end of the song
    pub fn at_end(&self) -> bool {
        self.duration > 0.0 && self.position >= self.duration
    }
}
