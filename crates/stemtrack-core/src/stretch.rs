//! Tempo/pitch processing node
//!
//! Wraps signalsmith-stretch as the external processing node the transport
//! routes through. The core never implements time-stretching itself: it
//! configures the node (ratio, pitch) and schedules buffers through it.
//!
//! The node publishes its effective ratio through a [`TempoTap`] so the
//! transport clock can read it without holding a reference to the node -
//! dependency injection instead of an ambient global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use signalsmith_stretch::Stretch;

use crate::types::SampleBuffer;

/// Stereo processing
const CHANNELS: u32 = 2;

/// Source of the effective real-time-to-playback-time ratio
///
/// 1.0 means one second of wall time advances the song by one second.
pub trait TempoProvider {
    fn tempo_ratio(&self) -> f64;
}

/// Fixed unity tempo, used when no processing node is present
#[derive(Debug, Clone, Copy, Default)]
pub struct UnityTempo;

impl TempoProvider for UnityTempo {
    fn tempo_ratio(&self) -> f64 {
        1.0
    }
}

/// Lock-free shared view of a stretch node's current ratio
///
/// The node writes on every ratio change; the clock reads every tick.
/// f64 bits in an AtomicU64, relaxed ordering - only visibility matters.
#[derive(Debug)]
pub struct TempoTap {
    ratio_bits: AtomicU64,
}

impl TempoTap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ratio_bits: AtomicU64::new(1.0f64.to_bits()),
        })
    }

    fn publish(&self, ratio: f64) {
        self.ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }
}

impl TempoProvider for TempoTap {
    fn tempo_ratio(&self) -> f64 {
        f64::from_bits(self.ratio_bits.load(Ordering::Relaxed))
    }
}

impl TempoProvider for Arc<TempoTap> {
    fn tempo_ratio(&self) -> f64 {
        self.as_ref().tempo_ratio()
    }
}

/// Tempo/pitch node wrapping signalsmith-stretch
///
/// Ratio semantics: playback seconds advanced per real second. ratio > 1.0
/// plays faster (more song per second of output), ratio < 1.0 slower.
/// Pitch shifting is independent of tempo (for key adjustment).
pub struct StretchNode {
    stretcher: Stretch,
    ratio: f64,
    pitch_semitones: f64,
    tap: Arc<TempoTap>,
}

impl StretchNode {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            stretcher: Stretch::preset_default(CHANNELS, sample_rate),
            ratio: 1.0,
            pitch_semitones: 0.0,
            tap: TempoTap::new(),
        }
    }

    /// Shared ratio tap for the transport clock
    pub fn tap(&self) -> Arc<TempoTap> {
        Arc::clone(&self.tap)
    }

    /// Set the tempo ratio, clamped to a usable range
    pub fn set_ratio(&mut self, ratio: f64) {
        self.ratio = ratio.clamp(0.5, 2.0);
        self.tap.publish(self.ratio);
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Pitch shift in semitones, clamped to one octave either way
    pub fn set_pitch_semitones(&mut self, semitones: f64) {
        self.pitch_semitones = semitones.clamp(-12.0, 12.0);
        self.stretcher
            .set_transpose_factor_semitones(self.pitch_semitones as f32, None);
    }

    pub fn pitch_semitones(&self) -> f64 {
        self.pitch_semitones
    }

    /// Reset internal state. Called whenever stem routing is rebuilt
    /// (seek restart, scratch exit) so stale windows don't smear across
    /// the discontinuity.
    pub fn reset(&mut self) {
        self.stretcher.reset();
    }

    /// Process a buffer through the node.
    ///
    /// `input` holds `input.len()` frames read from the stems at native
    /// rate; `output` receives `output.len()` frames at the target rate.
    /// The actual stretch applied is the size ratio between them. Both
    /// views are zero-copy interleaved casts.
    pub fn process(&mut self, input: &SampleBuffer, output: &mut SampleBuffer) {
        if input.is_empty() {
            output.fill_silence();
            return;
        }

        let in_len = input.len();
        let out_len = output.len();
        let out_interleaved = output.as_interleaved_mut();
        out_interleaved[..out_len * 2].fill(0.0);

        self.stretcher.process(
            &input.as_interleaved()[..in_len * 2],
            &mut out_interleaved[..out_len * 2],
        );
    }
}
