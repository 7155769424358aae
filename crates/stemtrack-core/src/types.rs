//! Common types for stemtrack
//!
//! Fundamental audio types shared by the transport and the recording engine:
//! stereo frames, sample-rate-aware buffers, and the key types used to
//! identify tracks and capture devices.

use std::ops::{Index, IndexMut};

/// Default sample rate (48kHz, standard professional audio rate).
/// The actual rate is taken from the mixer configuration at construction.
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Audio sample type (32-bit float for processing, 16-bit in emitted WAV files)
pub type Sample = f32;

/// One stereo frame (left and right channel samples)
///
/// `#[repr(C)]` guarantees the [left, right] memory layout, so a
/// `&[StereoFrame]` can be reinterpreted as interleaved `&[f32]` via bytemuck
/// with no per-frame conversion.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoFrame {
    pub left: Sample,
    pub right: Sample,
}

impl StereoFrame {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// A silent frame
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Mono mixdown (average of both channels)
    #[inline]
    pub fn mixdown(&self) -> Sample {
        0.5 * (self.left + self.right)
    }

    /// Peak amplitude across both channels
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoFrame {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoFrame {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Sub for StereoFrame {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            left: self.left - other.left,
            right: self.right - other.right,
        }
    }
}

impl std::ops::Mul<Sample> for StereoFrame {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoFrame {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo frames with a known sample rate
///
/// The unit of decoded audio throughout the engine: stem buffers are loaded
/// once and never mutated, captured takes are decoded into one of these at
/// the end of a recording session.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    frames: Vec<StereoFrame>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Empty buffer at the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        Self { frames: Vec::new(), sample_rate }
    }

    /// Silent buffer of `len` frames
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self {
            frames: vec![StereoFrame::silence(); len],
            sample_rate,
        }
    }

    /// Build from interleaved samples [L, R, L, R, ...]
    pub fn from_interleaved(interleaved: &[Sample], sample_rate: u32) -> Self {
        assert!(interleaved.len() % 2 == 0, "interleaved buffer must have even length");
        let frames = interleaved
            .chunks_exact(2)
            .map(|c| StereoFrame::new(c[0], c[1]))
            .collect();
        Self { frames, sample_rate }
    }

    /// Build from a mono signal, duplicating into both channels
    pub fn from_mono(samples: &[Sample], sample_rate: u32) -> Self {
        let frames = samples.iter().map(|&s| StereoFrame::mono(s)).collect();
        Self { frames, sample_rate }
    }

    pub fn from_frames(frames: Vec<StereoFrame>, sample_rate: u32) -> Self {
        Self { frames, sample_rate }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.frames.len() as f64 / self.sample_rate as f64
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoFrame] {
        &self.frames
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoFrame] {
        &mut self.frames
    }

    /// Zero-copy view as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.frames)
    }

    /// Zero-copy mutable view as interleaved f32
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.frames)
    }

    /// Append interleaved stereo samples (capture chunk ingestion)
    pub fn extend_from_interleaved(&mut self, interleaved: &[Sample]) {
        self.frames.extend(
            interleaved
                .chunks_exact(2)
                .map(|c| StereoFrame::new(c[0], c[1])),
        );
    }

    /// Drop `n` leading frames (latency compensation). No-op if `n` would
    /// remove the whole buffer.
    pub fn trim_leading(&mut self, n: usize) {
        if n > 0 && n < self.frames.len() {
            self.frames.drain(..n);
        }
    }

    pub fn fill_silence(&mut self) {
        self.frames.fill(StereoFrame::silence());
    }

    pub fn resize(&mut self, new_len: usize) {
        self.frames.resize(new_len, StereoFrame::silence());
    }

    #[inline]
    pub fn push(&mut self, frame: StereoFrame) {
        self.frames.push(frame);
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoFrame> {
        self.frames.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoFrame> {
        self.frames.iter_mut()
    }

    /// Peak amplitude over the whole buffer
    pub fn peak(&self) -> Sample {
        self.frames.iter().map(|f| f.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for SampleBuffer {
    type Output = StereoFrame;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.frames[index]
    }
}

impl IndexMut<usize> for SampleBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.frames[index]
    }
}

/// Identifier for a recorded track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Key identifying one physical input device in the stream pool
///
/// `Default` is the sentinel for "whatever the system default input is";
/// tracks that never picked a device share one pooled stream under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Default,
    Id(String),
}

impl DeviceKey {
    pub fn from_option(id: Option<&str>) -> Self {
        match id {
            Some(s) if !s.is_empty() => DeviceKey::Id(s.to_string()),
            _ => DeviceKey::Default,
        }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKey::Default => write!(f, "default"),
            DeviceKey::Id(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_arithmetic() {
        let a = StereoFrame::new(1.0, 2.0);
        let b = StereoFrame::new(0.5, 0.5);

        let sum = a + b;
        assert_eq!(sum.left, 1.5);
        assert_eq!(sum.right, 2.5);

        let scaled = a * 0.5;
        assert_eq!(scaled.left, 0.5);
        assert_eq!(scaled.right, 1.0);

        let diff = a - b;
        assert_eq!(diff.left, 0.5);
        assert_eq!(diff.right, 1.5);
    }

    #[test]
    fn test_buffer_interleaved_roundtrip() {
        let buf = SampleBuffer::from_interleaved(&[1.0, 2.0, 3.0, 4.0], 48000);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[0].left, 1.0);
        assert_eq!(buf[1].right, 4.0);
        assert_eq!(buf.as_interleaved(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_trim_leading() {
        let mut buf = SampleBuffer::from_mono(&[1.0, 2.0, 3.0, 4.0], 48000);
        buf.trim_leading(2);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[0].left, 3.0);

        // Trimming the whole buffer is a no-op
        buf.trim_leading(10);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_duration() {
        let buf = SampleBuffer::silence(24000, 48000);
        assert!((buf.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_device_key() {
        assert_eq!(DeviceKey::from_option(None), DeviceKey::Default);
        assert_eq!(DeviceKey::from_option(Some("")), DeviceKey::Default);
        assert_eq!(
            DeviceKey::from_option(Some("hw:1,0")),
            DeviceKey::Id("hw:1,0".into())
        );
        assert_eq!(DeviceKey::Default.to_string(), "default");
    }
}
