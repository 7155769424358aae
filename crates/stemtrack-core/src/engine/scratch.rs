//! Scratch preview - throttled audible segments while dragging the transport
//!
//! While a drag gesture is active the visual position follows every event,
//! but audible feedback is short preview segments rate-limited to bound
//! audio churn. Segments read the raw stem mix directly (no tempo
//! processing in the path) and self-terminate by sample countdown,
//! independent of the transport.

use crate::types::StereoFrame;

use super::playback::PlaybackSession;

/// Minimum gap between audible segments
pub const SCRATCH_THROTTLE_SECS: f64 = 0.04;

/// Length of one audible preview segment
pub const SCRATCH_SEGMENT_SECS: f64 = 0.15;

/// One self-terminating preview segment
#[derive(Debug)]
struct Segment {
    /// Next frame to read from the mix
    cursor: usize,
    /// Frames left before the segment silences itself
    remaining: usize,
}

/// Scratch-mode state machine
pub struct ScratchController {
    active: bool,
    /// Playback was running when scratch mode was entered
    resume_playback: bool,
    /// Real time of the last audible segment start
    last_audible: Option<f64>,
    segment: Option<Segment>,
}

impl ScratchController {
    pub fn new() -> Self {
        Self {
            active: false,
            resume_playback: false,
            last_audible: None,
            segment: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Enter scratch mode, remembering whether to resume playback on exit.
    /// The caller consumes the playback sources itself (silently - consumed
    /// sources cannot emit an "ended" signal).
    pub fn start(&mut self, was_playing: bool) {
        self.active = true;
        self.resume_playback = was_playing;
        self.last_audible = None;
        self.segment = None;
    }

    /// Request an audible segment at `position_frame`. Returns false when
    /// throttled; the visual position has already moved regardless.
    pub fn request_segment(&mut self, now: f64, position_frame: usize, sample_rate: u32) -> bool {
        if !self.active {
            return false;
        }
        if let Some(last) = self.last_audible {
            if now - last < SCRATCH_THROTTLE_SECS {
                return false;
            }
        }
        self.last_audible = Some(now);
        self.segment = Some(Segment {
            cursor: position_frame,
            remaining: (SCRATCH_SEGMENT_SECS * sample_rate as f64) as usize,
        });
        true
    }

    /// Exit scratch mode. Returns true if the caller should resume normal
    /// playback (it also resets the stretch node before doing so).
    pub fn finish(&mut self) -> bool {
        self.active = false;
        self.segment = None;
        self.last_audible = None;
        std::mem::take(&mut self.resume_playback)
    }

    /// Render the live segment (if any) into `output` and count it down.
    /// Once `remaining` hits zero the segment is dropped and output is
    /// silence until the next un-throttled `request_segment`.
    pub fn render(&mut self, playback: &PlaybackSession, output: &mut [StereoFrame]) {
        output.fill(StereoFrame::silence());

        let Some(segment) = &mut self.segment else {
            return;
        };

        let n = output.len().min(segment.remaining);
        playback.render_preview(segment.cursor, &mut output[..n]);
        segment.cursor += n;
        segment.remaining -= n;

        if segment.remaining == 0 {
            self.segment = None;
        }
    }
}

impl Default for ScratchController {
    fn default() -> Self {
        Self::new()
    }
}
