//! Playback bleed removal
//!
//! Open-mic recording picks up the playback mix from the speakers. Given
//! the reference mix that was playing during the take, estimate how much
//! of it leaked into the recording (delay + level) and subtract the scaled,
//! delayed reference from the take.
//!
//! Estimation runs on mono mixdowns; subtraction is per channel with the
//! same global lag and scale. A single global estimate holds up well for a
//! static mic/speaker setup over take-length material.

use rayon::prelude::*;

use crate::error::{MixerError, MixerResult};
use crate::types::{Sample, SampleBuffer};

/// Largest speaker-to-mic delay searched (room paths plus driver slop)
const MAX_LAG_SECS: f64 = 0.1;

/// Correlation window length for the lag search
const LAG_WINDOW_SECS: f64 = 1.0;

/// Below this leak level, subtraction does more harm than good
const MIN_ALPHA: f32 = 0.05;

/// Subtract the estimated playback leak from a recorded take.
///
/// `reference` is the master mix rendered while the take was captured,
/// already aligned to the take's start. Returns the cleaned take; if the
/// estimated leak is negligible the take comes back unchanged.
pub fn remove_bleed(recorded: &SampleBuffer, reference: &SampleBuffer) -> MixerResult<SampleBuffer> {
    if recorded.sample_rate() != reference.sample_rate() {
        return Err(MixerError::SampleRateMismatch {
            recorded: recorded.sample_rate(),
            reference: reference.sample_rate(),
        });
    }
    if recorded.is_empty() || reference.is_empty() {
        return Ok(recorded.clone());
    }

    let rec: Vec<Sample> = recorded.iter().map(|f| f.mixdown()).collect();
    let rf: Vec<Sample> = reference.iter().map(|f| f.mixdown()).collect();

    let lag = estimate_lag(&rec, &rf, recorded.sample_rate());
    let alpha = estimate_alpha(&rec, &rf, lag);
    log::debug!("bleed estimate: lag={} frames, alpha={:.3}", lag, alpha);

    if alpha < MIN_ALPHA {
        return Ok(recorded.clone());
    }

    let mut cleaned = recorded.clone();
    let ref_frames = reference.as_slice();
    for i in lag..cleaned.len() {
        let j = i - lag;
        if j >= ref_frames.len() {
            break;
        }
        cleaned[i] = cleaned[i] - ref_frames[j] * alpha;
    }
    Ok(cleaned)
}

/// Find the delay (in frames) that best aligns the reference with the
/// recording, by brute-force correlation over a central window.
///
/// The window sits past the first quarter of the take so mic spin-up and
/// count-in noise don't dominate the correlation.
fn estimate_lag(rec: &[Sample], rf: &[Sample], sample_rate: u32) -> usize {
    let max_lag = ((MAX_LAG_SECS * sample_rate as f64) as usize).min(rec.len().saturating_sub(1));
    if max_lag == 0 {
        return 0;
    }

    let start = rec.len() / 4;
    let window = ((LAG_WINDOW_SECS * sample_rate as f64) as usize)
        .min(rec.len().saturating_sub(start));
    if window == 0 {
        return 0;
    }

    (0..=max_lag)
        .into_par_iter()
        .map(|lag| {
            let mut corr = 0.0f64;
            for i in start..start + window {
                if i < lag {
                    continue;
                }
                let j = i - lag;
                if j >= rf.len() {
                    break;
                }
                corr += rec[i] as f64 * rf[j] as f64;
            }
            (lag, corr)
        })
        .reduce(
            || (0, f64::MIN),
            |a, b| if b.1 > a.1 { b } else { a },
        )
        .0
}

/// Least-squares leak level at the given lag, clamped to a sane range
fn estimate_alpha(rec: &[Sample], rf: &[Sample], lag: usize) -> f32 {
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for i in lag..rec.len() {
        let j = i - lag;
        if j >= rf.len() {
            break;
        }
        let r = rf[j] as f64;
        num += rec[i] as f64 * r;
        den += r * r;
    }
    if den < 1e-12 {
        return 0.0;
    }
    ((num / den) as f32).clamp(0.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoFrame;

    /// Deterministic broadband-ish test signal
    fn test_signal(len: usize, sample_rate: u32) -> SampleBuffer {
        let mut frames = Vec::with_capacity(len);
        let mut x = 0x2545f4914f6cdd1du64;
        for i in 0..len {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let noise = (x as f64 / u64::MAX as f64) as f32 - 0.5;
            let tone = (i as f32 * 0.05).sin() * 0.3;
            frames.push(StereoFrame::mono(tone + noise * 0.2));
        }
        SampleBuffer::from_frames(frames, sample_rate)
    }

    /// Reference delayed by `lag` frames and scaled by `alpha`, plus a
    /// quiet "performance" on top
    fn leaked_recording(reference: &SampleBuffer, lag: usize, alpha: f32) -> SampleBuffer {
        let mut frames = vec![StereoFrame::silence(); reference.len()];
        for i in lag..frames.len() {
            frames[i] = reference[i - lag] * alpha;
        }
        for (i, f) in frames.iter_mut().enumerate() {
            *f += StereoFrame::mono((i as f32 * 0.002).sin() * 0.05);
        }
        SampleBuffer::from_frames(frames, reference.sample_rate())
    }

    #[test]
    fn test_removes_delayed_scaled_leak() {
        let sr = 8000;
        let reference = test_signal(sr as usize * 4, sr);
        let recorded = leaked_recording(&reference, 160, 0.7);

        let cleaned = remove_bleed(&recorded, &reference).unwrap();

        // Residual energy past the lag region drops by an order of magnitude
        let energy = |buf: &SampleBuffer| -> f64 {
            buf.iter().skip(200).map(|f| (f.mixdown() as f64).powi(2)).sum()
        };
        let before = energy(&recorded);
        let after = energy(&cleaned);
        assert!(
            after < before * 0.2,
            "before={:.3} after={:.3}",
            before,
            after
        );
    }

    #[test]
    fn test_self_reference_cancels_completely() {
        // The reference fed back as the "recording": lag 0, alpha exactly 1,
        // everything cancels
        let sr = 8000;
        let reference = test_signal(sr as usize * 2, sr);
        let recorded = reference.clone();

        let cleaned = remove_bleed(&recorded, &reference).unwrap();
        assert!(cleaned.peak() < 1e-4, "peak = {}", cleaned.peak());
    }

    #[test]
    fn test_unrelated_reference_leaves_take_alone() {
        let sr = 8000;
        let reference = test_signal(sr as usize * 2, sr);

        // Recording carries none of the reference
        let mut frames = Vec::new();
        for i in 0..reference.len() {
            frames.push(StereoFrame::mono((i as f32 * 0.011).cos() * 0.2));
        }
        let recorded = SampleBuffer::from_frames(frames, sr);

        let cleaned = remove_bleed(&recorded, &reference).unwrap();
        for i in 0..recorded.len() {
            assert_eq!(cleaned[i], recorded[i]);
        }
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() {
        let a = SampleBuffer::silence(100, 48000);
        let b = SampleBuffer::silence(100, 44100);
        assert!(matches!(
            remove_bleed(&a, &b),
            Err(MixerError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_inputs_pass_through() {
        let empty = SampleBuffer::new(48000);
        let reference = SampleBuffer::silence(100, 48000);
        assert_eq!(remove_bleed(&empty, &reference).unwrap().len(), 0);
    }
}
