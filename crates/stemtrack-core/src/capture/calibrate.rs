//! Loopback latency calibration
//!
//! Measures the round trip from the output bus to a capture device: let the
//! capture settle, emit a short full-scale click on the master bus, record
//! for a fixed window, then find the first sample that clears a noise-based
//! threshold. Half the round trip is stored as the one-way compensation
//! trimmed from the start of every take.
//!
//! The whole procedure is driven by the render loop in sample counts, so it
//! needs no timers and is exactly reproducible in tests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{MixerError, MixerResult};
use crate::types::{DeviceKey, Sample, StereoFrame};

use super::backend::ChunkReceiver;
use super::pool::DeviceStreamPool;

/// Settle time before the click, also the startup region skipped in analysis
pub const STABILIZATION_SECS: f64 = 0.2;

/// Click length
pub const IMPULSE_SECS: f64 = 0.001;

/// Capture window after the click starts
pub const CAPTURE_WINDOW_SECS: f64 = 0.4;

/// Detection threshold is this multiple of the startup-region RMS
const THRESHOLD_RMS_FACTOR: f32 = 4.0;

/// Threshold floor, so a dead-quiet room doesn't detect its own dither
const MIN_THRESHOLD: f32 = 0.01;

/// Persisted calibration result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Measured one-way latency in seconds. None means never calibrated.
    pub one_way_secs: Option<f64>,
}

#[derive(Debug)]
enum Phase {
    Idle,
    /// Frames left before the click
    Stabilizing(usize),
    /// Frames of click left to emit
    Emitting(usize),
    /// Frames left in the capture window
    Capturing(usize),
    /// Window complete, waiting for `poll` to analyze
    Done,
}

/// Render-driven calibration state machine
pub struct LatencyCalibrator {
    sample_rate: u32,
    phase: Phase,
    rx: Option<ChunkReceiver>,
    capture_rate: u32,
    state: CalibrationState,
    config_path: PathBuf,
}

impl LatencyCalibrator {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_config_path(sample_rate, config::config_dir().join("calibration.yaml"))
    }

    pub fn with_config_path(sample_rate: u32, config_path: PathBuf) -> Self {
        let state: CalibrationState = config::load_config(&config_path);
        if let Some(one_way) = state.one_way_secs {
            log::info!("Loaded calibrated latency: {:.1}ms one-way", one_way * 1000.0);
        }
        Self {
            sample_rate,
            phase: Phase::Idle,
            rx: None,
            capture_rate: sample_rate,
            state,
            config_path,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Stored one-way compensation, or `fallback` when never calibrated
    pub fn compensation(&self, fallback: f64) -> f64 {
        self.state.one_way_secs.unwrap_or(fallback)
    }

    pub fn calibrated(&self) -> Option<f64> {
        self.state.one_way_secs
    }

    /// Discard the stored measurement, persisting the cleared state
    pub fn reset(&mut self) -> MixerResult<()> {
        self.state.one_way_secs = None;
        config::save_config(&self.state, &self.config_path)
            .map_err(|e| MixerError::Config(format!("{:#}", e)))
    }

    /// Start a calibration run against the default input device
    pub fn begin(&mut self, pool: &mut DeviceStreamPool) -> MixerResult<()> {
        let rx = pool.subscribe(&DeviceKey::Default)?;
        self.capture_rate = pool
            .stream_sample_rate(&DeviceKey::Default)
            .unwrap_or(self.sample_rate);
        self.rx = Some(rx);
        self.phase = Phase::Stabilizing(self.frames(STABILIZATION_SECS));
        log::info!("Calibration started (capture @ {}Hz)", self.capture_rate);
        Ok(())
    }

    fn frames(&self, secs: f64) -> usize {
        (secs * self.sample_rate as f64).round() as usize
    }

    /// Advance the state machine by one render quantum, writing the click
    /// into `output` while the emitting phase lasts. Called after the
    /// master mix so the click rides the reference path like any output.
    pub fn advance(&mut self, output: &mut [StereoFrame]) {
        let quantum = output.len();
        self.phase = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Phase::Idle,
            Phase::Done => Phase::Done,
            Phase::Stabilizing(left) => {
                if left > quantum {
                    Phase::Stabilizing(left - quantum)
                } else {
                    // Up to one quantum of slop lands inside the analysis
                    // skip region
                    Phase::Emitting(self.frames(IMPULSE_SECS).max(1))
                }
            }
            Phase::Emitting(left) => {
                let n = quantum.min(left);
                for frame in output.iter_mut().take(n) {
                    frame.left = 1.0;
                    frame.right = 1.0;
                }
                if left > n {
                    Phase::Emitting(left - n)
                } else {
                    Phase::Capturing(self.frames(CAPTURE_WINDOW_SECS))
                }
            }
            Phase::Capturing(left) => {
                if left > quantum {
                    Phase::Capturing(left - quantum)
                } else {
                    Phase::Done
                }
            }
        };
    }

    /// Finish a completed run: analyze the captured window, fall back to
    /// the backend estimate if the click never crossed the threshold, and
    /// persist the result. Returns the one-way latency once per run.
    pub fn poll(&mut self, fallback: f64) -> Option<f64> {
        if !matches!(self.phase, Phase::Done) {
            return None;
        }
        self.phase = Phase::Idle;

        let mono = self.drain_mono();
        self.rx = None;

        let one_way = match detect_round_trip(&mono, self.capture_rate) {
            Some(round_trip) => {
                let one_way = round_trip / 2.0;
                log::info!(
                    "Calibration: round trip {:.1}ms, one-way {:.1}ms",
                    round_trip * 1000.0,
                    one_way * 1000.0
                );
                one_way
            }
            None => {
                log::warn!(
                    "Calibration click not detected, using backend estimate {:.1}ms",
                    fallback * 1000.0
                );
                fallback
            }
        };

        self.state.one_way_secs = Some(one_way);
        if let Err(e) = config::save_config(&self.state, &self.config_path) {
            log::warn!("Failed to persist calibration: {:#}", e);
        }
        Some(one_way)
    }

    /// Drain the capture subscription into a mono sample vector
    fn drain_mono(&mut self) -> Vec<Sample> {
        let Some(rx) = &self.rx else {
            return Vec::new();
        };
        let mut mono = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            for pair in chunk.chunks_exact(2) {
                mono.push((pair[0] + pair[1]) * 0.5);
            }
        }
        mono
    }
}

/// Find the click in a captured window.
///
/// The first `STABILIZATION_SECS` of the capture are startup noise (device
/// spin-up, AGC settling on some drivers); their RMS sets the detection
/// threshold. The round trip is the time from the click emission (end of
/// stabilization) to the first threshold crossing.
pub fn detect_round_trip(mono: &[Sample], capture_rate: u32) -> Option<f64> {
    let skip = (STABILIZATION_SECS * capture_rate as f64).round() as usize;
    if mono.len() <= skip {
        return None;
    }

    let startup = &mono[..skip];
    let rms = (startup.iter().map(|s| (s * s) as f64).sum::<f64>() / skip as f64).sqrt() as f32;
    let threshold = (rms * THRESHOLD_RMS_FACTOR).max(MIN_THRESHOLD);

    mono[skip..]
        .iter()
        .position(|s| s.abs() > threshold)
        .map(|offset| offset as f64 / capture_rate as f64)
}
