//! Multi-device recording session
//!
//! One session records any number of armed tracks at once, with one capture
//! pipeline per distinct device key (two tracks on the same interface share
//! a pipeline and receive identical audio). Tracks punch in and out of the
//! running session; the session itself only ends on `stop`.
//!
//! Per device the pipeline accumulates raw capture chunks off the device
//! thread and, when the session mixes playback, the master-bus reference
//! used later for bleed removal. Decode/teardown failures are isolated per
//! device: one dead interface never voids another interface's take.

use std::collections::{HashMap, HashSet};

use crate::dsp::bleed;
use crate::error::{MixerError, MixerResult};
use crate::types::{DeviceKey, SampleBuffer, StereoFrame, TrackId};

use super::backend::ChunkReceiver;
use super::pool::DeviceStreamPool;

/// Per-device capture pipeline
struct CapturePipeline {
    rx: ChunkReceiver,
    capture_rate: u32,
    /// Master-bus frames rendered while this pipeline recorded. Empty when
    /// playback never ran during the session (nothing to bleed-remove).
    reference: SampleBuffer,
}

/// One device's finished take
pub struct DeviceTake {
    pub device: DeviceKey,
    pub result: MixerResult<SampleBuffer>,
}

enum SessionPhase {
    Idle,
    Recording {
        /// Transport position at which the session started
        start_offset: f64,
        /// Tracks currently punched in
        active: HashSet<TrackId>,
        /// Every track that took part at any point, for take assignment
        participants: HashSet<TrackId>,
    },
}

/// Recording session state machine
pub struct RecordingSession {
    sample_rate: u32,
    phase: SessionPhase,
    pipelines: HashMap<DeviceKey, CapturePipeline>,
}

impl RecordingSession {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            phase: SessionPhase::Idle,
            pipelines: HashMap::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.phase, SessionPhase::Recording { .. })
    }

    /// Transport position of the session start, if one is running
    pub fn start_offset(&self) -> Option<f64> {
        match &self.phase {
            SessionPhase::Recording { start_offset, .. } => Some(*start_offset),
            SessionPhase::Idle => None,
        }
    }

    /// Tracks currently punched in
    pub fn active_tracks(&self) -> Vec<TrackId> {
        match &self.phase {
            SessionPhase::Recording { active, .. } => {
                let mut ids: Vec<TrackId> = active.iter().copied().collect();
                ids.sort();
                ids
            }
            SessionPhase::Idle => Vec::new(),
        }
    }

    /// Start recording the armed tracks at the given transport position.
    ///
    /// `armed` is the (track, device) snapshot taken at start; distinct
    /// devices each get a pipeline, duplicates share one. Any device that
    /// fails to open aborts the whole start so the user never silently
    /// loses an armed input.
    pub fn start(
        &mut self,
        position: f64,
        armed: &[(TrackId, DeviceKey)],
        pool: &mut DeviceStreamPool,
    ) -> MixerResult<()> {
        if self.is_recording() {
            return Err(MixerError::AlreadyRecording);
        }
        if armed.is_empty() {
            return Err(MixerError::NoArmedTracks);
        }

        self.pipelines.clear();
        for (_, device) in armed {
            if self.pipelines.contains_key(device) {
                continue;
            }
            match self.open_pipeline(device, pool) {
                Ok(pipeline) => {
                    self.pipelines.insert(device.clone(), pipeline);
                }
                Err(e) => {
                    self.pipelines.clear();
                    return Err(e);
                }
            }
        }

        let ids: HashSet<TrackId> = armed.iter().map(|(id, _)| *id).collect();
        log::info!(
            "Recording started at {:.2}s: {} track(s) on {} device(s)",
            position,
            ids.len(),
            self.pipelines.len()
        );
        self.phase = SessionPhase::Recording {
            start_offset: position,
            active: ids.clone(),
            participants: ids,
        };
        Ok(())
    }

    fn open_pipeline(
        &self,
        device: &DeviceKey,
        pool: &mut DeviceStreamPool,
    ) -> MixerResult<CapturePipeline> {
        let rx = pool.subscribe(device)?;
        let capture_rate = pool.stream_sample_rate(device).unwrap_or(self.sample_rate);
        Ok(CapturePipeline {
            rx,
            capture_rate,
            reference: SampleBuffer::new(self.sample_rate),
        })
    }

    /// Add a track to the running session, opening its device pipeline if
    /// no other active track already uses that device.
    ///
    /// A punched-in track's audio starts mid-pipeline: its take begins at
    /// the session start like everyone else's on that device.
    pub fn punch_in(
        &mut self,
        id: TrackId,
        device: &DeviceKey,
        pool: &mut DeviceStreamPool,
    ) -> MixerResult<()> {
        if !self.is_recording() {
            return Err(MixerError::NotRecording);
        }

        if !self.pipelines.contains_key(device) {
            let pipeline = self.open_pipeline(device, pool)?;
            self.pipelines.insert(device.clone(), pipeline);
        }

        if let SessionPhase::Recording {
            active,
            participants,
            ..
        } = &mut self.phase
        {
            active.insert(id);
            participants.insert(id);
            log::info!("Punched in {} on {}", id, device);
        }
        Ok(())
    }

    /// Remove a track from the running session. Its device pipeline keeps
    /// capturing (another track may share it, and stopping a stream
    /// mid-session would glitch); the track simply stops being active.
    pub fn punch_out(&mut self, id: TrackId) -> MixerResult<()> {
        match &mut self.phase {
            SessionPhase::Recording { active, .. } => {
                if active.remove(&id) {
                    log::info!("Punched out {}", id);
                }
                Ok(())
            }
            SessionPhase::Idle => Err(MixerError::NotRecording),
        }
    }

    /// Append master-bus output to every pipeline's reference track.
    /// Called once per render quantum while the session runs.
    pub fn tap_reference(&mut self, master: &[StereoFrame]) {
        if !self.is_recording() {
            return;
        }
        for pipeline in self.pipelines.values_mut() {
            for &frame in master {
                pipeline.reference.push(frame);
            }
        }
    }

    /// End the session and decode every pipeline into a take.
    ///
    /// Per device: drain the queued chunks into a buffer, trim the
    /// calibrated one-way latency from the front, and if a playback
    /// reference was collected, subtract the estimated bleed. Failures
    /// stay inside their own `DeviceTake`.
    ///
    /// Returns the takes plus the participant track ids; the caller maps
    /// takes onto tracks by device key.
    pub fn stop(&mut self, compensation_secs: f64) -> MixerResult<(Vec<DeviceTake>, Vec<TrackId>)> {
        let SessionPhase::Recording { participants, .. } =
            std::mem::replace(&mut self.phase, SessionPhase::Idle)
        else {
            return Err(MixerError::NotRecording);
        };

        let mut takes = Vec::new();
        for (device, pipeline) in self.pipelines.drain() {
            let result = decode_pipeline(&device, pipeline, compensation_secs);
            if let Err(e) = &result {
                log::warn!("Take lost on {}: {}", device, e);
            }
            takes.push(DeviceTake { device, result });
        }
        takes.sort_by(|a, b| a.device.to_string().cmp(&b.device.to_string()));

        let mut ids: Vec<TrackId> = participants.into_iter().collect();
        ids.sort();
        log::info!("Recording stopped: {} take(s)", takes.len());
        Ok((takes, ids))
    }
}

/// Drain one pipeline's chunks into a latency-trimmed, bleed-cleaned buffer
fn decode_pipeline(
    device: &DeviceKey,
    pipeline: CapturePipeline,
    compensation_secs: f64,
) -> MixerResult<SampleBuffer> {
    let mut buffer = SampleBuffer::new(pipeline.capture_rate);
    while let Ok(chunk) = pipeline.rx.try_recv() {
        buffer.extend_from_interleaved(&chunk);
    }

    if buffer.is_empty() {
        return Err(MixerError::DecodeFailed {
            device: device.clone(),
            reason: "no audio captured (stream died or never delivered)".into(),
        });
    }

    let trim = (compensation_secs * pipeline.capture_rate as f64).round() as usize;
    buffer.trim_leading(trim);

    if !pipeline.reference.is_empty() {
        match bleed::remove_bleed(&buffer, &pipeline.reference) {
            Ok(cleaned) => buffer = cleaned,
            Err(MixerError::SampleRateMismatch { recorded, reference }) => {
                // Capture rate differs from engine rate: keep the raw take
                log::warn!(
                    "Skipping bleed removal on {}: capture {}Hz vs reference {}Hz",
                    device,
                    recorded,
                    reference
                );
            }
            Err(e) => return Err(e),
        }
    }

    Ok(buffer)
}
