//! The mixer facade
//!
//! Owns every moving part (transport clock, playback session, scratch
//! controller, stretch node, device pool, recording session, calibrator)
//! and exposes the operations the UI drives, directly or through the
//! command queue. Single-threaded by design: the host render loop calls
//! `tick`/`render`, device callbacks only ever touch lock-free handoffs.
//!
//! Render path: stems and tracks sum at native rate, the stretch node
//! resamples to the output rate when tempo or pitch is engaged, then the
//! calibration click, the recording reference tap and input monitors are
//! applied to the master bus in that order.

use std::sync::Arc;

use crate::capture::backend::{CaptureBackend, CpalCaptureBackend, InputDevice};
use crate::capture::calibrate::LatencyCalibrator;
use crate::capture::pool::DeviceStreamPool;
use crate::capture::session::RecordingSession;
use crate::clock::TransportClock;
use crate::error::{MixerError, MixerResult};
use crate::stretch::StretchNode;
use crate::types::{DeviceKey, Sample, SampleBuffer, StereoFrame, TrackId};

use super::command::EngineCommand;
use super::playback::{PlaybackSession, Stem, Track};
use super::scratch::ScratchController;

pub struct StemMixer {
    sample_rate: u32,
    clock: TransportClock,
    playback: PlaybackSession,
    scratch: ScratchController,
    stretch: StretchNode,
    pool: DeviceStreamPool,
    recorder: RecordingSession,
    calibrator: LatencyCalibrator,
    next_track_id: u64,
    // Reused across renders to keep the hot path allocation-free once warm
    stretch_input: SampleBuffer,
    stretch_output: SampleBuffer,
}

impl StemMixer {
    /// Mixer on the system's audio devices
    pub fn new(sample_rate: u32) -> Self {
        Self::with_backend(sample_rate, Box::new(CpalCaptureBackend::new()))
    }

    /// Mixer over an explicit capture backend (tests inject a mock here)
    pub fn with_backend(sample_rate: u32, backend: Box<dyn CaptureBackend>) -> Self {
        let stretch = StretchNode::new(sample_rate);
        let clock = TransportClock::new(0.0, Box::new(stretch.tap()));
        Self {
            sample_rate,
            clock,
            playback: PlaybackSession::new(sample_rate),
            scratch: ScratchController::new(),
            stretch,
            pool: DeviceStreamPool::new(backend),
            recorder: RecordingSession::new(sample_rate),
            calibrator: LatencyCalibrator::new(sample_rate),
            next_track_id: 0,
            stretch_input: SampleBuffer::new(sample_rate),
            stretch_output: SampleBuffer::new(sample_rate),
        }
    }

    #[cfg(test)]
    fn with_backend_and_config(
        sample_rate: u32,
        backend: Box<dyn CaptureBackend>,
        config_path: std::path::PathBuf,
    ) -> Self {
        let mut mixer = Self::with_backend(sample_rate, backend);
        mixer.calibrator = LatencyCalibrator::with_config_path(sample_rate, config_path);
        mixer
    }

    // --- State views ---

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn position(&self) -> f64 {
        self.clock.position()
    }

    pub fn duration(&self) -> f64 {
        self.clock.duration()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    pub fn is_scratching(&self) -> bool {
        self.scratch.is_active()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn stems(&self) -> &[Stem] {
        self.playback.stems()
    }

    pub fn tracks(&self) -> &[Track] {
        self.playback.tracks()
    }

    pub fn loop_region(&self) -> Option<(f64, f64)> {
        self.playback.loop_region()
    }

    // --- Lanes ---

    /// Add a named stem and grow the song to cover it
    pub fn add_stem(&mut self, name: impl Into<String>, buffer: Arc<SampleBuffer>) {
        self.playback.add_stem(Stem::new(name, buffer));
        self.clock.set_duration(self.playback.duration());
    }

    pub fn add_track(&mut self, name: impl Into<String>) -> TrackId {
        let id = TrackId(self.next_track_id);
        self.next_track_id += 1;
        self.playback.add_track(Track::new(id, name));
        id
    }

    pub fn remove_track(&mut self, id: TrackId) {
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.punch_out(id) {
                log::warn!("remove_track: {}", e);
            }
        }
        self.playback.remove_track(id);
        self.clock.set_duration(self.playback.duration());
    }

    /// Route a track's input to a device, opening its stream eagerly so
    /// access problems surface at selection time, not at record time
    pub fn set_track_device(&mut self, id: TrackId, device: DeviceKey) -> MixerResult<()> {
        if self.playback.track_mut(id).is_none() {
            return Err(MixerError::UnknownTrack(id));
        }
        self.pool.init_stream(&device)?;
        if let Some(track) = self.playback.track_mut(id) {
            track.device = device;
        }
        Ok(())
    }

    // --- Transport ---

    pub fn play(&mut self, now: f64) {
        // Anchor the clock at the start instant so the first tick doesn't
        // swallow the time spent paused
        self.clock.set_position(self.clock.position(), now);
        self.playback.play(&self.clock);
    }

    pub fn pause(&mut self, now: f64) {
        self.playback.pause(&mut self.clock, now);
    }

    pub fn stop(&mut self, now: f64) {
        self.playback.stop(&mut self.clock, now);
    }

    pub fn seek_to(&mut self, position: f64, now: f64) {
        self.stretch.reset();
        self.playback.seek_to(position, &mut self.clock, now);
    }

    pub fn set_loop(&mut self, start: f64, end: f64) {
        self.playback.set_loop(start, end);
    }

    pub fn clear_loop(&mut self) {
        self.playback.clear_loop();
    }

    /// Per-quantum maintenance: advance the transport and finish any
    /// completed calibration run
    pub fn tick(&mut self, now: f64) {
        if !self.scratch.is_active() {
            self.playback.tick(&mut self.clock, now);
        }
        self.calibrator.poll(self.pool.reported_latency());
    }

    // --- Scratch ---

    /// Enter scratch mode: playback halts (sources consumed silently) but
    /// whether it was running is remembered for the exit
    pub fn start_scratch(&mut self, now: f64) {
        if self.scratch.is_active() {
            return;
        }
        let was_playing = self.playback.is_playing();
        self.playback.pause(&mut self.clock, now);
        self.scratch.start(was_playing);
    }

    /// Move the playhead during a scratch. The position always follows;
    /// audibility is throttled inside the controller.
    pub fn scratch_at(&mut self, position: f64, now: f64) {
        if !self.scratch.is_active() {
            return;
        }
        self.clock.set_position(position, now);
        let frame = (self.clock.position() * self.sample_rate as f64).round() as usize;
        self.scratch.request_segment(now, frame, self.sample_rate);
    }

    /// Exit scratch mode, resuming playback from the scratched-to position
    /// if it was running when the scratch began
    pub fn stop_scratch(&mut self, now: f64) {
        if !self.scratch.is_active() {
            return;
        }
        self.clock.set_position(self.clock.position(), now);
        if self.scratch.finish() {
            self.stretch.reset();
            self.playback.play(&self.clock);
        }
    }

    // --- Stem / track mix state ---

    pub fn set_stem_gain(&mut self, name: &str, gain: Sample) {
        self.with_stem(name, |s| s.gain = gain.max(0.0));
    }

    pub fn set_stem_pan(&mut self, name: &str, pan: Sample) {
        self.with_stem(name, |s| s.pan = pan.clamp(-1.0, 1.0));
    }

    pub fn set_stem_muted(&mut self, name: &str, muted: bool) {
        self.with_stem(name, |s| s.muted = muted);
    }

    pub fn set_stem_soloed(&mut self, name: &str, soloed: bool) {
        self.with_stem(name, |s| s.soloed = soloed);
    }

    pub fn set_stem_active(&mut self, name: &str, active: bool) {
        self.with_stem(name, |s| s.active = active);
    }

    fn with_stem(&mut self, name: &str, f: impl FnOnce(&mut Stem)) {
        match self.playback.stem_mut(name) {
            Some(stem) => f(stem),
            None => log::warn!("unknown stem '{}'", name),
        }
    }

    pub fn set_track_volume(&mut self, id: TrackId, volume: Sample) -> MixerResult<()> {
        self.with_track(id, |t| t.volume = volume.max(0.0))
    }

    pub fn set_track_pan(&mut self, id: TrackId, pan: Sample) -> MixerResult<()> {
        self.with_track(id, |t| t.pan = pan.clamp(-1.0, 1.0))
    }

    pub fn set_track_muted(&mut self, id: TrackId, muted: bool) -> MixerResult<()> {
        self.with_track(id, |t| t.muted = muted)
    }

    pub fn set_track_soloed(&mut self, id: TrackId, soloed: bool) -> MixerResult<()> {
        self.with_track(id, |t| t.soloed = soloed)
    }

    fn with_track(&mut self, id: TrackId, f: impl FnOnce(&mut Track)) -> MixerResult<()> {
        let track = self
            .playback
            .track_mut(id)
            .ok_or(MixerError::UnknownTrack(id))?;
        f(track);
        Ok(())
    }

    // --- Tempo / pitch ---

    pub fn set_tempo_ratio(&mut self, ratio: f64) {
        self.stretch.set_ratio(ratio);
    }

    pub fn tempo_ratio(&self) -> f64 {
        self.stretch.ratio()
    }

    pub fn set_pitch_semitones(&mut self, semitones: f64) {
        self.stretch.set_pitch_semitones(semitones);
    }

    // --- Recording ---

    /// Arm a track for the next (or the running) recording session
    pub fn arm_track(&mut self, id: TrackId) -> MixerResult<()> {
        let device = self
            .playback
            .track_mut(id)
            .ok_or(MixerError::UnknownTrack(id))?
            .device
            .clone();

        if self.recorder.is_recording() {
            self.recorder.punch_in(id, &device, &mut self.pool)?;
        }
        self.with_track(id, |t| t.armed = true)
    }

    /// Disarm a track; during a session this punches it out while the
    /// session keeps running for everyone else
    pub fn disarm_track(&mut self, id: TrackId) -> MixerResult<()> {
        if self.recorder.is_recording() {
            self.recorder.punch_out(id)?;
        }
        self.with_track(id, |t| t.armed = false)
    }

    /// Start recording every armed track at `position` (seconds of song
    /// time, normally the current transport position)
    pub fn start_recording(&mut self, position: f64) -> MixerResult<()> {
        let armed: Vec<(TrackId, DeviceKey)> = self
            .playback
            .tracks()
            .iter()
            .filter(|t| t.armed)
            .map(|t| (t.id(), t.device.clone()))
            .collect();
        self.recorder.start(position, &armed, &mut self.pool)
    }

    /// End the session: decode per-device takes, assign each to the
    /// participating tracks on that device, and return the ids that got
    /// audio. Tracks stay armed for a quick re-take.
    pub fn stop_recording(&mut self) -> MixerResult<Vec<TrackId>> {
        let start = self
            .recorder
            .start_offset()
            .ok_or(MixerError::NotRecording)?;
        let compensation = self.calibrator.compensation(self.pool.reported_latency());
        let (takes, participants) = self.recorder.stop(compensation)?;

        let mut updated = Vec::new();
        for take in takes {
            let Ok(buffer) = take.result else { continue };
            for &id in &participants {
                let Some(track) = self.playback.track_mut(id) else {
                    continue;
                };
                if track.device == take.device {
                    track.set_take(buffer.clone(), start);
                    updated.push(id);
                }
            }
        }

        self.clock.set_duration(self.playback.duration());
        Ok(updated)
    }

    /// Peak input level of a device's live stream
    pub fn input_level(&self, device: &DeviceKey) -> Option<Sample> {
        self.pool.input_level(device)
    }

    /// Hear a device's input on the master bus (0.0 mutes, the default)
    pub fn set_monitor_volume(&mut self, device: &DeviceKey, gain: Sample) -> MixerResult<()> {
        self.pool.init_stream(device)?;
        self.pool.set_monitor_volume(device, gain);
        Ok(())
    }

    pub fn input_devices(&self) -> MixerResult<Vec<InputDevice>> {
        self.pool.input_devices()
    }

    /// Run the loopback latency calibration against the default input
    pub fn calibrate_latency(&mut self) -> MixerResult<()> {
        self.calibrator.begin(&mut self.pool)
    }

    pub fn calibrated_latency(&self) -> Option<f64> {
        self.calibrator.calibrated()
    }

    /// Forget the stored calibration, persisting the cleared state
    pub fn reset_calibration(&mut self) -> MixerResult<()> {
        self.calibrator.reset()
    }

    /// Release every capture device
    pub fn teardown(&mut self) {
        self.pool.teardown();
    }

    // --- Export ---

    /// Write a track's take into `dir` as a timestamped WAV and mark the
    /// track saved. Returns the path written.
    pub fn export_track(&mut self, id: TrackId, dir: &std::path::Path) -> MixerResult<std::path::PathBuf> {
        let track = self
            .playback
            .track_mut(id)
            .ok_or(MixerError::UnknownTrack(id))?;
        let buffer = track.buffer().ok_or(MixerError::NoTake(id))?;

        let name = crate::wav::take_filename(&track.name);
        let path = dir.join(&name);
        crate::wav::write_wav(buffer, &path).map_err(|e| MixerError::Export(format!("{:#}", e)))?;

        track.saved = true;
        track.persist_id = Some(name);
        Ok(path)
    }

    // --- Rendering ---

    /// Render one quantum of master-bus audio
    pub fn render(&mut self, output: &mut [StereoFrame]) {
        if self.scratch.is_active() {
            self.scratch.render(&self.playback, output);
        } else {
            let ratio = self.stretch.ratio();
            if (ratio - 1.0).abs() < 1e-9 && self.stretch.pitch_semitones() == 0.0 {
                self.playback.render(output);
            } else {
                // Read `ratio` times as many native frames as we emit
                let needed = ((output.len() as f64) * ratio).round().max(1.0) as usize;
                self.stretch_input.resize(needed);
                self.playback.render(self.stretch_input.as_mut_slice());

                self.stretch_output.resize(output.len());
                self.stretch.process(&self.stretch_input, &mut self.stretch_output);
                output.copy_from_slice(self.stretch_output.as_slice());
            }
        }

        self.calibrator.advance(output);
        self.recorder.tap_reference(output);
        self.pool.mix_monitors(output);
    }

    // --- Command queue ---

    /// Drain and apply pending UI commands. Failures are logged, never
    /// fatal: a stale command (e.g. against a removed track) is dropped.
    pub fn process_commands(&mut self, rx: &mut rtrb::Consumer<EngineCommand>, now: f64) {
        while let Ok(cmd) = rx.pop() {
            if let Err(e) = self.apply(cmd, now) {
                log::warn!("command failed: {}", e);
            }
        }
    }

    fn apply(&mut self, cmd: EngineCommand, now: f64) -> MixerResult<()> {
        use EngineCommand::*;
        match cmd {
            AddStem { name, buffer } => self.add_stem(name, buffer),
            AddTrack { name } => {
                self.add_track(name);
            }
            RemoveTrack { id } => self.remove_track(id),
            SetTrackDevice { id, device } => self.set_track_device(id, device)?,

            Play => self.play(now),
            Pause => self.pause(now),
            Stop => self.stop(now),
            Seek { position } => self.seek_to(position, now),

            ScratchStart => self.start_scratch(now),
            ScratchMove { position } => self.scratch_at(position, now),
            ScratchEnd => self.stop_scratch(now),

            SetLoop { start, end } => self.set_loop(start, end),
            ClearLoop => self.clear_loop(),

            SetStemGain { name, gain } => self.set_stem_gain(&name, gain),
            SetStemPan { name, pan } => self.set_stem_pan(&name, pan),
            SetStemMuted { name, muted } => self.set_stem_muted(&name, muted),
            SetStemSoloed { name, soloed } => self.set_stem_soloed(&name, soloed),
            SetStemActive { name, active } => self.set_stem_active(&name, active),
            SetTrackVolume { id, volume } => self.set_track_volume(id, volume)?,
            SetTrackPan { id, pan } => self.set_track_pan(id, pan)?,
            SetTrackMuted { id, muted } => self.set_track_muted(id, muted)?,
            SetTrackSoloed { id, soloed } => self.set_track_soloed(id, soloed)?,

            SetTempoRatio(ratio) => self.set_tempo_ratio(ratio),
            SetPitchSemitones(semitones) => self.set_pitch_semitones(semitones),

            ArmTrack { id } => self.arm_track(id)?,
            DisarmTrack { id } => self.disarm_track(id)?,
            StartRecording => self.start_recording(self.clock.position())?,
            StopRecording => {
                self.stop_recording()?;
            }
            CalibrateLatency => self.calibrate_latency()?,
            ResetCalibration => self.reset_calibration()?,
            SetMonitorVolume { device, gain } => self.set_monitor_volume(&device, gain)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::super::command::command_channel;
    use super::*;
    use crate::capture::pool::mock::{MockBackend, MockFeed};

    const SR: u32 = 48000;

    fn tone(secs: f64, value: Sample) -> Arc<SampleBuffer> {
        let frames = vec![StereoFrame::mono(value); (secs * SR as f64) as usize];
        Arc::new(SampleBuffer::from_frames(frames, SR))
    }

    fn mixer() -> (StemMixer, Rc<RefCell<Vec<MockFeed>>>, tempfile::TempDir) {
        let mut backend = MockBackend::new(SR);
        // No calibration on file and no fallback trim: takes keep every frame
        backend.reported_latency = 0.0;
        let feeds = Rc::clone(&backend.opened);
        let dir = tempfile::tempdir().unwrap();
        let m = StemMixer::with_backend_and_config(
            SR,
            Box::new(backend),
            dir.path().join("calibration.yaml"),
        );
        (m, feeds, dir)
    }

    #[test]
    fn test_transport_flow() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("vocals", tone(5.0, 0.25));
        m.add_stem("drums", tone(5.0, 0.5));
        assert_eq!(m.duration(), 5.0);

        m.tick(0.0);
        m.play(0.0);
        assert!(m.is_playing());

        m.tick(2.0);
        assert!((m.position() - 2.0).abs() < 1e-9);

        m.seek_to(4.5, 2.0);
        assert!(m.is_playing());

        // Past the end: the transport halts and rewinds
        m.tick(3.0);
        assert!(!m.is_playing());
        assert_eq!(m.position(), 0.0);
    }

    #[test]
    fn test_render_sums_stems() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("a", tone(1.0, 0.2));
        m.add_stem("b", tone(1.0, 0.3));
        m.play(0.0);

        let mut out = vec![StereoFrame::silence(); 64];
        m.render(&mut out);
        assert!((out[0].left - 0.5).abs() < 1e-6);

        m.set_stem_muted("a", true);
        m.render(&mut out);
        assert!((out[0].left - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_stretch_path_keeps_output_shape() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("a", tone(4.0, 0.3));
        m.set_tempo_ratio(1.25);
        m.play(0.0);

        let mut out = vec![StereoFrame::silence(); 512];
        m.render(&mut out);
        // Clock advances 1.25x real time through the tap
        m.tick(0.0);
        m.tick(2.0);
        assert!((m.position() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_scratch_pauses_and_resumes() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("a", tone(5.0, 0.4));
        m.tick(0.0);
        m.play(0.0);

        m.start_scratch(1.0);
        assert!(m.is_scratching());
        assert!(!m.is_playing());

        m.scratch_at(3.0, 1.05);
        assert!((m.position() - 3.0).abs() < 1e-9);

        let mut out = vec![StereoFrame::silence(); 64];
        m.render(&mut out);
        assert!((out[0].left - 0.4).abs() < 1e-6);

        m.stop_scratch(1.2);
        assert!(!m.is_scratching());
        assert!(m.is_playing());
        assert!((m.position() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_scratch_from_pause_stays_paused() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("a", tone(5.0, 0.4));
        m.start_scratch(0.0);
        m.stop_scratch(0.5);
        assert!(!m.is_playing());
    }

    #[test]
    fn test_recording_flow_shared_device() {
        let (mut m, feeds, _dir) = mixer();
        m.add_stem("guide", tone(4.0, 0.1));

        let t1 = m.add_track("voc 1");
        let t2 = m.add_track("voc 2");
        m.set_track_device(t1, DeviceKey::Id("usb".into())).unwrap();
        m.set_track_device(t2, DeviceKey::Id("usb".into())).unwrap();
        m.arm_track(t1).unwrap();
        m.arm_track(t2).unwrap();

        m.tick(0.0);
        m.seek_to(1.0, 0.0);
        m.start_recording(1.0).unwrap();
        assert!(m.is_recording());

        // One stream for the shared device (opened at selection time)
        assert_eq!(feeds.borrow().len(), 1);

        feeds.borrow()[0].push(vec![0.5; 2 * SR as usize]);
        let updated = m.stop_recording().unwrap();
        assert_eq!(updated.len(), 2);

        // Both tracks carry the same take, offset at the session start
        for id in [t1, t2] {
            let track = m.tracks().iter().find(|t| t.id() == id).unwrap();
            assert_eq!(track.start_offset, 1.0);
            assert_eq!(track.buffer().unwrap().len(), SR as usize);
            assert!(track.armed, "tracks stay armed for a re-take");
        }

        // The song now extends to cover the take (1.0 + 1.0s)
        assert!((m.duration() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_recording_requires_armed_tracks() {
        let (mut m, _, _dir) = mixer();
        m.add_track("unarmed");
        assert!(matches!(
            m.start_recording(0.0),
            Err(MixerError::NoArmedTracks)
        ));
    }

    #[test]
    fn test_punch_in_mid_session() {
        let (mut m, feeds, _dir) = mixer();
        let t1 = m.add_track("first");
        m.arm_track(t1).unwrap();
        m.start_recording(0.0).unwrap();

        let t2 = m.add_track("late");
        m.set_track_device(t2, DeviceKey::Id("late-mic".into()))
            .unwrap();
        m.arm_track(t2).unwrap();
        assert_eq!(feeds.borrow().len(), 2);

        feeds.borrow()[0].push(vec![0.2; 200]);
        feeds.borrow()[1].push(vec![0.3; 400]);
        let updated = m.stop_recording().unwrap();
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn test_disarm_punches_out_but_session_continues() {
        let (mut m, feeds, _dir) = mixer();
        let t1 = m.add_track("a");
        let t2 = m.add_track("b");
        m.set_track_device(t2, DeviceKey::Id("other".into())).unwrap();
        m.arm_track(t1).unwrap();
        m.arm_track(t2).unwrap();
        m.start_recording(0.0).unwrap();

        m.disarm_track(t1).unwrap();
        assert!(m.is_recording());

        feeds.borrow()[0].push(vec![0.1; 100]);
        feeds.borrow()[1].push(vec![0.2; 100]);
        let updated = m.stop_recording().unwrap();
        // The punched-out participant still receives its device's take
        assert!(updated.contains(&t1) && updated.contains(&t2));
    }

    #[test]
    fn test_input_level_and_monitoring() {
        let (mut m, feeds, _dir) = mixer();
        let key = DeviceKey::Default;
        assert_eq!(m.input_level(&key), None);

        m.set_monitor_volume(&key, 1.0).unwrap();
        feeds.borrow()[0].push(vec![0.6, -0.8].repeat(4));
        assert_eq!(m.input_level(&key), Some(0.8));

        // With nothing playing, the master bus carries the monitored input
        let mut out = vec![StereoFrame::silence(); 2];
        m.render(&mut out);
        assert!((out[0].left - 0.6).abs() < 1e-6);
        assert!((out[0].right + 0.8).abs() < 1e-6);

        // Monitoring off: the bus goes quiet but the ring keeps draining
        m.set_monitor_volume(&key, 0.0).unwrap();
        m.render(&mut out);
        assert_eq!(out[0].left, 0.0);
    }

    #[test]
    fn test_command_queue_drives_mixer() {
        let (mut m, _, _dir) = mixer();
        m.add_stem("a", tone(5.0, 0.25));
        let (mut tx, mut rx) = command_channel();

        tx.push(EngineCommand::Play).unwrap();
        tx.push(EngineCommand::Seek { position: 2.0 }).unwrap();
        tx.push(EngineCommand::SetStemGain {
            name: "a".into(),
            gain: 0.5,
        })
        .unwrap();

        m.process_commands(&mut rx, 0.0);
        assert!(m.is_playing());
        assert!((m.position() - 2.0).abs() < 1e-9);
        assert_eq!(m.stems()[0].gain, 0.5);
    }

    #[test]
    fn test_stale_command_dropped_not_fatal() {
        let (mut m, _, _dir) = mixer();
        let (mut tx, mut rx) = command_channel();
        tx.push(EngineCommand::ArmTrack { id: TrackId(99) }).unwrap();
        tx.push(EngineCommand::Play).unwrap();

        m.process_commands(&mut rx, 0.0);
        // The bad command is logged and skipped; the next one still runs
        assert!(m.is_playing());
    }

    #[test]
    fn test_export_track_writes_wav_and_marks_saved() {
        let (mut m, feeds, _dir) = mixer();
        let id = m.add_track("Vocals");
        m.arm_track(id).unwrap();
        m.start_recording(0.0).unwrap();
        feeds.borrow()[0].push(vec![0.25; 400]);
        m.stop_recording().unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let path = m.export_track(id, out_dir.path()).unwrap();
        assert!(path.exists());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);

        let track = m.tracks().iter().find(|t| t.id() == id).unwrap();
        assert!(track.saved);
        assert!(track.persist_id.is_some());
    }

    #[test]
    fn test_export_without_take_errors() {
        let (mut m, _, _dir) = mixer();
        let id = m.add_track("empty");
        let out_dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            m.export_track(id, out_dir.path()),
            Err(MixerError::NoTake(_))
        ));
    }

    #[test]
    fn test_unknown_track_operations_error() {
        let (mut m, _, _dir) = mixer();
        assert!(matches!(
            m.set_track_volume(TrackId(7), 0.5),
            Err(MixerError::UnknownTrack(TrackId(7)))
        ));
        assert!(matches!(
            m.set_track_device(TrackId(7), DeviceKey::Default),
            Err(MixerError::UnknownTrack(TrackId(7)))
        ));
    }
}
