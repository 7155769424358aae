//! Playback session - per-stem sources, lock-step start, loop window
//!
//! Owns the stems and the recorded tracks ("lanes") and their single-use
//! playback sources. Sources are plain read cursors created in lock-step
//! from one clock reading at every transport transition and consumed by any
//! deliberate stop - a consumed source can never report "ended naturally",
//! which removes the stop-vs-ended callback race by construction.

use std::sync::Arc;

use crate::clock::TransportClock;
use crate::types::{DeviceKey, Sample, SampleBuffer, StereoFrame, TrackId};

/// Playback source for one lane
///
/// Single-use: created on every play/seek/scratch-exit, destroyed (moved
/// out of the enum) on every deliberate stop. At most one per lane.
#[derive(Debug)]
pub struct LaneSource {
    /// Read cursor in frames. Negative while waiting for a scheduled
    /// start (a track whose timeline offset lies ahead of the transport).
    cursor: i64,
    /// Reached the end of its buffer
    ended: bool,
}

/// Tagged source slot: a gain/pan chain without a source is unrepresentable
#[derive(Debug, Default)]
pub enum SourceState {
    #[default]
    Idle,
    Playing(LaneSource),
}

impl SourceState {
    fn is_live(&self) -> bool {
        matches!(self, SourceState::Playing(s) if !s.ended)
    }
}

/// One pre-mixed instrument stem
pub struct Stem {
    name: String,
    buffer: Arc<SampleBuffer>,
    pub gain: Sample,
    pub pan: Sample,
    pub muted: bool,
    pub soloed: bool,
    /// Participates in playback at all
    pub active: bool,
    source: SourceState,
}

impl Stem {
    pub fn new(name: impl Into<String>, buffer: Arc<SampleBuffer>) -> Self {
        Self {
            name: name.into(),
            buffer,
            gain: 1.0,
            pan: 0.0,
            muted: false,
            soloed: false,
            active: true,
            source: SourceState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }

    pub fn has_live_source(&self) -> bool {
        self.source.is_live()
    }
}

/// One armed track's captured (or pending) take
pub struct Track {
    id: TrackId,
    pub name: String,
    /// None until a take has been captured
    buffer: Option<SampleBuffer>,
    /// Timeline start offset in seconds
    pub start_offset: f64,
    pub device: DeviceKey,
    pub armed: bool,
    pub muted: bool,
    pub soloed: bool,
    pub volume: Sample,
    pub pan: Sample,
    /// Persisted by the export/persistence collaborator
    pub saved: bool,
    pub persist_id: Option<String>,
    source: SourceState,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            buffer: None,
            start_offset: 0.0,
            device: DeviceKey::Default,
            armed: false,
            muted: false,
            soloed: false,
            volume: 1.0,
            pan: 0.0,
            saved: false,
            persist_id: None,
            source: SourceState::Idle,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn buffer(&self) -> Option<&SampleBuffer> {
        self.buffer.as_ref()
    }

    /// Install a freshly captured take, replacing any previous one.
    /// The old source (if any) is discarded with the old buffer.
    pub fn set_take(&mut self, buffer: SampleBuffer, start_offset: f64) {
        self.buffer = Some(buffer);
        self.start_offset = start_offset;
        self.saved = false;
        self.source = SourceState::Idle;
    }

    pub fn has_live_source(&self) -> bool {
        self.source.is_live()
    }
}

/// Balance-style pan gains for a stereo lane (-1 = hard left, 1 = hard right)
#[inline]
fn pan_gains(pan: Sample) -> (Sample, Sample) {
    let pan = pan.clamp(-1.0, 1.0);
    if pan <= 0.0 {
        (1.0, 1.0 + pan)
    } else {
        (1.0 - pan, 1.0)
    }
}

/// Whether a lane is forced silent under the current mute/solo state
#[inline]
fn silenced(muted: bool, soloed: bool, any_solo: bool) -> bool {
    if any_solo {
        !soloed
    } else {
        muted
    }
}

/// The synchronized playback transport over all lanes
pub struct PlaybackSession {
    sample_rate: u32,
    stems: Vec<Stem>,
    tracks: Vec<Track>,
    playing: bool,
    /// Loop window [start, end) in seconds
    loop_region: Option<(f64, f64)>,
}

impl PlaybackSession {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            stems: Vec::new(),
            tracks: Vec::new(),
            playing: false,
            loop_region: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn loop_region(&self) -> Option<(f64, f64)> {
        self.loop_region
    }

    // --- Lane management ---

    pub fn add_stem(&mut self, stem: Stem) {
        if self.stems.iter().any(|s| s.name == stem.name) {
            log::warn!("add_stem: duplicate stem name '{}', replacing", stem.name);
            self.stems.retain(|s| s.name != stem.name);
        }
        self.stems.push(stem);
    }

    pub fn stems(&self) -> &[Stem] {
        &self.stems
    }

    pub fn stem_mut(&mut self, name: &str) -> Option<&mut Stem> {
        self.stems.iter_mut().find(|s| s.name == name)
    }

    pub fn add_track(&mut self, track: Track) {
        self.tracks.push(track);
    }

    pub fn remove_track(&mut self, id: TrackId) {
        self.tracks.retain(|t| t.id != id);
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Longest lane duration in seconds (stem buffers plus offset takes)
    pub fn duration(&self) -> f64 {
        let stems = self
            .stems
            .iter()
            .map(|s| s.buffer.duration_secs())
            .fold(0.0, f64::max);
        let tracks = self
            .tracks
            .iter()
            .filter_map(|t| t.buffer.as_ref().map(|b| t.start_offset + b.duration_secs()))
            .fold(0.0, f64::max);
        stems.max(tracks)
    }

    // --- Transport ---

    /// Start playback from the clock's current position.
    ///
    /// Any stray live source is discarded first (idempotent cleanup), then
    /// one fresh source per buffered lane is created from a single clock
    /// reading so no lane starts skewed against another. Inactive stems get
    /// a source too; like mute, `active` gates audibility at render time so
    /// toggling it mid-play takes effect immediately and in sync.
    pub fn play(&mut self, clock: &TransportClock) {
        self.discard_sources();

        let offset = (clock.position() * self.sample_rate as f64).round() as i64;

        for stem in &mut self.stems {
            if !stem.buffer.is_empty() {
                stem.source = SourceState::Playing(LaneSource {
                    cursor: offset,
                    ended: offset >= stem.buffer.len() as i64,
                });
            }
        }
        for track in &mut self.tracks {
            if let Some(buffer) = &track.buffer {
                if !buffer.is_empty() {
                    let start = (track.start_offset * self.sample_rate as f64).round() as i64;
                    track.source = SourceState::Playing(LaneSource {
                        cursor: offset - start,
                        ended: offset - start >= buffer.len() as i64,
                    });
                }
            }
        }

        self.playing = true;
    }

    /// Pause: snapshot the clock, consume every live source
    pub fn pause(&mut self, clock: &mut TransportClock, now: f64) {
        if self.playing {
            clock.tick(now);
        }
        self.discard_sources();
        self.playing = false;
    }

    /// Stop: pause and rewind to the start of the song
    pub fn stop(&mut self, clock: &mut TransportClock, now: f64) {
        self.discard_sources();
        self.playing = false;
        clock.set_position(0.0, now);
    }

    /// Jump the transport. If playback was active, sources are recreated
    /// immediately from the new position - the old ones are consumed first,
    /// so old-position and new-position audio can never overlap.
    pub fn seek_to(&mut self, position: f64, clock: &mut TransportClock, now: f64) {
        self.discard_sources();
        clock.set_position(position, now);
        if self.playing {
            self.play(clock);
        }
    }

    /// Set the loop window [start, end). Degenerate windows are ignored.
    pub fn set_loop(&mut self, start: f64, end: f64) {
        if end > start && start >= 0.0 {
            self.loop_region = Some((start, end));
        } else {
            log::warn!("set_loop: ignoring degenerate window [{start}, {end})");
        }
    }

    pub fn clear_loop(&mut self) {
        self.loop_region = None;
    }

    /// Per-tick transport maintenance: advance the clock, wrap the loop,
    /// stop at end of song. The clock is read once here and the same value
    /// governs every lane until the next tick.
    pub fn tick(&mut self, clock: &mut TransportClock, now: f64) {
        if !self.playing {
            return;
        }
        clock.tick(now);

        if let Some((start, end)) = self.loop_region {
            if clock.position() >= end {
                self.seek_to(start, clock, now);
                return;
            }
        }

        if clock.at_end() || self.all_sources_ended() {
            self.stop(clock, now);
        }
    }

    fn all_sources_ended(&self) -> bool {
        let mut saw_source = false;
        for stem in &self.stems {
            if let SourceState::Playing(s) = &stem.source {
                saw_source = true;
                if !s.ended {
                    return false;
                }
            }
        }
        for track in &self.tracks {
            if let SourceState::Playing(s) = &track.source {
                saw_source = true;
                if !s.ended {
                    return false;
                }
            }
        }
        saw_source
    }

    /// Consume every live source. No "ended" state can be observed for a
    /// source that was deliberately stopped.
    pub fn discard_sources(&mut self) {
        for stem in &mut self.stems {
            stem.source = SourceState::Idle;
        }
        for track in &mut self.tracks {
            track.source = SourceState::Idle;
        }
    }

    fn any_soloed(&self) -> bool {
        self.stems.iter().any(|s| s.soloed) || self.tracks.iter().any(|t| t.soloed)
    }

    // --- Audio rendering ---

    /// Sum all live lanes into `output` at native rate, advancing cursors.
    /// Tempo processing happens downstream of this call.
    pub fn render(&mut self, output: &mut [StereoFrame]) {
        output.fill(StereoFrame::silence());
        if !self.playing {
            return;
        }

        let any_solo = self.any_soloed();

        for stem in &mut self.stems {
            if let SourceState::Playing(source) = &mut stem.source {
                let quiet = !stem.active || silenced(stem.muted, stem.soloed, any_solo);
                render_lane(stem.buffer.as_slice(), source, stem.gain, stem.pan, quiet, output);
            }
        }
        for track in &mut self.tracks {
            if let (SourceState::Playing(source), Some(buffer)) =
                (&mut track.source, &track.buffer)
            {
                let quiet = silenced(track.muted, track.soloed, any_solo);
                render_lane(buffer.as_slice(), source, track.volume, track.pan, quiet, output);
            }
        }
    }

    /// Read a raw preview mix at an arbitrary frame without touching any
    /// source (scratch segments use this; it bypasses tempo processing).
    pub fn render_preview(&self, start_frame: usize, output: &mut [StereoFrame]) {
        output.fill(StereoFrame::silence());
        let any_solo = self.any_soloed();

        for stem in &self.stems {
            if !stem.active || silenced(stem.muted, stem.soloed, any_solo) {
                continue;
            }
            mix_segment(stem.buffer.as_slice(), start_frame as i64, stem.gain, stem.pan, output);
        }
        for track in &self.tracks {
            if silenced(track.muted, track.soloed, any_solo) {
                continue;
            }
            if let Some(buffer) = &track.buffer {
                let start = (track.start_offset * self.sample_rate as f64).round() as i64;
                mix_segment(buffer.as_slice(), start_frame as i64 - start, track.volume, track.pan, output);
            }
        }
    }
}

/// Advance one lane's source over `output.len()` frames, mixing into the sum.
/// A silenced lane still advances (staying in sync for un-mute mid-play).
fn render_lane(
    buffer: &[StereoFrame],
    source: &mut LaneSource,
    gain: Sample,
    pan: Sample,
    quiet: bool,
    output: &mut [StereoFrame],
) {
    let (gl, gr) = pan_gains(pan);
    let len = buffer.len() as i64;

    for out in output.iter_mut() {
        if !quiet && source.cursor >= 0 && source.cursor < len {
            let frame = buffer[source.cursor as usize];
            out.left += frame.left * gain * gl;
            out.right += frame.right * gain * gr;
        }
        source.cursor += 1;
    }

    if source.cursor >= len {
        source.ended = true;
    }
}

/// Mix a stateless read starting at `from` (may be negative) into the sum
fn mix_segment(
    buffer: &[StereoFrame],
    from: i64,
    gain: Sample,
    pan: Sample,
    output: &mut [StereoFrame],
) {
    let (gl, gr) = pan_gains(pan);
    let len = buffer.len() as i64;

    for (i, out) in output.iter_mut().enumerate() {
        let pos = from + i as i64;
        if pos >= 0 && pos < len {
            let frame = buffer[pos as usize];
            out.left += frame.left * gain * gl;
            out.right += frame.right * gain * gr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stem_with(name: &str, secs: f64, value: Sample) -> Stem {
        let sr = 48000;
        let frames = vec![StereoFrame::mono(value); (secs * sr as f64) as usize];
        Stem::new(name, Arc::new(SampleBuffer::from_frames(frames, sr)))
    }

    fn session_with_two_stems() -> (PlaybackSession, TransportClock) {
        let mut session = PlaybackSession::new(48000);
        session.add_stem(stem_with("vocals", 5.0, 0.25));
        session.add_stem(stem_with("drums", 5.0, 0.5));
        let clock = TransportClock::unity(session.duration());
        (session, clock)
    }

    #[test]
    fn test_play_creates_one_source_per_stem() {
        let (mut session, clock) = session_with_two_stems();
        session.play(&clock);
        assert!(session.stems().iter().all(|s| s.has_live_source()));

        // Repeated play never stacks a second source on a stem
        session.play(&clock);
        session.play(&clock);
        assert!(session.stems().iter().all(|s| s.has_live_source()));
    }

    #[test]
    fn test_pause_consumes_sources() {
        let (mut session, mut clock) = session_with_two_stems();
        session.play(&clock);
        session.pause(&mut clock, 1.0);
        assert!(!session.is_playing());
        assert!(session.stems().iter().all(|s| !s.has_live_source()));
    }

    #[test]
    fn test_lanes_start_from_one_offset() {
        let (mut session, mut clock) = session_with_two_stems();
        clock.set_position(2.0, 0.0);
        session.play(&clock);

        let mut out = vec![StereoFrame::silence(); 64];
        session.render(&mut out);
        // Both stems audible, summed: 0.25 + 0.5
        assert!((out[0].left - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_mute_and_solo_policy() {
        let (mut session, clock) = session_with_two_stems();
        session.play(&clock);

        // Muting drops only the muted stem
        session.stem_mut("vocals").unwrap().muted = true;
        let mut out = vec![StereoFrame::silence(); 16];
        session.render(&mut out);
        assert!((out[0].left - 0.5).abs() < 1e-6);

        // A solo overrides mute flags on every non-soloed lane
        session.stem_mut("vocals").unwrap().muted = false;
        session.stem_mut("vocals").unwrap().soloed = true;
        session.render(&mut out);
        assert!((out[0].left - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_stem_active_toggles_mid_play() {
        let (mut session, clock) = session_with_two_stems();
        session.stem_mut("drums").unwrap().active = false;
        session.play(&clock);

        // The inactive stem is silent but its cursor keeps pace
        let mut out = vec![StereoFrame::silence(); 64];
        session.render(&mut out);
        assert!((out[0].left - 0.25).abs() < 1e-6);

        // Activating mid-play is audible on the very next quantum
        session.stem_mut("drums").unwrap().active = true;
        session.render(&mut out);
        assert!((out[0].left - 0.75).abs() < 1e-6);

        // And deactivating mid-play silences just as immediately
        session.stem_mut("drums").unwrap().active = false;
        session.render(&mut out);
        assert!((out[0].left - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_loop_wraps_to_start() {
        let (mut session, mut clock) = session_with_two_stems();
        session.set_loop(1.0, 2.0);
        clock.set_position(1.5, 0.0);
        session.play(&clock);

        // Cross the loop end: next observable position is loopStart
        session.tick(&mut clock, 0.6);
        assert!((clock.position() - 1.0).abs() < 1e-9);
        assert!(session.is_playing());
        assert!(session.stems().iter().all(|s| s.has_live_source()));
    }

    #[test]
    fn test_scenario_play_seek_end_stop() {
        let (mut session, mut clock) = session_with_two_stems();
        clock.tick(0.0);
        session.play(&clock);

        // 2 simulated seconds at unity tempo
        session.tick(&mut clock, 2.0);
        assert!((clock.position() - 2.0).abs() < 1e-9);

        session.seek_to(4.5, &mut clock, 2.0);
        assert!(session.is_playing());

        // 1 more second pushes past the 5s duration: transport halts, rewinds
        session.tick(&mut clock, 3.0);
        assert!(!session.is_playing());
        assert_eq!(clock.position(), 0.0);
    }

    #[test]
    fn test_seek_never_overlaps_sources() {
        let (mut session, mut clock) = session_with_two_stems();
        session.play(&clock);
        session.seek_to(3.0, &mut clock, 0.5);
        // Still exactly one live source per stem
        for stem in session.stems() {
            assert!(stem.has_live_source());
        }
    }

    #[test]
    fn test_track_scheduled_start() {
        let mut session = PlaybackSession::new(48000);
        session.add_stem(stem_with("guide", 4.0, 0.0));
        let mut track = Track::new(TrackId(1), "take 1");
        track.set_take(
            SampleBuffer::from_frames(vec![StereoFrame::mono(1.0); 48000], 48000),
            2.0,
        );
        session.add_track(track);

        let clock = TransportClock::unity(session.duration());
        session.play(&clock);

        // One second of render from t=0: the take starts at 2.0s, so silence
        let mut out = vec![StereoFrame::silence(); 48000];
        session.render(&mut out);
        assert_eq!(out[47999].left, 0.0);

        // Second second: still before the take
        session.render(&mut out);
        assert_eq!(out[47999].left, 0.0);

        // Third second: the take is audible
        session.render(&mut out);
        assert_eq!(out[0].left, 1.0);
    }

    #[test]
    fn test_natural_end_rewinds() {
        let mut session = PlaybackSession::new(48000);
        session.add_stem(stem_with("only", 0.01, 0.5));
        let mut clock = TransportClock::unity(10.0); // clock bound larger than audio
        clock.tick(0.0);
        session.play(&clock);

        // Render past the end of the only buffer
        let mut out = vec![StereoFrame::silence(); 1024];
        session.render(&mut out);
        session.tick(&mut clock, 0.05);

        assert!(!session.is_playing());
        assert_eq!(clock.position(), 0.0);
    }

    #[test]
    fn test_pan_law() {
        assert_eq!(pan_gains(0.0), (1.0, 1.0));
        assert_eq!(pan_gains(-1.0), (1.0, 0.0));
        assert_eq!(pan_gains(1.0), (0.0, 1.0));
    }
}
