//! Session engine
//!
//! Owns the processing context and one AudioNode per slot, and is the
//! only thing the outside world talks to. Control methods take
//! `&mut self`, so every graph mutation happens on the caller's thread
//! in call order. The one piece of real asynchrony is music loading,
//! which runs on the background loader and is picked up by `tick`.
//!
//! ## Node lifecycle
//!
//! Selecting a track only records it. Nodes are built on the next tick
//! once a context exists: binaural pairs immediately, music nodes when
//! their asset has finished loading. Replacing a track tears the old
//! node down before anything new can be installed, so a slot never holds
//! two nodes.
//!
//! `stop` pauses music (keeping its position) and suspends the context,
//! which silences the oscillators without stopping them. Oscillators
//! cannot be restarted, so this is the only way to pause a binaural pair
//! and still resume it.

use std::time::Duration;

use crate::audio::{AudioBackend, AudioContext, ContextId, Graph, RecordedBuffer};
use crate::config::EngineConfig;
use crate::error::{ContextUnavailable, DecodeError, MicrophoneUnavailable, TrackLoadError};
use crate::loader::{AssetLoader, LoadOutcome, LoadResult, LoadToken};
use crate::music::MusicNode;
use crate::synth::{BinauralPair, OscillatorState, Waveform};
use crate::timer::SessionTimer;
use crate::track::{MixSettings, Slot, Track, VolumeSlot};
use crate::voice::{VoiceRecorder, VoiceState};

/// How often `settle` wakes up to service the recorder while waiting
const SETTLE_POLL: Duration = Duration::from_millis(50);

/// Something the caller may want to react to
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A node for the slot is installed and playable
    TrackReady { slot: Slot, track_id: String },
    /// The slot is left empty; `set_track` again to retry
    TrackLoadFailed {
        slot: Slot,
        track_id: String,
        error: TrackLoadError,
    },
    RecordingComplete(RecordedBuffer),
    RecordingFailed(DecodeError),
}

type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

#[derive(Default)]
struct MusicSlot {
    track: Option<Track>,
    node: Option<MusicNode>,
    /// Token of the load in flight
    pending: Option<LoadToken>,
    /// The last load of `track` failed; wait for another `set_track`
    failed: bool,
}

#[derive(Default)]
struct BinauralSlot {
    track: Option<Track>,
    node: Option<BinauralPair>,
}

pub struct SessionEngine {
    config: EngineConfig,
    backend: Box<dyn AudioBackend>,
    context: Option<AudioContext>,
    active: bool,
    mix: MixSettings,
    music: MusicSlot,
    binaural: BinauralSlot,
    voice: VoiceRecorder,
    loader: AssetLoader,
    next_generation: u64,
    waveform: Waveform,
    timer: SessionTimer,
    events: Vec<EngineEvent>,
    listener: Option<Listener>,
}

impl SessionEngine {
    /// Create an idle engine; no audio resources are acquired until `start`
    pub fn new(config: EngineConfig, backend: Box<dyn AudioBackend>) -> Self {
        let config = config.sanitized();
        let mix = config.default_mix;
        Self {
            loader: AssetLoader::spawn(config.asset_root.clone()),
            voice: VoiceRecorder::new(mix.recording_volume),
            config,
            backend,
            context: None,
            active: false,
            mix,
            music: MusicSlot::default(),
            binaural: BinauralSlot::default(),
            next_generation: 0,
            waveform: Waveform::Sine,
            timer: SessionTimer::default(),
            events: Vec::new(),
            listener: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the listener that receives every event as it happens
    pub fn on_event<F>(&mut self, listener: F)
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    /// Start or resume the session
    ///
    /// Creates the processing context on first use and resumes it
    /// afterwards. Safe to call while already running. On failure nothing
    /// changes and the caller may simply try again.
    pub fn start(&mut self) -> Result<(), ContextUnavailable> {
        match &mut self.context {
            Some(context) => context.resume()?,
            None => {
                let context = AudioContext::create(
                    self.backend.as_ref(),
                    self.config.output_device.as_deref(),
                    self.config.gain_ramp_ms,
                )
                .map_err(|e| {
                    log::error!("Failed to create audio context: {}", e);
                    e
                })?;
                self.context = Some(context);
            }
        }

        if !self.active {
            log::info!("Session started");
        }
        self.active = true;
        self.timer.resume();
        self.pump();
        Ok(())
    }

    /// Pause the session, keeping the context and every node
    pub fn stop(&mut self) {
        if self.active {
            log::info!("Session stopped");
        }
        self.active = false;
        self.timer.pause();
        self.apply_play_state();
        if let Some(context) = &mut self.context {
            context.suspend();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Tear everything down and release all hardware
    ///
    /// The engine stays usable; a later `start` builds a fresh context.
    pub fn dispose(&mut self) {
        self.active = false;
        self.timer.pause();

        if let Some(token) = self.music.pending.take() {
            token.cancel();
        }

        let mut graph = self.context.as_ref().map(|c| c.graph());
        self.voice.dispose(graph.as_deref_mut());
        if let Some(graph) = graph.as_deref_mut() {
            if let Some(node) = self.music.node.take() {
                node.teardown(graph);
            }
            if let Some(pair) = self.binaural.node.take() {
                pair.teardown(graph);
            }
        }
        drop(graph);
        self.music.node = None;
        self.binaural.node = None;

        if let Some(context) = self.context.take() {
            log::info!("Audio context {:?} closed", context.id());
        }
    }

    /// Bind a track to a slot
    ///
    /// The previous node of the slot is torn down right away; the new one
    /// is built on the next tick. Re-selecting the track that is already
    /// bound is a no-op unless its last load failed.
    pub fn set_track(&mut self, slot: Slot, track: Track) {
        if let Err(error) = self.check_track(slot, &track) {
            log::error!("Rejected track for {} slot: {}", slot, error);
            self.emit(EngineEvent::TrackLoadFailed {
                slot,
                track_id: track.id.clone(),
                error,
            });
            return;
        }

        match slot {
            Slot::Music => {
                let same = self.music.track.as_ref().is_some_and(|t| t.id == track.id);
                if same && !self.music.failed {
                    return;
                }
                self.clear_music();
                log::info!("Music track set to '{}'", track.id);
                self.music.track = Some(track);
            }
            Slot::Binaural => {
                let same = self.binaural.track.as_ref().is_some_and(|t| t.id == track.id);
                if same {
                    return;
                }
                self.clear_binaural();
                log::info!("Binaural track set to '{}'", track.id);
                self.binaural.track = Some(track);
            }
        }
        self.pump();
    }

    pub fn track(&self, slot: Slot) -> Option<&Track> {
        match slot {
            Slot::Music => self.music.track.as_ref(),
            Slot::Binaural => self.binaural.track.as_ref(),
        }
    }

    /// Set a slot's volume, live if its bus exists, and remember it
    pub fn set_volume(&mut self, slot: VolumeSlot, value: f32) {
        let value = self.mix.set(slot, value);
        match slot {
            VolumeSlot::Music => {
                if let Some(node) = &self.music.node {
                    node.bus().set_value(value);
                }
            }
            VolumeSlot::Binaural => {
                if let Some(pair) = &self.binaural.node {
                    pair.bus().set_value(value);
                }
            }
            VolumeSlot::Recording => self.voice.set_volume(value),
        }
    }

    pub fn mix(&self) -> MixSettings {
        self.mix
    }

    /// Waveform for binaural pairs built from now on
    pub fn set_binaural_waveform(&mut self, waveform: Waveform) {
        self.waveform = waveform;
    }

    /// Open the microphone and start recording
    ///
    /// Does not need a running session. A refusal leaves every other
    /// part of the engine untouched.
    pub fn record_voice(&mut self) -> Result<(), MicrophoneUnavailable> {
        self.voice
            .start_recording(
                self.backend.as_ref(),
                self.config.input_device.as_deref(),
                self.config.capture_seconds,
            )
            .map_err(|e| {
                log::error!("Failed to start recording: {}", e);
                e
            })
    }

    /// Finish recording and keep the decoded clip for playback
    pub fn stop_recording_voice(&mut self) -> Result<RecordedBuffer, DecodeError> {
        let mut graph = self.context.as_ref().map(|c| c.graph());
        let result = self.voice.stop_recording(graph.as_deref_mut());
        drop(graph);

        match &result {
            Ok(buffer) => self.emit(EngineEvent::RecordingComplete(buffer.clone())),
            Err(DecodeError::NotRecording) => log::warn!("Not recording"),
            Err(e) => self.emit(EngineEvent::RecordingFailed(e.clone())),
        }
        result
    }

    /// Play the recorded clip, replacing any playback already running
    pub fn play_voice(&mut self, looped: bool) {
        match &self.context {
            Some(context) => {
                self.voice.play(&mut context.graph(), looped);
            }
            None => log::warn!("Cannot play recording before the session has started"),
        }
    }

    pub fn stop_voice(&mut self) {
        if let Some(context) = &self.context {
            self.voice.stop_playback(&mut context.graph());
        }
    }

    pub fn voice_state(&self) -> VoiceState {
        self.voice.state()
    }

    pub fn has_recording(&self) -> bool {
        self.voice.has_buffer()
    }

    pub fn recording(&self) -> Option<&RecordedBuffer> {
        self.voice.buffer()
    }

    /// Service the engine: collect recorded audio, install finished
    /// loads, build missing nodes and apply the play state
    ///
    /// Returns the events raised since the last call.
    pub fn tick(&mut self) -> Vec<EngineEvent> {
        self.pump();
        std::mem::take(&mut self.events)
    }

    /// Block until no music load is in flight, then tick
    pub fn settle(&mut self) -> Vec<EngineEvent> {
        while self.music.pending.is_some() {
            self.voice.poll();
            match self.loader.recv_timeout(SETTLE_POLL) {
                Some(result) => self.handle_load(result),
                None if !self.loader.is_alive() => {
                    log::error!("Asset loader stopped with a load in flight");
                    self.music.pending = None;
                    self.music.failed = true;
                }
                None => {}
            }
        }
        self.tick()
    }

    fn pump(&mut self) {
        self.voice.poll();
        if let Some(context) = &self.context {
            self.voice.reap(&mut context.graph());
        }
        while let Some(result) = self.loader.try_recv() {
            self.handle_load(result);
        }
        self.build_nodes();
        self.apply_play_state();
    }

    fn handle_load(&mut self, result: LoadResult) {
        let LoadResult {
            track,
            generation,
            outcome,
        } = result;

        let current = self.music.pending.as_ref().map(|t| t.generation());
        if current != Some(generation) {
            // Superseded; dropping the outcome releases the decoded audio
            log::debug!("Discarding stale load of '{}'", track.id);
            return;
        }
        self.music.pending = None;

        match outcome {
            LoadOutcome::Loaded(buffer) => {
                let Some(context) = &self.context else {
                    log::warn!("Loaded '{}' with no context to install into", track.id);
                    return;
                };
                let node =
                    MusicNode::install(&mut context.graph(), &track.id, buffer, self.mix.music_volume);
                self.music.node = Some(node);
                self.emit(EngineEvent::TrackReady {
                    slot: Slot::Music,
                    track_id: track.id,
                });
            }
            LoadOutcome::Failed(error) => {
                log::error!("Failed to load music track '{}': {}", track.id, error);
                self.music.failed = true;
                self.emit(EngineEvent::TrackLoadFailed {
                    slot: Slot::Music,
                    track_id: track.id,
                    error,
                });
            }
            LoadOutcome::Cancelled => {
                log::debug!("Load of '{}' was cancelled", track.id);
            }
        }
    }

    /// Lazily build nodes for bound tracks once a context exists
    fn build_nodes(&mut self) {
        let Some(context) = &self.context else {
            return;
        };

        if let Some(track) = &self.music.track {
            if self.music.node.is_none() && self.music.pending.is_none() && !self.music.failed {
                self.next_generation += 1;
                let token = LoadToken::new(self.next_generation);
                self.music.pending = Some(token.clone());
                self.loader.request(track.clone(), token);
            }
        }

        let mut ready = None;
        let track = self.binaural.track.as_ref().filter(|_| self.binaural.node.is_none());
        if let Some(track) = track {
            let beat = track.frequency.unwrap_or_default();
            let pair = BinauralPair::build(
                &mut context.graph(),
                self.config.base_frequency,
                beat,
                self.mix.binaural_volume,
                self.waveform,
            );
            self.binaural.node = Some(pair);
            ready = Some(track.id.clone());
        }
        if let Some(track_id) = ready {
            self.emit(EngineEvent::TrackReady {
                slot: Slot::Binaural,
                track_id,
            });
        }
    }

    fn apply_play_state(&self) {
        if let Some(node) = &self.music.node {
            if self.active {
                node.play();
            } else {
                node.pause();
            }
        }

        if !self.active {
            return;
        }
        if let Some(pair) = &self.binaural.node {
            if pair.state() == OscillatorState::Unstarted {
                if let Err(e) = pair.start() {
                    log::warn!("Binaural start rejected: {}", e);
                }
            }
        }
    }

    fn check_track(&self, slot: Slot, track: &Track) -> Result<(), TrackLoadError> {
        track.validate()?;
        if track.kind != slot.kind() {
            return Err(TrackLoadError::InvalidTrack(
                track.id.clone(),
                format!("cannot play a {:?} track in the {} slot", track.kind, slot),
            ));
        }
        Ok(())
    }

    fn clear_music(&mut self) {
        if let Some(token) = self.music.pending.take() {
            log::debug!("Cancelling load generation {}", token.generation());
            token.cancel();
        }
        if let Some(node) = self.music.node.take() {
            self.with_graph(|graph| node.teardown(graph));
        }
        self.music.track = None;
        self.music.failed = false;
    }

    fn clear_binaural(&mut self) {
        if let Some(pair) = self.binaural.node.take() {
            self.with_graph(|graph| pair.teardown(graph));
        }
        self.binaural.track = None;
    }

    fn with_graph<F: FnOnce(&mut Graph)>(&self, f: F) {
        if let Some(context) = &self.context {
            let mut graph = context.graph();
            f(&mut *graph);
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        if let Some(listener) = self.listener.as_mut() {
            listener(&event);
        }
        self.events.push(event);
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(|c| c.id())
    }

    pub fn context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    /// Number of installed slot nodes (music and binaural)
    pub fn live_node_count(&self) -> usize {
        usize::from(self.music.node.is_some()) + usize::from(self.binaural.node.is_some())
    }

    /// Whether a music load is in flight
    pub fn is_loading(&self) -> bool {
        self.music.pending.is_some()
    }

    /// (left, right) oscillator frequencies of the installed pair
    pub fn binaural_frequencies(&self) -> Option<(f32, f32)> {
        self.binaural.node.as_ref().map(|p| p.frequencies())
    }

    pub fn binaural_state(&self) -> Option<OscillatorState> {
        self.binaural.node.as_ref().map(|p| p.state())
    }

    /// Current gain of a slot's bus, `None` while it has no bus
    pub fn gain(&self, slot: VolumeSlot) -> Option<f32> {
        match slot {
            VolumeSlot::Music => self.music.node.as_ref().map(|n| n.bus().value()),
            VolumeSlot::Binaural => self.binaural.node.as_ref().map(|p| p.bus().value()),
            VolumeSlot::Recording => self.voice.gain(),
        }
    }

    pub fn music_node(&self) -> Option<&MusicNode> {
        self.music.node.as_ref()
    }

    pub fn binaural_node(&self) -> Option<&BinauralPair> {
        self.binaural.node.as_ref()
    }

    /// Set the session length and rewind the countdown
    pub fn set_session_length(&mut self, length: Duration) {
        self.timer.reset(Some(length));
        if self.active {
            self.timer.resume();
        }
    }

    pub fn timer(&self) -> &SessionTimer {
        &self.timer
    }

    /// Active time so far
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::audio::OfflineBackend;
    use crate::music::tests::temp_asset;
    use crate::track::catalog;

    const RATE: u32 = 8_000;

    fn engine_with(asset_root: PathBuf) -> (SessionEngine, OfflineBackend) {
        let backend = OfflineBackend::new(RATE);
        let config = EngineConfig {
            asset_root,
            capture_seconds: 2.0,
            ..EngineConfig::default()
        };
        (SessionEngine::new(config, Box::new(backend.clone())), backend)
    }

    fn cosmic_flow() -> Track {
        Track::music("cosmic-flow", "Cosmic Flow", "/audio/cosmic-flow.wav")
    }

    fn theta() -> Track {
        catalog::find("theta").unwrap()
    }

    fn delta() -> Track {
        catalog::find("delta").unwrap()
    }

    #[test]
    fn test_start_builds_both_nodes() {
        let root = temp_asset("cosmic-flow.wav", 1.0);
        let (mut engine, backend) = engine_with(root);

        engine.set_track(Slot::Music, cosmic_flow());
        engine.set_track(Slot::Binaural, theta());
        assert_eq!(engine.live_node_count(), 0);

        engine.start().unwrap();
        let events = engine.settle();
        assert_eq!(events.len(), 2);

        assert_eq!(engine.live_node_count(), 2);
        assert_eq!(engine.binaural_frequencies(), Some((200.0, 206.0)));
        assert_eq!(engine.binaural_state(), Some(OscillatorState::Playing));
        assert_eq!(engine.gain(VolumeSlot::Music), Some(0.4));
        assert_eq!(engine.gain(VolumeSlot::Binaural), Some(0.3));
        assert!(engine.music_node().unwrap().is_playing());

        let out = backend.render_frames(800);
        assert!(out.iter().any(|&s| s.abs() > 0.01));
    }

    #[test]
    fn test_volume_applies_and_persists() {
        let root = temp_asset("vol.wav", 0.5);
        let (mut engine, _backend) = engine_with(root);
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();

        for v in [0.0f32, 0.25, 0.8, 1.0] {
            engine.set_volume(VolumeSlot::Binaural, v);
            assert_eq!(engine.gain(VolumeSlot::Binaural), Some(v));
        }

        engine.set_volume(VolumeSlot::Binaural, 0.65);
        engine.set_track(Slot::Music, Track::music("vol", "Vol", "/audio/vol.wav"));
        engine.settle();
        assert_eq!(engine.gain(VolumeSlot::Binaural), Some(0.65));

        // Persisted for the next node too
        engine.set_volume(VolumeSlot::Binaural, 1.5);
        engine.set_track(Slot::Binaural, delta());
        assert_eq!(engine.gain(VolumeSlot::Binaural), Some(1.0));
        assert_eq!(engine.mix().binaural_volume, 1.0);
    }

    #[test]
    fn test_binaural_swap_replaces_pair_once() {
        let (mut engine, backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();

        let old_ids = engine.binaural_node().unwrap().source_ids().to_vec();
        let context = engine.context_id();

        engine.set_track(Slot::Binaural, delta());
        let graph_sources = engine.context().unwrap().graph().source_count();
        assert_eq!(graph_sources, 2);
        {
            let ctx = engine.context().unwrap();
            let graph = ctx.graph();
            assert!(old_ids.iter().all(|id| !graph.contains_source(*id)));
            assert_eq!(graph.bus_count(), 1);
        }

        assert_eq!(engine.binaural_frequencies(), Some((200.0, 202.5)));
        assert_eq!(engine.binaural_state(), Some(OscillatorState::Playing));
        assert_eq!(engine.context_id(), context);
        assert!(backend.render_frames(100).iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_stop_start_keeps_context() {
        let root = temp_asset("pause.wav", 1.0);
        let (mut engine, backend) = engine_with(root);
        engine.set_track(Slot::Music, Track::music("pause", "Pause", "/audio/pause.wav"));
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();
        engine.settle();
        let id = engine.context_id();
        assert!(id.is_some());

        backend.render_frames(800);
        let position = engine.music_node().unwrap().position_seconds();
        assert!(position > 0.0);

        engine.stop();
        assert!(!engine.is_active());
        assert_eq!(engine.live_node_count(), 2);
        assert!(backend.render_frames(800).iter().all(|&s| s == 0.0));
        assert_eq!(engine.music_node().unwrap().position_seconds(), position);

        engine.start().unwrap();
        assert_eq!(engine.context_id(), id);
        assert_eq!(backend.outputs_opened(), 1);
        assert_eq!(engine.binaural_state(), Some(OscillatorState::Playing));
        backend.render_frames(800);
        assert!(engine.music_node().unwrap().position_seconds() > position);
    }

    #[test]
    fn test_context_unavailable_is_retryable() {
        let (mut engine, backend) = engine_with(PathBuf::from("/nonexistent"));
        backend.deny_output("no output device");
        engine.set_track(Slot::Binaural, theta());

        let err = engine.start().unwrap_err();
        assert!(err.reason.contains("no output device"));
        assert!(!engine.is_active());
        assert_eq!(engine.context_id(), None);
        assert_eq!(engine.live_node_count(), 0);

        backend.allow_output();
        engine.start().unwrap();
        assert_eq!(engine.live_node_count(), 1);
    }

    #[test]
    fn test_microphone_denied_leaves_slots_alone() {
        let root = temp_asset("mic.wav", 0.5);
        let (mut engine, backend) = engine_with(root);
        engine.set_track(Slot::Music, Track::music("mic", "Mic", "/audio/mic.wav"));
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();
        engine.settle();

        backend.deny_input("permission denied");
        assert!(engine.record_voice().is_err());

        assert_eq!(engine.live_node_count(), 2);
        assert_eq!(engine.binaural_frequencies(), Some((200.0, 206.0)));
        assert_eq!(engine.gain(VolumeSlot::Music), Some(0.4));
        assert!(engine.music_node().unwrap().is_playing());
        assert_eq!(engine.voice_state(), VoiceState::Idle);
        assert!(!backend.input_open());
    }

    #[test]
    fn test_recording_round_trip() {
        let (mut engine, backend) = engine_with(PathBuf::from("/nonexistent"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_event(move |event| sink.lock().unwrap().push(event.clone()));

        engine.start().unwrap();
        engine.record_voice().unwrap();
        assert_eq!(engine.voice_state(), VoiceState::Recording);

        let clip: Vec<f32> = (0..4_000).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        for chunk in clip.chunks(500) {
            backend.push_capture(chunk);
            engine.tick();
        }
        let buffer = engine.stop_recording_voice().unwrap();
        assert_eq!(buffer.frames(), 4_000);
        assert!(!backend.input_open());
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [EngineEvent::RecordingComplete(_)]
        ));

        engine.play_voice(true);
        assert_eq!(engine.voice_state(), VoiceState::Playing);
        assert_eq!(engine.gain(VolumeSlot::Recording), Some(0.5));
        engine.stop_voice();
        assert_eq!(engine.voice_state(), VoiceState::Idle);
        assert_eq!(engine.context().unwrap().graph().source_count(), 0);

        engine.play_voice(true);
        assert_eq!(engine.voice_state(), VoiceState::Playing);
        assert_eq!(engine.context().unwrap().graph().source_count(), 1);
        assert!(backend.render_frames(200).iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_recording_overflow_is_reported() {
        let (mut engine, backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.record_voice().unwrap();

        // 2 s ring at 8 kHz, 5 s of audio and no tick in between
        assert_eq!(backend.push_capture(&vec![0.1; 40_000]), 16_000);
        let err = engine.stop_recording_voice().unwrap_err();
        assert_eq!(err, DecodeError::Overrun(24_000));
        assert!(matches!(
            engine.tick().as_slice(),
            [EngineEvent::RecordingFailed(DecodeError::Overrun(24_000))]
        ));
        assert!(!engine.has_recording());
        assert!(!backend.input_open());
    }

    #[test]
    fn test_superseded_load_is_discarded() {
        let root = temp_asset("first.wav", 0.5);
        std::fs::copy(root.join("audio/first.wav"), root.join("audio/second.wav")).unwrap();
        let (mut engine, _backend) = engine_with(root);
        engine.start().unwrap();

        engine.set_track(Slot::Music, Track::music("first", "First", "/audio/first.wav"));
        engine.set_track(Slot::Music, Track::music("second", "Second", "/audio/second.wav"));
        let events = engine.settle();

        assert_eq!(engine.live_node_count(), 1);
        assert_eq!(engine.music_node().unwrap().track_id(), "second");
        assert_eq!(engine.context().unwrap().graph().bus_count(), 1);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::TrackReady { track_id, .. }] if track_id == "second"
        ));
    }

    #[test]
    fn test_failed_load_leaves_slot_empty() {
        let (mut engine, _backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();
        engine.tick();

        engine.set_track(Slot::Music, Track::music("gone", "Gone", "/audio/gone.mp3"));
        let events = engine.settle();
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::TrackLoadFailed { slot: Slot::Music, error: TrackLoadError::NotFound(_), .. }]
        ));
        assert!(engine.music_node().is_none());
        assert!(!engine.is_loading());
        assert_eq!(engine.live_node_count(), 1);

        // No automatic retry
        assert!(engine.tick().is_empty());
        assert!(!engine.is_loading());

        // An explicit call retries
        engine.set_track(Slot::Music, Track::music("gone", "Gone", "/audio/gone.mp3"));
        assert!(engine.is_loading());
        engine.settle();
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let (mut engine, _backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.set_track(Slot::Music, theta());
        let events = engine.tick();
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::TrackLoadFailed { error: TrackLoadError::InvalidTrack(..), .. }]
        ));
        assert!(engine.track(Slot::Music).is_none());
    }

    #[test]
    fn test_stray_fields_rejected() {
        let (mut engine, _backend) = engine_with(PathBuf::from("/nonexistent"));
        let mut track = theta();
        track.url = Some("/audio/theta.mp3".to_string());
        engine.set_track(Slot::Binaural, track);
        assert!(matches!(
            engine.tick().as_slice(),
            [EngineEvent::TrackLoadFailed { slot: Slot::Binaural, error: TrackLoadError::InvalidTrack(..), .. }]
        ));
        assert!(engine.track(Slot::Binaural).is_none());
    }

    #[test]
    fn test_waveform_applies_to_new_pairs() {
        let (mut engine, _backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.set_binaural_waveform(Waveform::Square);
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();
        assert_eq!(engine.binaural_node().unwrap().waveform(), Waveform::Square);

        // The running pair keeps its shape until it is rebuilt
        engine.set_binaural_waveform(Waveform::Triangle);
        assert_eq!(engine.binaural_node().unwrap().waveform(), Waveform::Square);
        engine.set_track(Slot::Binaural, delta());
        assert_eq!(engine.binaural_node().unwrap().waveform(), Waveform::Triangle);
        assert_eq!(engine.binaural_frequencies(), Some((200.0, 202.5)));
    }

    #[test]
    fn test_dispose_releases_everything() {
        let root = temp_asset("bye.wav", 0.5);
        let (mut engine, backend) = engine_with(root);
        engine.set_track(Slot::Music, Track::music("bye", "Bye", "/audio/bye.wav"));
        engine.set_track(Slot::Binaural, theta());
        engine.start().unwrap();
        engine.settle();
        engine.record_voice().unwrap();
        assert!(backend.input_open());

        engine.dispose();
        assert!(!backend.input_open());
        assert!(!backend.output_open());
        assert_eq!(engine.live_node_count(), 0);
        assert_eq!(engine.context_id(), None);

        drop(engine);
        assert!(!backend.output_open());
    }

    #[test]
    fn test_timer_runs_only_while_active() {
        let (mut engine, _backend) = engine_with(PathBuf::from("/nonexistent"));
        engine.set_session_length(Duration::from_secs(300));
        assert!(!engine.timer().is_running());
        engine.start().unwrap();
        assert!(engine.timer().is_running());
        engine.stop();
        assert!(!engine.timer().is_running());
        assert_eq!(engine.timer().duration(), Duration::from_secs(300));
    }
}
