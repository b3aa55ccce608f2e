//! Voice recorder and player
//!
//! ```text
//!  Idle ──record──▶ Recording ──stop──▶ Idle(with buffer) ──play──▶ Playing
//!                                              ▲                       │
//!                                              └──────stop / end───────┘
//! ```
//!
//! While recording, the input callback pushes samples into a ring buffer
//! and `poll` moves them into chunks. Stopping releases the microphone
//! first, drains what is left, packs the chunks into one WAV blob and
//! decodes it into the buffer that playback uses.
//!
//! Playback gets its own gain bus, created on first play and reused. Each
//! play connects a fresh buffer source; there is never more than one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ringbuf::traits::Consumer;

use crate::audio::decode::{decode, encode_wav};
use crate::audio::{
    AudioBackend, AudioBuffer, Capture, GainBus, Graph, RecordedBuffer, Source, SourceId,
    SourceLayout,
};
use crate::error::{DecodeError, MicrophoneUnavailable};
use crate::track::clamp_volume;

/// What the recorder is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Not recording or playing; a buffer may or may not exist
    Idle,
    Recording,
    Playing,
}

/// Audio-thread side of one playback
struct BufferVoice {
    buffer: RecordedBuffer,
    position: f64,
    looped: bool,
    finished: Arc<AtomicBool>,
}

impl Source for BufferVoice {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Stereo
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32], sample_rate: f32) {
        if self.finished.load(Ordering::Relaxed) {
            return;
        }
        let frames = self.buffer.frames() as f64;
        let step = self.buffer.sample_rate() as f64 / sample_rate as f64;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            if self.position >= frames {
                if self.looped && frames > 0.0 {
                    self.position %= frames;
                } else {
                    self.finished.store(true, Ordering::Relaxed);
                    return;
                }
            }
            let (sl, sr) = self.buffer.sample_at(self.position, self.looped);
            *l = sl;
            *r = sr;
            self.position += step;
        }
    }
}

struct ActivePlayback {
    source_id: SourceId,
    finished: Arc<AtomicBool>,
}

struct ActiveCapture {
    capture: Capture,
    chunks: Vec<Vec<f32>>,
    /// Dropped-sample count already warned about
    reported_drops: usize,
}

impl ActiveCapture {
    fn drain(&mut self) {
        let chunk: Vec<f32> = self.capture.consumer.pop_iter().collect();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }

        let dropped = self.capture.dropped.load(Ordering::Relaxed);
        if dropped > self.reported_drops {
            log::warn!(
                "Capture buffer overflowed, {} samples lost so far",
                dropped
            );
            self.reported_drops = dropped;
        }
    }
}

/// Records one voice clip and plays it back
pub struct VoiceRecorder {
    capture: Option<ActiveCapture>,
    buffer: Option<RecordedBuffer>,
    bus: Option<GainBus>,
    playback: Option<ActivePlayback>,
    volume: f32,
}

impl VoiceRecorder {
    pub fn new(volume: f32) -> Self {
        Self {
            capture: None,
            buffer: None,
            bus: None,
            playback: None,
            volume: clamp_volume(volume),
        }
    }

    pub fn state(&self) -> VoiceState {
        if self.capture.is_some() {
            VoiceState::Recording
        } else if self.is_playing() {
            VoiceState::Playing
        } else {
            VoiceState::Idle
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.finished.load(Ordering::Relaxed))
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&RecordedBuffer> {
        self.buffer.as_ref()
    }

    /// Gain of the playback bus, once it exists
    pub fn gain(&self) -> Option<f32> {
        self.bus.as_ref().map(|b| b.value())
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Store the playback volume and apply it live if the bus exists
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
        if let Some(bus) = &self.bus {
            bus.set_value(self.volume);
        }
    }

    /// Open the microphone and start collecting audio
    ///
    /// Already recording is a no-op.
    pub fn start_recording(
        &mut self,
        backend: &dyn AudioBackend,
        device: Option<&str>,
        capture_seconds: f32,
    ) -> Result<(), MicrophoneUnavailable> {
        if self.capture.is_some() {
            log::warn!("Already recording, ignoring record request");
            return Ok(());
        }

        let capture = backend
            .open_input(device, capture_seconds)
            .map_err(|e| MicrophoneUnavailable {
                reason: e.to_string(),
            })?;

        log::info!(
            "Recording started ({} Hz, {} ch)",
            capture.sample_rate,
            capture.channels
        );
        self.capture = Some(ActiveCapture {
            capture,
            chunks: Vec::new(),
            reported_drops: 0,
        });
        Ok(())
    }

    /// Move captured audio out of the ring into chunks
    ///
    /// Must be called often enough that the ring never fills up.
    pub fn poll(&mut self) {
        if let Some(active) = &mut self.capture {
            active.drain();
        }
    }

    /// Finish the recording and decode it into the playback buffer
    ///
    /// The previous buffer is discarded whether or not the new one
    /// decodes, and any playback of it is stopped first. A capture that
    /// lost samples to a full ring is rejected with `Overrun`.
    pub fn stop_recording(&mut self, graph: Option<&mut Graph>) -> Result<RecordedBuffer, DecodeError> {
        let Some(active) = self.capture.take() else {
            return Err(DecodeError::NotRecording);
        };
        let ActiveCapture { capture, mut chunks, .. } = active;
        let Capture {
            stream,
            mut consumer,
            dropped,
            sample_rate,
            channels,
        } = capture;

        // Release the device before anything that can fail
        drop(stream);
        log::info!("Microphone released");

        let tail: Vec<f32> = consumer.pop_iter().collect();
        if !tail.is_empty() {
            chunks.push(tail);
        }

        if let Some(graph) = graph {
            self.stop_playback(graph);
        }
        self.playback = None;
        self.buffer = None;

        let lost = dropped.load(Ordering::Relaxed);
        if lost > 0 {
            log::error!("Recording discarded, {} samples lost to a full capture buffer", lost);
            return Err(DecodeError::Overrun(lost));
        }

        let samples = chunks.concat();
        if samples.is_empty() {
            log::error!("Recording captured no audio");
            return Err(DecodeError::Empty);
        }

        let blob = encode_wav(&samples, sample_rate, channels).map_err(|e| {
            log::error!("Failed to encode recording: {}", e);
            DecodeError::Encode(e.to_string())
        })?;
        let decoded: AudioBuffer = decode(blob, Some("wav")).map_err(|e| {
            log::error!("Failed to decode recording: {}", e);
            DecodeError::from(e)
        })?;

        log::info!(
            "Recording complete: {:.1}s",
            decoded.duration().as_secs_f32()
        );
        let buffer = Arc::new(decoded);
        self.buffer = Some(Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Play the recorded buffer through the voice bus
    ///
    /// Any playback already running is stopped and disconnected first.
    /// Returns false (and does nothing) if there is no buffer.
    pub fn play(&mut self, graph: &mut Graph, looped: bool) -> bool {
        let Some(buffer) = self.buffer.clone() else {
            log::warn!("No recording to play");
            return false;
        };

        self.stop_playback(graph);

        let bus = match &self.bus {
            Some(bus) if graph.contains_bus(bus.id()) => bus.clone(),
            _ => {
                let bus = graph.add_bus(self.volume);
                self.bus = Some(bus.clone());
                bus
            }
        };

        let finished = Arc::new(AtomicBool::new(false));
        let voice = BufferVoice {
            buffer,
            position: 0.0,
            looped,
            finished: Arc::clone(&finished),
        };
        match graph.connect(&bus, Box::new(voice), None) {
            Some(source_id) => {
                self.playback = Some(ActivePlayback {
                    source_id,
                    finished,
                });
                log::info!("Voice playback started (loop: {})", looped);
                true
            }
            None => {
                log::error!("Voice bus missing from graph");
                false
            }
        }
    }

    /// Stop and disconnect the active playback, keeping the buffer
    pub fn stop_playback(&mut self, graph: &mut Graph) {
        if let Some(playback) = self.playback.take() {
            playback.finished.store(true, Ordering::Relaxed);
            graph.disconnect_source(playback.source_id);
            log::info!("Voice playback stopped");
        }
    }

    /// Disconnect a playback that ran to its end
    pub fn reap(&mut self, graph: &mut Graph) {
        if self
            .playback
            .as_ref()
            .is_some_and(|p| p.finished.load(Ordering::Relaxed))
        {
            self.stop_playback(graph);
        }
    }

    /// Release everything: microphone, playback and bus
    pub fn dispose(&mut self, graph: Option<&mut Graph>) {
        if self.capture.take().is_some() {
            log::info!("Microphone released");
        }
        match graph {
            Some(graph) => {
                self.stop_playback(graph);
                if let Some(bus) = self.bus.take() {
                    graph.disconnect_bus(bus.id());
                }
            }
            None => {
                self.playback = None;
                self.bus = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OfflineBackend;

    fn tone(frames: usize) -> Vec<f32> {
        (0..frames).map(|i| ((i % 16) as f32 / 16.0) - 0.5).collect()
    }

    fn recorded(backend: &OfflineBackend, recorder: &mut VoiceRecorder, frames: usize) -> RecordedBuffer {
        recorder.start_recording(backend, None, 2.0).unwrap();
        let samples = tone(frames);
        for chunk in samples.chunks(1_000) {
            backend.push_capture(chunk);
            recorder.poll();
        }
        recorder.stop_recording(None).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        assert_eq!(recorder.state(), VoiceState::Idle);

        let buffer = recorded(&backend, &mut recorder, 4_000);
        assert_eq!(buffer.frames(), 4_000);
        assert_eq!(buffer.sample_rate(), 8_000);
        assert!((buffer.frame(5).0 - tone(6)[5]).abs() < 1e-3);

        assert!(recorder.has_buffer());
        assert_eq!(recorder.state(), VoiceState::Idle);
        assert!(!backend.input_open());
    }

    #[test]
    fn test_stop_without_recording() {
        let mut recorder = VoiceRecorder::new(0.5);
        assert_eq!(recorder.stop_recording(None), Err(DecodeError::NotRecording));
    }

    #[test]
    fn test_empty_recording_discards_previous_buffer() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorded(&backend, &mut recorder, 800);
        assert!(recorder.has_buffer());

        recorder.start_recording(&backend, None, 1.0).unwrap();
        assert_eq!(recorder.state(), VoiceState::Recording);
        assert_eq!(recorder.stop_recording(None), Err(DecodeError::Empty));
        assert!(!recorder.has_buffer());
        assert!(!backend.input_open());
    }

    #[test]
    fn test_overflow_without_polling_is_reported() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorded(&backend, &mut recorder, 800);

        // 1 s ring, 3 s of audio and nobody draining it
        recorder.start_recording(&backend, None, 1.0).unwrap();
        backend.push_capture(&vec![0.25; 24_000]);
        assert_eq!(recorder.stop_recording(None), Err(DecodeError::Overrun(16_000)));
        assert!(!recorder.has_buffer());
        assert!(!backend.input_open());
    }

    #[test]
    fn test_polling_keeps_long_recordings_whole() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorder.start_recording(&backend, None, 1.0).unwrap();
        for _ in 0..6 {
            assert_eq!(backend.push_capture(&vec![0.25; 4_000]), 4_000);
            recorder.poll();
        }
        assert_eq!(recorder.stop_recording(None).unwrap().frames(), 24_000);
    }

    #[test]
    fn test_denied_microphone() {
        let backend = OfflineBackend::new(8_000);
        backend.deny_input("permission denied");
        let mut recorder = VoiceRecorder::new(0.5);
        let err = recorder.start_recording(&backend, None, 1.0).unwrap_err();
        assert!(err.reason.contains("permission denied"));
        assert_eq!(recorder.state(), VoiceState::Idle);
    }

    #[test]
    fn test_single_playback_source() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorded(&backend, &mut recorder, 1_600);

        let mut graph = Graph::new(5.0);
        assert!(recorder.play(&mut graph, true));
        assert!(recorder.play(&mut graph, true));
        assert_eq!(graph.source_count(), 1);
        assert_eq!(graph.bus_count(), 1);
        assert_eq!(recorder.state(), VoiceState::Playing);
        assert_eq!(recorder.gain(), Some(0.5));

        recorder.stop_playback(&mut graph);
        assert_eq!(graph.source_count(), 0);
        assert_eq!(recorder.state(), VoiceState::Idle);
        assert!(recorder.has_buffer());

        // Replay after stop reuses the bus
        assert!(recorder.play(&mut graph, false));
        assert_eq!(graph.source_count(), 1);
        assert_eq!(graph.bus_count(), 1);
    }

    #[test]
    fn test_one_shot_playback_ends() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(1.0);
        recorded(&backend, &mut recorder, 100);

        let mut graph = Graph::new(0.0);
        recorder.play(&mut graph, false);
        let mut l = vec![0.0; 256];
        let mut r = vec![0.0; 256];
        graph.process(&mut l, &mut r, 8_000.0);
        assert!(l[150..].iter().all(|&s| s == 0.0));

        assert_eq!(recorder.state(), VoiceState::Idle);
        recorder.reap(&mut graph);
        assert_eq!(graph.source_count(), 0);
    }

    #[test]
    fn test_play_without_buffer() {
        let mut graph = Graph::new(5.0);
        let mut recorder = VoiceRecorder::new(0.5);
        assert!(!recorder.play(&mut graph, true));
        assert_eq!(graph.bus_count(), 0);
    }

    #[test]
    fn test_live_volume() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorder.set_volume(0.9);
        assert_eq!(recorder.gain(), None);

        recorded(&backend, &mut recorder, 800);
        let mut graph = Graph::new(5.0);
        recorder.play(&mut graph, true);
        assert_eq!(recorder.gain(), Some(0.9));
        recorder.set_volume(2.0);
        assert_eq!(recorder.gain(), Some(1.0));
    }

    #[test]
    fn test_dispose_releases_everything() {
        let backend = OfflineBackend::new(8_000);
        let mut recorder = VoiceRecorder::new(0.5);
        recorded(&backend, &mut recorder, 800);
        let mut graph = Graph::new(5.0);
        recorder.play(&mut graph, true);
        recorder.start_recording(&backend, None, 1.0).unwrap();

        recorder.dispose(Some(&mut graph));
        assert!(!backend.input_open());
        assert_eq!(graph.bus_count(), 0);
        assert_eq!(recorder.state(), VoiceState::Idle);
    }
}
