//! Platform audio backends
//!
//! The engine never talks to audio hardware directly. It asks an
//! `AudioBackend` for an output stream (to drive a `Renderer`) and for an
//! input stream (to fill a capture ring buffer). Two implementations:
//!
//! - `CpalBackend` - real devices through cpal
//! - `OfflineBackend` - no hardware; output is pulled by the caller and
//!   microphone input is pushed by the caller. Used for tests and for
//!   headless runs.
//!
//! Dropping a stream handle releases the underlying hardware, so every
//! exit path (including errors and panics) gives the device back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ringbuf::traits::{Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::context::Renderer;
use crate::error::BackendError;

/// A running output stream
pub trait OutputStream {
    fn play(&self) -> Result<(), BackendError>;
    fn pause(&self) -> Result<(), BackendError>;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// A running input stream; dropping it releases the device
pub trait InputStream {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// An open microphone: the stream plus the ring it writes into
pub struct Capture {
    pub stream: Box<dyn InputStream>,
    /// Interleaved f32 samples pushed by the input callback
    pub consumer: HeapCons<f32>,
    /// Samples the input callback had to drop because the ring was full
    pub dropped: Arc<AtomicUsize>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Source of output and input streams
pub trait AudioBackend {
    /// Open an output stream that pulls audio from `renderer`
    fn open_output(
        &self,
        device: Option<&str>,
        renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>, BackendError>;

    /// Open the microphone with a ring holding `capture_seconds` of audio
    fn open_input(&self, device: Option<&str>, capture_seconds: f32) -> Result<Capture, BackendError>;
}

/// Ring capacity in samples for a capture window
pub fn capture_capacity(sample_rate: u32, channels: u16, capture_seconds: f32) -> usize {
    let samples = sample_rate as f32 * channels as f32 * capture_seconds.max(0.0);
    (samples as usize).max(1)
}

/// Writing half of a capture ring
///
/// Only whole frames go in. When the ring is full the rest of the block
/// is dropped and counted, so channels never slip out of alignment.
pub struct CaptureWriter {
    producer: HeapProd<f32>,
    channels: usize,
    dropped: Arc<AtomicUsize>,
}

impl CaptureWriter {
    /// Push interleaved samples, converting each; returns how many went in
    pub fn push<T: Copy>(&mut self, data: &[T], to_f32: impl Fn(T) -> f32) -> usize {
        let whole = data.len() - data.len() % self.channels;
        let vacant = self.producer.vacant_len();
        let accepted = whole.min(vacant - vacant % self.channels);
        for &s in &data[..accepted] {
            let _ = self.producer.try_push(to_f32(s));
        }

        let dropped = data.len() - accepted;
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        accepted
    }

    /// Shared count of dropped samples
    pub fn dropped(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.dropped)
    }
}

/// Ring buffer halves for a capture window
pub fn capture_ring(sample_rate: u32, channels: u16, capture_seconds: f32) -> (CaptureWriter, HeapCons<f32>) {
    let (producer, consumer) = HeapRb::<f32>::new(capture_capacity(sample_rate, channels, capture_seconds)).split();
    let writer = CaptureWriter {
        producer,
        channels: channels.max(1) as usize,
        dropped: Arc::new(AtomicUsize::new(0)),
    };
    (writer, consumer)
}

struct OfflineOutputSlot {
    id: u64,
    renderer: Renderer,
    playing: bool,
}

#[derive(Default)]
struct OfflineState {
    output: Option<OfflineOutputSlot>,
    capture: Option<(u64, CaptureWriter)>,
    deny_output: Option<String>,
    deny_input: Option<String>,
    next_id: u64,
    outputs_opened: usize,
    inputs_opened: usize,
}

/// Hardware-free backend
///
/// Clones share state, so a test can hand one clone to the engine and
/// keep another to render output and feed the "microphone".
#[derive(Clone)]
pub struct OfflineBackend {
    state: Arc<Mutex<OfflineState>>,
    sample_rate: u32,
    input_channels: u16,
}

impl OfflineBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(OfflineState::default())),
            sample_rate: sample_rate.max(1),
            input_channels: 1,
        }
    }

    fn state(&self) -> MutexGuard<'_, OfflineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next output opens fail, as if the platform refused
    pub fn deny_output(&self, reason: &str) {
        self.state().deny_output = Some(reason.to_string());
    }

    pub fn allow_output(&self) {
        self.state().deny_output = None;
    }

    /// Make microphone opens fail, as if permission was refused
    pub fn deny_input(&self, reason: &str) {
        self.state().deny_input = Some(reason.to_string());
    }

    pub fn allow_input(&self) {
        self.state().deny_input = None;
    }

    /// Pull `frames` stereo frames from the open output
    ///
    /// Returns interleaved silence when no output is open or it is paused.
    pub fn render_frames(&self, frames: usize) -> Vec<f32> {
        let mut data = vec![0.0f32; frames * 2];
        let mut state = self.state();
        if let Some(slot) = state.output.as_mut() {
            if slot.playing {
                slot.renderer.write(&mut data, 2);
            }
        }
        data
    }

    /// Feed samples to the open microphone; returns how many were accepted
    pub fn push_capture(&self, samples: &[f32]) -> usize {
        match self.state().capture.as_mut() {
            Some((_, writer)) => writer.push(samples, |s| s),
            None => 0,
        }
    }

    pub fn output_open(&self) -> bool {
        self.state().output.is_some()
    }

    pub fn input_open(&self) -> bool {
        self.state().capture.is_some()
    }

    pub fn outputs_opened(&self) -> usize {
        self.state().outputs_opened
    }

    pub fn inputs_opened(&self) -> usize {
        self.state().inputs_opened
    }
}

struct OfflineOutput {
    id: u64,
    state: Arc<Mutex<OfflineState>>,
    sample_rate: u32,
}

impl OfflineOutput {
    fn set_playing(&self, playing: bool) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = state.output.as_mut().filter(|s| s.id == self.id) {
            slot.playing = playing;
        }
    }
}

impl OutputStream for OfflineOutput {
    fn play(&self) -> Result<(), BackendError> {
        self.set_playing(true);
        Ok(())
    }

    fn pause(&self) -> Result<(), BackendError> {
        self.set_playing(false);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        2
    }
}

impl Drop for OfflineOutput {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.output.as_ref().is_some_and(|s| s.id == self.id) {
            state.output = None;
        }
    }
}

struct OfflineInput {
    id: u64,
    state: Arc<Mutex<OfflineState>>,
    sample_rate: u32,
    channels: u16,
}

impl InputStream for OfflineInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for OfflineInput {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.capture.as_ref().is_some_and(|(id, _)| *id == self.id) {
            state.capture = None;
        }
    }
}

impl AudioBackend for OfflineBackend {
    fn open_output(
        &self,
        _device: Option<&str>,
        mut renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>, BackendError> {
        let mut state = self.state();
        if let Some(reason) = &state.deny_output {
            return Err(BackendError::Denied(reason.clone()));
        }

        renderer.set_sample_rate(self.sample_rate);
        state.next_id += 1;
        let id = state.next_id;
        state.output = Some(OfflineOutputSlot {
            id,
            renderer,
            playing: false,
        });
        state.outputs_opened += 1;

        Ok(Box::new(OfflineOutput {
            id,
            state: Arc::clone(&self.state),
            sample_rate: self.sample_rate,
        }))
    }

    fn open_input(&self, _device: Option<&str>, capture_seconds: f32) -> Result<Capture, BackendError> {
        let mut state = self.state();
        if let Some(reason) = &state.deny_input {
            return Err(BackendError::Denied(reason.clone()));
        }

        let (writer, consumer) = capture_ring(self.sample_rate, self.input_channels, capture_seconds);
        let dropped = writer.dropped();
        state.next_id += 1;
        let id = state.next_id;
        state.capture = Some((id, writer));
        state.inputs_opened += 1;

        Ok(Capture {
            stream: Box::new(OfflineInput {
                id,
                state: Arc::clone(&self.state),
                sample_rate: self.sample_rate,
                channels: self.input_channels,
            }),
            consumer,
            dropped,
            sample_rate: self.sample_rate,
            channels: self.input_channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::{Consumer, Observer};

    #[test]
    fn test_capacity() {
        assert_eq!(capture_capacity(48_000, 1, 2.0), 96_000);
        assert_eq!(capture_capacity(48_000, 2, 0.0), 1);
    }

    #[test]
    fn test_offline_capture_and_release() {
        let backend = OfflineBackend::new(8_000);
        let mut capture = backend.open_input(None, 1.0).unwrap();
        assert!(backend.input_open());

        assert_eq!(backend.push_capture(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(capture.consumer.occupied_len(), 3);
        let mut out = [0.0; 3];
        assert_eq!(capture.consumer.pop_slice(&mut out), 3);
        assert_eq!(out, [0.1, 0.2, 0.3]);

        drop(capture.stream);
        assert!(!backend.input_open());
        assert_eq!(backend.push_capture(&[0.4]), 0);
    }

    #[test]
    fn test_full_ring_keeps_frames_whole() {
        // Room for 7 samples: three stereo frames and one spare slot
        let (mut writer, consumer) = capture_ring(7, 2, 0.5);
        assert_eq!(consumer.vacant_len(), 7);

        let block = [1.0f32, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        assert_eq!(writer.push(&block, |s| s), 6);
        assert_eq!(writer.dropped().load(Ordering::Relaxed), 2);
        assert_eq!(consumer.occupied_len(), 6);
    }

    #[test]
    fn test_overflow_is_counted() {
        let backend = OfflineBackend::new(8_000);
        let capture = backend.open_input(None, 1.0).unwrap();
        assert_eq!(backend.push_capture(&vec![0.25; 24_000]), 8_000);
        assert_eq!(capture.dropped.load(Ordering::Relaxed), 16_000);
        assert_eq!(capture.consumer.occupied_len(), 8_000);
    }

    #[test]
    fn test_denied_input() {
        let backend = OfflineBackend::new(8_000);
        backend.deny_input("permission denied");
        assert!(matches!(backend.open_input(None, 1.0), Err(BackendError::Denied(_))));
        backend.allow_input();
        assert!(backend.open_input(None, 1.0).is_ok());
        assert_eq!(backend.inputs_opened(), 1);
    }

    #[test]
    fn test_render_without_output_is_silent() {
        let backend = OfflineBackend::new(8_000);
        let out = backend.render_frames(4);
        assert_eq!(out, vec![0.0; 8]);
        assert!(!backend.output_open());
    }
}
